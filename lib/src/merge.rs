// Copyright 2023 The Dagkv Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Three-way merge of stored values.
//!
//! Merging is driven by a common ancestor (`base`) between two sides. A
//! position resolves trivially when the sides agree or when only one side
//! diverged from the base; contents are opaque, so anything else is a
//! conflict. Nodes merge entry-wise and recurse into subtrees.

#![expect(missing_docs)]

use std::collections::BTreeMap;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::backend::Key;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::path::KeyPath;
use crate::path::Step;

/// Position at which a three-way merge failed to resolve.
#[derive(Clone, Debug, Eq, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("Merge conflict at {path}")]
pub struct MergeConflict {
    pub path: KeyPath,
}

/// Result of a three-way merge: the merged value, or the first conflicting
/// position. Conflicts are domain results, not store failures.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MergeOutcome<T> {
    Merged(T),
    Conflict(MergeConflict),
}

impl<T> MergeOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MergeOutcome<U> {
        match self {
            Self::Merged(value) => MergeOutcome::Merged(f(value)),
            Self::Conflict(conflict) => MergeOutcome::Conflict(conflict),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Resolves a three-way merge that requires no understanding of the values:
/// the sides agree, or exactly one side diverged from the base. Returns
/// `None` when both sides diverged in different directions.
pub fn trivial_merge<'a, T: Eq>(
    base: Option<&'a T>,
    ours: Option<&'a T>,
    theirs: Option<&'a T>,
) -> Option<Option<&'a T>> {
    if ours == theirs {
        Some(ours)
    } else if base == ours {
        Some(theirs)
    } else if base == theirs {
        Some(ours)
    } else {
        None
    }
}

/// Merges two nodes against a common base, recursing into subtrees.
///
/// `None` stands for an absent (empty) side. The merged node is written to
/// the store and its id returned; merging three absent sides yields
/// `Merged(None)`.
pub async fn merge_nodes(
    backend: &dyn Backend,
    base: Option<NodeId>,
    ours: Option<NodeId>,
    theirs: Option<NodeId>,
) -> BackendResult<MergeOutcome<Option<NodeId>>> {
    merge_nodes_at(backend, KeyPath::root(), base, ours, theirs).await
}

fn merge_nodes_at<'a>(
    backend: &'a dyn Backend,
    path: KeyPath,
    base: Option<NodeId>,
    ours: Option<NodeId>,
    theirs: Option<NodeId>,
) -> BoxFuture<'a, BackendResult<MergeOutcome<Option<NodeId>>>> {
    async move {
        if let Some(resolved) = trivial_merge(base.as_ref(), ours.as_ref(), theirs.as_ref()) {
            return Ok(MergeOutcome::Merged(resolved.cloned()));
        }

        let base_node = load_node(backend, base).await?;
        let our_node = load_node(backend, ours).await?;
        let their_node = load_node(backend, theirs).await?;

        let mut by_step: BTreeMap<Step, [Option<Key>; 3]> = BTreeMap::new();
        for (slot, node) in [base_node, our_node, their_node].into_iter().enumerate() {
            for (step, key) in node.into_entries() {
                by_step.entry(step).or_default()[slot] = Some(key);
            }
        }

        let mut entries = Vec::with_capacity(by_step.len());
        for (step, [base_key, our_key, their_key]) in by_step {
            let child_path = path.join(&step);
            let merged = match trivial_merge(base_key.as_ref(), our_key.as_ref(), their_key.as_ref())
            {
                Some(key) => key.cloned(),
                None => {
                    // Both sides changed the entry. Subtrees can still merge
                    // entry-wise; opaque contents cannot.
                    match (as_subnode(&base_key), as_subnode(&our_key), as_subnode(&their_key)) {
                        (Some(base), Some(ours), Some(theirs)) => {
                            match merge_nodes_at(backend, child_path.clone(), base, ours, theirs)
                                .await?
                            {
                                MergeOutcome::Merged(id) => id.map(Key::Node),
                                MergeOutcome::Conflict(conflict) => {
                                    return Ok(MergeOutcome::Conflict(conflict));
                                }
                            }
                        }
                        _ => {
                            return Ok(MergeOutcome::Conflict(MergeConflict { path: child_path }));
                        }
                    }
                }
            };
            if let Some(key) = merged {
                entries.push((step, key));
            }
        }

        let merged = Node::from_sorted_entries(entries);
        let id = backend.node_add(&merged).await?;
        Ok(MergeOutcome::Merged(Some(id)))
    }
    .boxed()
}

async fn load_node(backend: &dyn Backend, id: Option<NodeId>) -> BackendResult<Node> {
    match id {
        Some(id) => Ok(backend.node_find(&id).await?.unwrap_or_default()),
        None => Ok(Node::default()),
    }
}

// An absent entry or a node-kinded key can recurse as a subtree; a contents
// key cannot.
fn as_subnode(key: &Option<Key>) -> Option<Option<NodeId>> {
    match key {
        None => Some(None),
        Some(Key::Node(id)) => Some(Some(id.clone())),
        Some(Key::Contents(_)) => None,
    }
}
