// Copyright 2022 The Dagkv Authors
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

//! Bulk transfer of the object graph.
//!
//! A [`Slice`] is a serialized subset of the repository's objects:
//! everything reachable from the branch heads, optionally limited to a
//! commit depth. Slices carry objects only; the branch registry itself
//! moves through the branch operations. Importing trusts the ids shipped
//! with the slice, which is sound because they were derived by a peer
//! store over the same canonical encoding.

#![expect(missing_docs)]

use std::collections::HashSet;
use std::collections::VecDeque;
use std::io;

use itertools::Itertools as _;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::Contents;
use crate::backend::ContentsId;
use crate::backend::Key;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::object_id::ObjectId as _;
use crate::wire::Wire;

/// Serialized subset of the object graph, suitable for bulk transfer.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Slice {
    pub contents: Vec<(ContentsId, Contents)>,
    pub nodes: Vec<(NodeId, Node)>,
    pub commits: Vec<(CommitId, Commit)>,
}

impl Slice {
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty() && self.nodes.is_empty() && self.commits.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.contents.len() + self.nodes.len() + self.commits.len()
    }
}

impl Wire for Slice {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.contents.encode(writer).await?;
        self.nodes.encode(writer).await?;
        self.commits.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let contents = Vec::<(ContentsId, Contents)>::decode(reader).await?;
        let nodes = Vec::<(NodeId, Node)>::decode(reader).await?;
        let commits = Vec::<(CommitId, Commit)>::decode(reader).await?;
        Ok(Self {
            contents,
            nodes,
            commits,
        })
    }
}

/// Exports everything reachable from the branch heads. `depth` bounds the
/// number of commit generations walked per head; `None` walks the full
/// history.
pub async fn export(backend: &dyn Backend, depth: Option<u64>) -> BackendResult<Slice> {
    let mut commits: Vec<(CommitId, Commit)> = vec![];
    let mut seen_commits: HashSet<CommitId> = HashSet::new();
    let mut tree_roots: Vec<Key> = vec![];

    let mut frontier: VecDeque<(CommitId, u64)> = VecDeque::new();
    for branch in backend.branch_list().await? {
        if let Some(head) = backend.branch_find(&branch).await? {
            frontier.push_back((head, 0));
        }
    }

    while let Some((id, generation)) = frontier.pop_front() {
        if depth.is_some_and(|depth| generation >= depth) {
            continue;
        }
        if !seen_commits.insert(id.clone()) {
            continue;
        }
        let commit = backend
            .commit_find(&id)
            .await?
            .ok_or_else(|| not_found("commit", &id))?;
        tree_roots.push(commit.tree.clone());
        for parent in &commit.parents {
            frontier.push_back((parent.clone(), generation + 1));
        }
        commits.push((id, commit));
    }

    let mut contents: Vec<(ContentsId, Contents)> = vec![];
    let mut nodes: Vec<(NodeId, Node)> = vec![];
    let mut seen_keys: HashSet<Key> = HashSet::new();
    let mut stack: Vec<Key> = tree_roots;
    while let Some(key) = stack.pop() {
        if !seen_keys.insert(key.clone()) {
            continue;
        }
        match key {
            Key::Contents(id) => {
                let value = backend
                    .contents_find(&id)
                    .await?
                    .ok_or_else(|| not_found("contents", &id))?;
                contents.push((id, value));
            }
            Key::Node(id) => {
                let node = backend
                    .node_find(&id)
                    .await?
                    .ok_or_else(|| not_found("node", &id))?;
                for (_, child) in node.entries() {
                    stack.push(child.clone());
                }
                nodes.push((id, node));
            }
        }
    }

    // Deterministic output regardless of walk order.
    Ok(Slice {
        contents: contents.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect(),
        nodes: nodes.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect(),
        commits: commits.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect(),
    })
}

/// Ingests a slice produced by [`export`] on a peer repository.
pub async fn import(backend: &dyn Backend, slice: Slice) -> BackendResult<()> {
    for (id, value) in slice.contents {
        backend.contents_unsafe_add(id, value).await?;
    }
    for (id, node) in slice.nodes {
        backend.node_unsafe_add(id, node).await?;
    }
    for (id, commit) in slice.commits {
        backend.commit_unsafe_add(id, commit).await?;
    }
    Ok(())
}

fn not_found(object_type: &str, id: &impl crate::object_id::ObjectId) -> BackendError {
    BackendError::ObjectNotFound {
        object_type: object_type.to_string(),
        hash: id.hex(),
    }
}
