// Copyright 2020 The Dagkv Authors
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

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;

use async_trait::async_trait;
use blake2::Blake2b512;
use blake2::Digest as _;
use tokio::sync::broadcast;

use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::backend::BranchEvent;
use crate::backend::BranchName;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::CommitInfo;
use crate::backend::Contents;
use crate::backend::ContentsId;
use crate::backend::Hash;
use crate::backend::Key;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::merge;
use crate::merge::MergeConflict;
use crate::merge::MergeOutcome;
use crate::merge::trivial_merge;
use crate::object_id::ObjectId as _;
use crate::path::KeyPath;
use crate::wire;

const HASH_LENGTH: usize = 64;

// Branch events buffered per subscriber before it starts losing them.
const EVENT_CAPACITY: usize = 256;

fn blake2b_hash(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    hasher.finalize().to_vec()
}

/// In-memory content-addressed backend.
///
/// Object ids are Blake2b-512 digests: raw bytes for contents, the
/// canonical wire encoding for nodes and commits. All stores are
/// append-only; overwriting an id with an equal value is a no-op.
pub struct MemBackend {
    empty_node_id: NodeId,
    contents: RwLock<HashMap<ContentsId, Contents>>,
    nodes: RwLock<HashMap<NodeId, Node>>,
    commits: RwLock<HashMap<CommitId, Commit>>,
    branches: RwLock<BTreeMap<BranchName, CommitId>>,
    events: broadcast::Sender<BranchEvent>,
}

impl Debug for MemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBackend").finish_non_exhaustive()
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn name() -> &'static str {
        "mem"
    }

    pub fn new() -> Self {
        let empty_node_id = NodeId::new(blake2b_hash(&wire::to_vec(&Node::default())));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let backend = Self {
            empty_node_id: empty_node_id.clone(),
            contents: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            commits: RwLock::new(HashMap::new()),
            branches: RwLock::new(BTreeMap::new()),
            events,
        };
        backend
            .nodes
            .write()
            .unwrap()
            .insert(empty_node_id, Node::default());
        backend
    }

    fn publish(&self, event: BranchEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Backend for MemBackend {
    fn name(&self) -> &str {
        Self::name()
    }

    fn hash_length(&self) -> usize {
        HASH_LENGTH
    }

    fn empty_node_id(&self) -> &NodeId {
        &self.empty_node_id
    }

    async fn contents_mem(&self, id: &ContentsId) -> BackendResult<bool> {
        Ok(self.contents.read().unwrap().contains_key(id))
    }

    async fn contents_find(&self, id: &ContentsId) -> BackendResult<Option<Contents>> {
        Ok(self.contents.read().unwrap().get(id).cloned())
    }

    async fn contents_add(&self, contents: &Contents) -> BackendResult<ContentsId> {
        let id = ContentsId::new(blake2b_hash(contents.as_bytes()));
        self.contents
            .write()
            .unwrap()
            .insert(id.clone(), contents.clone());
        Ok(id)
    }

    async fn contents_unsafe_add(&self, id: ContentsId, contents: Contents) -> BackendResult<()> {
        self.contents.write().unwrap().insert(id, contents);
        Ok(())
    }

    async fn contents_index(&self, hash: &Hash) -> BackendResult<Option<ContentsId>> {
        let id = ContentsId::from_bytes(hash.as_bytes());
        Ok(self.contents.read().unwrap().contains_key(&id).then_some(id))
    }

    async fn contents_merge(
        &self,
        base: Option<ContentsId>,
        ours: Option<ContentsId>,
        theirs: Option<ContentsId>,
    ) -> BackendResult<MergeOutcome<Option<ContentsId>>> {
        // Contents are opaque, so only trivial merges resolve.
        match trivial_merge(base.as_ref(), ours.as_ref(), theirs.as_ref()) {
            Some(resolved) => Ok(MergeOutcome::Merged(resolved.cloned())),
            None => Ok(MergeOutcome::Conflict(MergeConflict {
                path: KeyPath::root(),
            })),
        }
    }

    async fn node_mem(&self, id: &NodeId) -> BackendResult<bool> {
        Ok(self.nodes.read().unwrap().contains_key(id))
    }

    async fn node_find(&self, id: &NodeId) -> BackendResult<Option<Node>> {
        Ok(self.nodes.read().unwrap().get(id).cloned())
    }

    async fn node_add(&self, node: &Node) -> BackendResult<NodeId> {
        let id = NodeId::new(blake2b_hash(&wire::to_vec(node)));
        self.nodes.write().unwrap().insert(id.clone(), node.clone());
        Ok(id)
    }

    async fn node_unsafe_add(&self, id: NodeId, node: Node) -> BackendResult<()> {
        self.nodes.write().unwrap().insert(id, node);
        Ok(())
    }

    async fn node_index(&self, hash: &Hash) -> BackendResult<Option<NodeId>> {
        let id = NodeId::from_bytes(hash.as_bytes());
        Ok(self.nodes.read().unwrap().contains_key(&id).then_some(id))
    }

    async fn node_merge(
        &self,
        base: Option<NodeId>,
        ours: Option<NodeId>,
        theirs: Option<NodeId>,
    ) -> BackendResult<MergeOutcome<Option<NodeId>>> {
        merge::merge_nodes(self, base, ours, theirs).await
    }

    async fn commit_mem(&self, id: &CommitId) -> BackendResult<bool> {
        Ok(self.commits.read().unwrap().contains_key(id))
    }

    async fn commit_find(&self, id: &CommitId) -> BackendResult<Option<Commit>> {
        Ok(self.commits.read().unwrap().get(id).cloned())
    }

    async fn commit_add(&self, commit: &Commit) -> BackendResult<CommitId> {
        {
            let commits = self.commits.read().unwrap();
            for parent in &commit.parents {
                if !commits.contains_key(parent) {
                    return Err(crate::backend::BackendError::UnresolvedParent {
                        parent: parent.clone(),
                    });
                }
            }
        }
        let id = CommitId::new(blake2b_hash(&wire::to_vec(commit)));
        self.commits
            .write()
            .unwrap()
            .insert(id.clone(), commit.clone());
        Ok(id)
    }

    async fn commit_unsafe_add(&self, id: CommitId, commit: Commit) -> BackendResult<()> {
        self.commits.write().unwrap().insert(id, commit);
        Ok(())
    }

    async fn commit_index(&self, hash: &Hash) -> BackendResult<Option<CommitId>> {
        let id = CommitId::from_bytes(hash.as_bytes());
        Ok(self.commits.read().unwrap().contains_key(&id).then_some(id))
    }

    async fn commit_merge(
        &self,
        info: CommitInfo,
        base: Option<CommitId>,
        ours: CommitId,
        theirs: CommitId,
    ) -> BackendResult<MergeOutcome<CommitId>> {
        let find = |id: &CommitId| self.commits.read().unwrap().get(id).cloned();
        let our_commit = find(&ours).ok_or_else(|| not_found("Commit", &ours))?;
        let their_commit = find(&theirs).ok_or_else(|| not_found("Commit", &theirs))?;
        let base_tree = match base {
            Some(id) => Some(find(&id).ok_or_else(|| not_found("Commit", &id))?.tree),
            None => None,
        };

        let as_node = |key: Option<Key>| match key {
            None => Some(None),
            Some(Key::Node(id)) => Some(Some(id)),
            Some(Key::Contents(_)) => None,
        };
        let merged_tree = match (
            as_node(base_tree.clone()),
            as_node(Some(our_commit.tree.clone())),
            as_node(Some(their_commit.tree.clone())),
        ) {
            (Some(base), Some(our_tree), Some(their_tree)) => {
                match merge::merge_nodes(self, base, our_tree, their_tree).await? {
                    MergeOutcome::Merged(id) => {
                        Key::Node(id.unwrap_or_else(|| self.empty_node_id.clone()))
                    }
                    MergeOutcome::Conflict(conflict) => {
                        return Ok(MergeOutcome::Conflict(conflict));
                    }
                }
            }
            _ => match trivial_merge(
                base_tree.as_ref(),
                Some(&our_commit.tree),
                Some(&their_commit.tree),
            ) {
                Some(Some(key)) => key.clone(),
                _ => {
                    return Ok(MergeOutcome::Conflict(MergeConflict {
                        path: KeyPath::root(),
                    }));
                }
            },
        };

        let commit = Commit {
            info,
            parents: vec![ours, theirs],
            tree: merged_tree,
        };
        let id = self.commit_add(&commit).await?;
        Ok(MergeOutcome::Merged(id))
    }

    async fn branch_mem(&self, branch: &BranchName) -> BackendResult<bool> {
        Ok(self.branches.read().unwrap().contains_key(branch))
    }

    async fn branch_find(&self, branch: &BranchName) -> BackendResult<Option<CommitId>> {
        Ok(self.branches.read().unwrap().get(branch).cloned())
    }

    async fn branch_set(&self, branch: &BranchName, head: CommitId) -> BackendResult<()> {
        self.branches
            .write()
            .unwrap()
            .insert(branch.clone(), head.clone());
        self.publish(BranchEvent::Set {
            branch: branch.clone(),
            head,
        });
        Ok(())
    }

    async fn branch_test_and_set(
        &self,
        branch: &BranchName,
        old: Option<CommitId>,
        new: Option<CommitId>,
    ) -> BackendResult<bool> {
        let event = {
            let mut branches = self.branches.write().unwrap();
            if branches.get(branch).cloned() != old {
                return Ok(false);
            }
            match new {
                Some(head) => {
                    branches.insert(branch.clone(), head.clone());
                    BranchEvent::Set {
                        branch: branch.clone(),
                        head,
                    }
                }
                None => {
                    branches.remove(branch);
                    BranchEvent::Removed {
                        branch: branch.clone(),
                    }
                }
            }
        };
        self.publish(event);
        Ok(true)
    }

    async fn branch_remove(&self, branch: &BranchName) -> BackendResult<()> {
        let removed = self.branches.write().unwrap().remove(branch).is_some();
        if removed {
            self.publish(BranchEvent::Removed {
                branch: branch.clone(),
            });
        }
        Ok(())
    }

    async fn branch_list(&self) -> BackendResult<Vec<BranchName>> {
        Ok(self.branches.read().unwrap().keys().cloned().collect())
    }

    async fn branch_clear(&self) -> BackendResult<()> {
        let branches = std::mem::take(&mut *self.branches.write().unwrap());
        for branch in branches.into_keys() {
            self.publish(BranchEvent::Removed { branch });
        }
        Ok(())
    }

    fn watch_branches(&self) -> broadcast::Receiver<BranchEvent> {
        self.events.subscribe()
    }
}

fn not_found(object_type: &str, id: &impl crate::object_id::ObjectId) -> crate::backend::BackendError {
    crate::backend::BackendError::ObjectNotFound {
        object_type: object_type.to_string(),
        hash: id.hex(),
    }
}
