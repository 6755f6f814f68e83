// Copyright 2024 The Dagkv Authors
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

//! Per-connection server state.
//!
//! A [`Session`] is created after a successful handshake and dropped on
//! disconnect. It owns the client's current branch, the store view of that
//! branch, the tree-handle table and the optional branch watches. Only the
//! session's own dispatch loop mutates it; cross-session coordination goes
//! through the shared backend.

#![expect(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::BranchName;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::CommitInfo;
use crate::backend::Contents;
use crate::backend::ContentsId;
use crate::backend::DEFAULT_BRANCH;
use crate::backend::Hash;
use crate::backend::Key;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::connection::FrameWriter;
use crate::connection::RpcError;
use crate::merge::MergeOutcome;
use crate::object_id::ObjectId as _;
use crate::path::KeyPath;
use crate::path::Step;
use crate::slice;
use crate::slice::Slice;
use crate::store::BranchStore;
use crate::tree::BatchOp;
use crate::tree::EntryKind;
use crate::tree::LocalTree;
use crate::tree::Tree;
use crate::tree::TreeRef;

/// State scoped to one connected client.
pub struct Session {
    repo: Arc<dyn Backend>,
    store: BranchStore,
    trees: HashMap<u64, Tree>,
    next_tree: u64,
    watch: Option<JoinHandle<()>>,
    branch_watch: Option<JoinHandle<()>>,
    writer: Arc<Mutex<FrameWriter>>,
}

impl Session {
    /// Starts a session on the repository's default branch with an empty
    /// handle table.
    pub fn new(repo: Arc<dyn Backend>, writer: Arc<Mutex<FrameWriter>>) -> Self {
        let store = BranchStore::new(repo.clone(), BranchName::new(DEFAULT_BRANCH));
        Self {
            repo,
            store,
            trees: HashMap::new(),
            next_tree: 0,
            watch: None,
            branch_watch: None,
            writer,
        }
    }

    pub fn repo(&self) -> &Arc<dyn Backend> {
        &self.repo
    }

    fn backend(&self) -> &dyn Backend {
        self.repo.as_ref()
    }

    /// Binds a server-resident tree to a fresh handle. Allocation is
    /// monotonic within the session.
    fn alloc(&mut self, tree: Tree) -> TreeRef {
        let id = self.next_tree;
        self.next_tree += 1;
        self.trees.insert(id, tree);
        TreeRef::Handle(id)
    }

    /// Dereferences a wire tree argument. An unknown handle is the
    /// client's mistake, not the session's end.
    fn resolve(&self, tree: &TreeRef) -> Result<Tree, RpcError> {
        match tree {
            TreeRef::Handle(id) => self
                .trees
                .get(id)
                .cloned()
                .ok_or_else(|| RpcError::recoverable(format!("unknown tree handle {id}"))),
            TreeRef::Key(key) => Ok(Tree::Key(key.clone())),
            TreeRef::Local(local) => Ok(Tree::from(local.clone())),
        }
    }

    // Connectivity

    pub fn ping(&self) {}

    // Branch selection

    pub fn set_current_branch(&mut self, branch: BranchName) {
        // The store view always matches the session branch.
        self.store = BranchStore::new(self.repo.clone(), branch);
    }

    pub fn get_current_branch(&self) -> BranchName {
        self.store.branch().clone()
    }

    pub async fn head(&self, branch: Option<BranchName>) -> Result<Option<CommitId>, RpcError> {
        let branch = branch.unwrap_or_else(|| self.get_current_branch());
        Ok(self.backend().branch_find(&branch).await?)
    }

    pub async fn set_head(
        &self,
        branch: Option<BranchName>,
        head: CommitId,
    ) -> Result<(), RpcError> {
        let branch = branch.unwrap_or_else(|| self.get_current_branch());
        Ok(self.backend().branch_set(&branch, head).await?)
    }

    pub async fn remove_branch(&self, branch: BranchName) -> Result<(), RpcError> {
        Ok(self.backend().branch_remove(&branch).await?)
    }

    // Store operations on the current branch

    pub async fn find(&self, path: KeyPath) -> Result<Option<Contents>, RpcError> {
        Ok(self.store.find(&path).await?)
    }

    pub async fn mem(&self, path: KeyPath) -> Result<bool, RpcError> {
        Ok(self.store.mem(&path).await?)
    }

    pub async fn mem_tree(&self, path: KeyPath) -> Result<bool, RpcError> {
        Ok(self.store.mem_tree(&path).await?)
    }

    pub async fn find_tree(&mut self, path: KeyPath) -> Result<Option<TreeRef>, RpcError> {
        let subtree = self.store.find_tree(&path).await?;
        Ok(subtree.map(|tree| self.alloc(tree)))
    }

    pub async fn set(
        &self,
        path: KeyPath,
        info: CommitInfo,
        contents: Contents,
    ) -> Result<CommitId, RpcError> {
        Ok(self.store.set(&path, &info, contents).await?)
    }

    pub async fn set_tree(
        &self,
        path: KeyPath,
        info: CommitInfo,
        tree: TreeRef,
    ) -> Result<CommitId, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(self.store.set_tree(&path, &info, tree).await?)
    }

    pub async fn remove(
        &self,
        path: KeyPath,
        info: CommitInfo,
    ) -> Result<Option<CommitId>, RpcError> {
        Ok(self.store.remove(&path, &info).await?)
    }

    pub async fn test_and_set(
        &self,
        path: KeyPath,
        info: CommitInfo,
        test: Option<Contents>,
        set: Option<Contents>,
    ) -> Result<bool, RpcError> {
        Ok(self.store.test_and_set(&path, &info, test, set).await?)
    }

    pub async fn test_and_set_tree(
        &self,
        path: KeyPath,
        info: CommitInfo,
        test: Option<TreeRef>,
        set: Option<TreeRef>,
    ) -> Result<bool, RpcError> {
        let test = test.map(|tree| self.resolve(&tree)).transpose()?;
        let set = set.map(|tree| self.resolve(&tree)).transpose()?;
        Ok(self.store.test_and_set_tree(&path, &info, test, set).await?)
    }

    // Tree handles

    pub fn tree_empty(&mut self) -> TreeRef {
        self.alloc(Tree::empty())
    }

    pub async fn tree_add(
        &mut self,
        tree: TreeRef,
        path: KeyPath,
        contents: Contents,
    ) -> Result<TreeRef, RpcError> {
        let tree = self.resolve(&tree)?;
        let updated = tree
            .set(self.backend(), &path, Some(Tree::Contents(contents)))
            .await?;
        Ok(self.alloc(updated))
    }

    pub async fn tree_add_tree(
        &mut self,
        tree: TreeRef,
        path: KeyPath,
        other: TreeRef,
    ) -> Result<TreeRef, RpcError> {
        let tree = self.resolve(&tree)?;
        let other = self.resolve(&other)?;
        let updated = tree.set(self.backend(), &path, Some(other)).await?;
        Ok(self.alloc(updated))
    }

    pub async fn tree_remove(&mut self, tree: TreeRef, path: KeyPath) -> Result<TreeRef, RpcError> {
        let tree = self.resolve(&tree)?;
        let updated = tree.set(self.backend(), &path, None).await?;
        Ok(self.alloc(updated))
    }

    pub async fn tree_batch_apply(
        &mut self,
        tree: TreeRef,
        ops: Vec<(KeyPath, BatchOp)>,
    ) -> Result<TreeRef, RpcError> {
        let mut current = self.resolve(&tree)?;
        for (path, op) in ops {
            let value = match op {
                BatchOp::Add(contents) => Some(Tree::Contents(contents)),
                BatchOp::AddTree(other) => Some(self.resolve(&other)?),
                BatchOp::Remove => None,
            };
            current = current.set(self.backend(), &path, value).await?;
        }
        Ok(self.alloc(current))
    }

    pub async fn tree_find(
        &self,
        tree: TreeRef,
        path: KeyPath,
    ) -> Result<Option<Contents>, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.find(self.backend(), &path).await?)
    }

    pub async fn tree_mem(&self, tree: TreeRef, path: KeyPath) -> Result<bool, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.mem(self.backend(), &path).await?)
    }

    pub async fn tree_mem_tree(&self, tree: TreeRef, path: KeyPath) -> Result<bool, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.mem_tree(self.backend(), &path).await?)
    }

    pub async fn tree_list(
        &self,
        tree: TreeRef,
        path: KeyPath,
    ) -> Result<Vec<(Step, EntryKind)>, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.list(self.backend(), &path).await?)
    }

    pub async fn tree_hash(&self, tree: TreeRef) -> Result<Hash, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.hash(self.backend()).await?)
    }

    pub async fn tree_key(&self, tree: TreeRef) -> Result<Key, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.save(self.backend()).await?)
    }

    pub async fn tree_save(&self, tree: TreeRef) -> Result<Key, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.save(self.backend()).await?)
    }

    pub async fn tree_to_local(&self, tree: TreeRef) -> Result<LocalTree, RpcError> {
        let tree = self.resolve(&tree)?;
        Ok(tree.to_local(self.backend()).await?)
    }

    /// Hydrates the subtree of the current branch at `path`; an absent
    /// path hydrates as the empty tree.
    pub async fn tree_of_path(&mut self, path: KeyPath) -> Result<TreeRef, RpcError> {
        let subtree = self.store.find_tree(&path).await?.unwrap_or_else(Tree::empty);
        Ok(self.alloc(subtree))
    }

    pub async fn tree_of_hash(&mut self, hash: Hash) -> Result<TreeRef, RpcError> {
        if let Some(id) = self.backend().node_index(&hash).await? {
            return Ok(self.alloc(Tree::Key(Key::Node(id))));
        }
        if let Some(id) = self.backend().contents_index(&hash).await? {
            return Ok(self.alloc(Tree::Key(Key::Contents(id))));
        }
        Err(RpcError::recoverable(format!("unknown hash {}", hash.hex())))
    }

    pub async fn tree_of_commit(&mut self, hash: Hash) -> Result<TreeRef, RpcError> {
        let id = CommitId::from_bytes(hash.as_bytes());
        let commit = self
            .backend()
            .commit_find(&id)
            .await?
            .ok_or_else(|| RpcError::recoverable(format!("unknown commit {}", hash.hex())))?;
        Ok(self.alloc(Tree::Key(commit.tree)))
    }

    pub async fn tree_merge(
        &mut self,
        base: TreeRef,
        ours: TreeRef,
        theirs: TreeRef,
    ) -> Result<TreeRef, RpcError> {
        let backend = self.backend();
        let base = self.resolve(&base)?.save(backend).await?;
        let ours = self.resolve(&ours)?.save(backend).await?;
        let theirs = self.resolve(&theirs)?.save(backend).await?;

        let as_node = |key: &Key| match key {
            Key::Node(id) => Some(id.clone()),
            Key::Contents(_) => None,
        };
        let outcome = match (as_node(&base), as_node(&ours), as_node(&theirs)) {
            (Some(base), Some(ours), Some(theirs)) => {
                let merged = self
                    .backend()
                    .node_merge(Some(base), Some(ours), Some(theirs))
                    .await?;
                merged.map(|id| id.map(Key::Node))
            }
            _ => {
                let as_contents = |key: Key| match key {
                    Key::Contents(id) => Some(id),
                    Key::Node(_) => None,
                };
                let merged = self
                    .backend()
                    .contents_merge(as_contents(base), as_contents(ours), as_contents(theirs))
                    .await?;
                merged.map(|id| id.map(Key::Contents))
            }
        };
        match outcome {
            MergeOutcome::Merged(key) => {
                let tree = key.map(Tree::Key).unwrap_or_else(Tree::empty);
                Ok(self.alloc(tree))
            }
            // The conflict is the client's to resolve; the session goes on.
            MergeOutcome::Conflict(conflict) => Err(RpcError::recoverable(conflict.to_string())),
        }
    }

    /// Releases one handle. Releasing an already-released handle is a
    /// no-op, so cleanup is idempotent.
    pub fn tree_cleanup(&mut self, tree: TreeRef) {
        if let TreeRef::Handle(id) = tree {
            self.trees.remove(&id);
        }
    }

    pub fn tree_cleanup_all(&mut self) {
        self.trees.clear();
    }

    pub fn tree_handle_count(&self) -> usize {
        self.trees.len()
    }

    // Repository

    pub async fn export(&self, depth: Option<u64>) -> Result<Slice, RpcError> {
        Ok(slice::export(self.backend(), depth).await?)
    }

    pub async fn import(&self, slice: Slice) -> Result<(), RpcError> {
        Ok(slice::import(self.backend(), slice).await?)
    }

    pub async fn new_commit(
        &self,
        info: CommitInfo,
        parents: Vec<CommitId>,
        tree: Key,
    ) -> Result<CommitId, RpcError> {
        let commit = Commit {
            info,
            parents,
            tree,
        };
        Ok(self.backend().commit_add(&commit).await?)
    }

    // Backend passthrough

    pub async fn contents_mem(&self, id: ContentsId) -> Result<bool, RpcError> {
        Ok(self.backend().contents_mem(&id).await?)
    }

    pub async fn contents_find(&self, id: ContentsId) -> Result<Option<Contents>, RpcError> {
        Ok(self.backend().contents_find(&id).await?)
    }

    pub async fn contents_add(&self, contents: Contents) -> Result<ContentsId, RpcError> {
        Ok(self.backend().contents_add(&contents).await?)
    }

    pub async fn contents_unsafe_add(
        &self,
        id: ContentsId,
        contents: Contents,
    ) -> Result<(), RpcError> {
        Ok(self.backend().contents_unsafe_add(id, contents).await?)
    }

    pub async fn contents_index(&self, hash: Hash) -> Result<Option<ContentsId>, RpcError> {
        Ok(self.backend().contents_index(&hash).await?)
    }

    pub async fn contents_merge(
        &self,
        base: Option<ContentsId>,
        ours: Option<ContentsId>,
        theirs: Option<ContentsId>,
    ) -> Result<MergeOutcome<Option<ContentsId>>, RpcError> {
        Ok(self.backend().contents_merge(base, ours, theirs).await?)
    }

    pub async fn node_mem(&self, id: NodeId) -> Result<bool, RpcError> {
        Ok(self.backend().node_mem(&id).await?)
    }

    pub async fn node_find(&self, id: NodeId) -> Result<Option<Node>, RpcError> {
        Ok(self.backend().node_find(&id).await?)
    }

    pub async fn node_add(&self, node: Node) -> Result<NodeId, RpcError> {
        Ok(self.backend().node_add(&node).await?)
    }

    pub async fn node_unsafe_add(&self, id: NodeId, node: Node) -> Result<(), RpcError> {
        Ok(self.backend().node_unsafe_add(id, node).await?)
    }

    pub async fn node_index(&self, hash: Hash) -> Result<Option<NodeId>, RpcError> {
        Ok(self.backend().node_index(&hash).await?)
    }

    pub async fn node_merge(
        &self,
        base: Option<NodeId>,
        ours: Option<NodeId>,
        theirs: Option<NodeId>,
    ) -> Result<MergeOutcome<Option<NodeId>>, RpcError> {
        Ok(self.backend().node_merge(base, ours, theirs).await?)
    }

    pub async fn commit_mem(&self, id: CommitId) -> Result<bool, RpcError> {
        Ok(self.backend().commit_mem(&id).await?)
    }

    pub async fn commit_find(&self, id: CommitId) -> Result<Option<Commit>, RpcError> {
        Ok(self.backend().commit_find(&id).await?)
    }

    pub async fn commit_add(&self, commit: Commit) -> Result<CommitId, RpcError> {
        Ok(self.backend().commit_add(&commit).await?)
    }

    pub async fn commit_unsafe_add(&self, id: CommitId, commit: Commit) -> Result<(), RpcError> {
        Ok(self.backend().commit_unsafe_add(id, commit).await?)
    }

    pub async fn commit_index(&self, hash: Hash) -> Result<Option<CommitId>, RpcError> {
        Ok(self.backend().commit_index(&hash).await?)
    }

    pub async fn commit_merge(
        &self,
        info: CommitInfo,
        base: Option<CommitId>,
        ours: CommitId,
        theirs: CommitId,
    ) -> Result<MergeOutcome<CommitId>, RpcError> {
        Ok(self.backend().commit_merge(info, base, ours, theirs).await?)
    }

    pub async fn branch_mem(&self, branch: BranchName) -> Result<bool, RpcError> {
        Ok(self.backend().branch_mem(&branch).await?)
    }

    pub async fn branch_find(&self, branch: BranchName) -> Result<Option<CommitId>, RpcError> {
        Ok(self.backend().branch_find(&branch).await?)
    }

    pub async fn branch_set(&self, branch: BranchName, head: CommitId) -> Result<(), RpcError> {
        Ok(self.backend().branch_set(&branch, head).await?)
    }

    pub async fn branch_test_and_set(
        &self,
        branch: BranchName,
        old: Option<CommitId>,
        new: Option<CommitId>,
    ) -> Result<bool, RpcError> {
        Ok(self.backend().branch_test_and_set(&branch, old, new).await?)
    }

    pub async fn branch_remove(&self, branch: BranchName) -> Result<(), RpcError> {
        Ok(self.backend().branch_remove(&branch).await?)
    }

    pub async fn branch_list(&self) -> Result<Vec<BranchName>, RpcError> {
        Ok(self.backend().branch_list().await?)
    }

    pub async fn branch_clear(&self) -> Result<(), RpcError> {
        Ok(self.backend().branch_clear().await?)
    }

    // Watches

    /// Starts pushing every branch event to this connection. At most one
    /// per session.
    pub fn branch_watch(&mut self) -> Result<(), RpcError> {
        if self.watch.is_some() {
            return Err(RpcError::recoverable("watch already installed"));
        }
        self.watch = Some(spawn_watch(self.backend(), self.writer.clone(), None));
        Ok(())
    }

    /// Starts pushing events for one branch to this connection. At most
    /// one per session.
    pub fn branch_watch_key(&mut self, branch: BranchName) -> Result<(), RpcError> {
        if self.branch_watch.is_some() {
            return Err(RpcError::recoverable("branch watch already installed"));
        }
        self.branch_watch = Some(spawn_watch(
            self.backend(),
            self.writer.clone(),
            Some(branch),
        ));
        Ok(())
    }

    /// Removes both watches, when installed.
    pub fn branch_unwatch(&mut self) {
        if let Some(task) = self.watch.take() {
            task.abort();
        }
        if let Some(task) = self.branch_watch.take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Session end releases every session-scoped resource.
        self.branch_unwatch();
    }
}

fn spawn_watch(
    backend: &dyn Backend,
    writer: Arc<Mutex<FrameWriter>>,
    filter: Option<BranchName>,
) -> JoinHandle<()> {
    let mut events = backend.watch_branches();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if filter.as_ref().is_some_and(|branch| event.branch() != branch) {
                        continue;
                    }
                    let mut writer = writer.lock().await;
                    if writer.write_event(&event).await.is_err() {
                        // The connection is gone; the session will follow.
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "branch watch lagging, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
