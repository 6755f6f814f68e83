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

//! Per-branch store view.
//!
//! A [`BranchStore`] reads and writes one branch of the repository. Every
//! mutation produces a new commit whose parent is the branch head observed
//! at the start of the operation; the head is then advanced with an atomic
//! compare-and-swap against the branch registry. When another writer moved
//! the head in between, plain writes rebuild on the new head and retry;
//! the `test_and_set` forms instead report failure without retrying.

#![expect(missing_docs)]

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::backend::BranchName;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::CommitInfo;
use crate::backend::Contents;
use crate::backend::Key;
use crate::path::KeyPath;
use crate::tree::Tree;

/// View of the repository through one branch.
#[derive(Clone)]
pub struct BranchStore {
    backend: Arc<dyn Backend>,
    branch: BranchName,
}

impl std::fmt::Debug for BranchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStore")
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl BranchStore {
    pub fn new(backend: Arc<dyn Backend>, branch: BranchName) -> Self {
        Self { backend, branch }
    }

    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The branch's current head commit, if the branch exists.
    pub async fn head(&self) -> BackendResult<Option<CommitId>> {
        self.backend.branch_find(&self.branch).await
    }

    /// Points the branch at `head` unconditionally.
    pub async fn set_head(&self, head: CommitId) -> BackendResult<()> {
        self.backend.branch_set(&self.branch, head).await
    }

    /// The root tree of the given head; an unborn branch has an empty tree.
    async fn tree_at(&self, head: Option<&CommitId>) -> BackendResult<Tree> {
        let Some(head) = head else {
            return Ok(Tree::empty());
        };
        match self.backend.commit_find(head).await? {
            Some(commit) => Ok(Tree::Key(commit.tree)),
            None => Ok(Tree::empty()),
        }
    }

    /// The current root tree of the branch.
    pub async fn root_tree(&self) -> BackendResult<Tree> {
        let head = self.head().await?;
        self.tree_at(head.as_ref()).await
    }

    pub async fn find(&self, path: &KeyPath) -> BackendResult<Option<Contents>> {
        let tree = self.root_tree().await?;
        tree.find(self.backend.as_ref(), path).await
    }

    pub async fn mem(&self, path: &KeyPath) -> BackendResult<bool> {
        let tree = self.root_tree().await?;
        tree.mem(self.backend.as_ref(), path).await
    }

    pub async fn mem_tree(&self, path: &KeyPath) -> BackendResult<bool> {
        let tree = self.root_tree().await?;
        tree.mem_tree(self.backend.as_ref(), path).await
    }

    pub async fn find_tree(&self, path: &KeyPath) -> BackendResult<Option<Tree>> {
        let tree = self.root_tree().await?;
        tree.subtree(self.backend.as_ref(), path).await
    }

    /// Stores `contents` at `path`, committing with `info`.
    pub async fn set(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        contents: Contents,
    ) -> BackendResult<CommitId> {
        self.commit_update(path, info, Some(Tree::Contents(contents)))
            .await
    }

    /// Grafts `tree` at `path`, committing with `info`.
    pub async fn set_tree(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        tree: Tree,
    ) -> BackendResult<CommitId> {
        self.commit_update(path, info, Some(tree)).await
    }

    /// Removes the value or subtree at `path`, committing with `info`.
    /// Removing an absent path leaves the branch untouched and returns the
    /// current head.
    pub async fn remove(&self, path: &KeyPath, info: &CommitInfo) -> BackendResult<Option<CommitId>> {
        let backend = self.backend.as_ref();
        loop {
            let head = self.head().await?;
            let root = self.tree_at(head.as_ref()).await?;
            let updated = root.set(backend, path, None).await?;
            let old_key = root.save(backend).await?;
            let new_key = updated.save(backend).await?;
            if new_key == old_key {
                return Ok(head);
            }
            let id = self.write_commit(info, head.clone(), new_key).await?;
            if self.cas_head(head, id.clone()).await? {
                return Ok(Some(id));
            }
            debug!(branch = %self.branch, "head advanced concurrently, retrying remove");
        }
    }

    /// The optimistic commit loop shared by `set` and `set_tree`.
    async fn commit_update(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        value: Option<Tree>,
    ) -> BackendResult<CommitId> {
        let backend = self.backend.as_ref();
        loop {
            let head = self.head().await?;
            let root = self.tree_at(head.as_ref()).await?;
            let updated = root.set(backend, path, value.clone()).await?;
            let key = updated.save(backend).await?;
            let id = self.write_commit(info, head.clone(), key).await?;
            if self.cas_head(head, id.clone()).await? {
                return Ok(id);
            }
            debug!(branch = %self.branch, "head advanced concurrently, retrying set");
        }
    }

    /// Compare-and-swap of the contents at `path`: applies `set` only when
    /// the current value equals `test` (`None` meaning absent). Returns
    /// false without committing or retrying when the observed state
    /// disagrees, including when the head moves mid-flight.
    pub async fn test_and_set(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        test: Option<Contents>,
        set: Option<Contents>,
    ) -> BackendResult<bool> {
        self.test_and_set_impl(path, info, test.map(Tree::Contents), set.map(Tree::Contents))
            .await
    }

    /// Compare-and-swap of the subtree at `path`. Trees compare by their
    /// saved keys, i.e. by content.
    pub async fn test_and_set_tree(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        test: Option<Tree>,
        set: Option<Tree>,
    ) -> BackendResult<bool> {
        self.test_and_set_impl(path, info, test, set).await
    }

    async fn test_and_set_impl(
        &self,
        path: &KeyPath,
        info: &CommitInfo,
        test: Option<Tree>,
        set: Option<Tree>,
    ) -> BackendResult<bool> {
        let backend = self.backend.as_ref();
        let head = self.head().await?;
        let root = self.tree_at(head.as_ref()).await?;

        let observed = match root.subtree(backend, path).await? {
            Some(subtree) => Some(subtree.save(backend).await?),
            None => None,
        };
        let expected = match &test {
            Some(tree) => Some(tree.save(backend).await?),
            None => None,
        };
        if observed != expected {
            return Ok(false);
        }

        let updated = root.set(backend, path, set).await?;
        let new_key = updated.save(backend).await?;
        if new_key == root.save(backend).await? {
            // The swap holds trivially; no commit is produced.
            return Ok(true);
        }
        let id = self.write_commit(info, head.clone(), new_key).await?;
        self.cas_head(head, id).await
    }

    async fn write_commit(
        &self,
        info: &CommitInfo,
        parent: Option<CommitId>,
        tree: Key,
    ) -> BackendResult<CommitId> {
        let commit = Commit {
            info: info.clone(),
            parents: parent.into_iter().collect(),
            tree,
        };
        self.backend.commit_add(&commit).await
    }

    async fn cas_head(&self, old: Option<CommitId>, new: CommitId) -> BackendResult<bool> {
        self.backend
            .branch_test_and_set(&self.branch, old, Some(new))
            .await
    }
}

#[cfg(test)]
mod tests {
    use pollster::FutureExt as _;

    use super::*;
    use crate::backend::MillisSinceEpoch;
    use crate::backend::Timestamp;
    use crate::mem_backend::MemBackend;

    fn store() -> BranchStore {
        BranchStore::new(Arc::new(MemBackend::new()), BranchName::new("main"))
    }

    fn info(message: &str) -> CommitInfo {
        CommitInfo {
            author: "test".to_string(),
            message: message.to_string(),
            date: Timestamp {
                timestamp: MillisSinceEpoch(0),
                tz_offset: 0,
            },
        }
    }

    fn path(value: &str) -> KeyPath {
        KeyPath::parse(value).unwrap()
    }

    #[test]
    fn test_set_then_find() {
        let store = store();
        store
            .set(&path("a/b"), &info("set"), Contents::from("v1"))
            .block_on()
            .unwrap();
        assert_eq!(
            store.find(&path("a/b")).block_on().unwrap(),
            Some(Contents::from("v1"))
        );
        assert_eq!(store.find(&path("a/c")).block_on().unwrap(), None);
        assert!(store.mem(&path("a/b")).block_on().unwrap());
        assert!(store.mem_tree(&path("a")).block_on().unwrap());
    }

    #[test]
    fn test_commits_chain_through_parents() {
        let store = store();
        let first = store
            .set(&path("k"), &info("first"), Contents::from("1"))
            .block_on()
            .unwrap();
        let second = store
            .set(&path("k"), &info("second"), Contents::from("2"))
            .block_on()
            .unwrap();

        assert_eq!(store.head().block_on().unwrap(), Some(second.clone()));
        let commit = store
            .backend()
            .commit_find(&second)
            .block_on()
            .unwrap()
            .unwrap();
        assert_eq!(commit.parents, vec![first]);
        assert_eq!(commit.info.message, "second");
    }

    #[test]
    fn test_two_views_converge() {
        let backend: Arc<dyn crate::backend::Backend> = Arc::new(MemBackend::new());
        let left = BranchStore::new(backend.clone(), BranchName::new("main"));
        let right = BranchStore::new(backend, BranchName::new("main"));

        left.set(&path("l"), &info("left"), Contents::from("L"))
            .block_on()
            .unwrap();
        right
            .set(&path("r"), &info("right"), Contents::from("R"))
            .block_on()
            .unwrap();

        // The second write rebased onto the first; both values are present.
        assert_eq!(
            left.find(&path("l")).block_on().unwrap(),
            Some(Contents::from("L"))
        );
        assert_eq!(
            left.find(&path("r")).block_on().unwrap(),
            Some(Contents::from("R"))
        );
    }

    #[test]
    fn test_cas_failure_leaves_state_unchanged() {
        let store = store();
        store
            .set(&path("k"), &info("init"), Contents::from("A"))
            .block_on()
            .unwrap();
        let head_before = store.head().block_on().unwrap();

        let swapped = store
            .test_and_set(
                &path("k"),
                &info("cas"),
                Some(Contents::from("B")),
                Some(Contents::from("C")),
            )
            .block_on()
            .unwrap();
        assert!(!swapped);
        assert_eq!(
            store.find(&path("k")).block_on().unwrap(),
            Some(Contents::from("A"))
        );
        assert_eq!(store.head().block_on().unwrap(), head_before);
    }

    #[test]
    fn test_cas_success() {
        let store = store();
        // test=None succeeds only while the path is absent.
        assert!(
            store
                .test_and_set(&path("k"), &info("cas"), None, Some(Contents::from("v")))
                .block_on()
                .unwrap()
        );
        assert!(
            !store
                .test_and_set(&path("k"), &info("cas"), None, Some(Contents::from("w")))
                .block_on()
                .unwrap()
        );
        assert_eq!(
            store.find(&path("k")).block_on().unwrap(),
            Some(Contents::from("v"))
        );
    }

    #[test]
    fn test_remove_absent_path_is_a_no_op() {
        let store = store();
        let first = store
            .set(&path("k"), &info("set"), Contents::from("v"))
            .block_on()
            .unwrap();
        let head = store
            .remove(&path("missing"), &info("remove"))
            .block_on()
            .unwrap();
        assert_eq!(head, Some(first.clone()));
        assert_eq!(store.head().block_on().unwrap(), Some(first));
    }

    #[test]
    fn test_remove() {
        let store = store();
        store
            .set(&path("a/b"), &info("set"), Contents::from("v"))
            .block_on()
            .unwrap();
        store.remove(&path("a/b"), &info("remove")).block_on().unwrap();
        assert_eq!(store.find(&path("a/b")).block_on().unwrap(), None);
        assert!(!store.mem_tree(&path("a")).block_on().unwrap());
    }
}
