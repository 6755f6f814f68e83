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

use std::any::Any;
use std::fmt::Debug;

use async_trait::async_trait;
use bstr::ByteSlice as _;
use chrono::TimeZone as _;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::merge::MergeOutcome;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;
use crate::path::Step;

/// Name of the branch a fresh session starts on.
pub const DEFAULT_BRANCH: &str = "main";

id_type!(
    /// Raw content digest, not yet tagged with an object kind.
    pub Hash
);
id_type!(
    /// Identifier for a [`Contents`] value, derived from its bytes.
    pub ContentsId
);
id_type!(
    /// Identifier for a [`Node`], derived from its canonical encoding.
    pub NodeId
);
id_type!(
    /// Identifier for a [`Commit`], derived from its canonical encoding.
    pub CommitId
);

/// Key of a stored tree position: either a contents leaf or an interior
/// node.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub enum Key {
    Contents(ContentsId),
    Node(NodeId),
}

impl Key {
    /// The untagged digest underlying this key.
    pub fn hash(&self) -> Hash {
        match self {
            Self::Contents(id) => Hash::from_bytes(id.as_bytes()),
            Self::Node(id) => Hash::from_bytes(id.as_bytes()),
        }
    }
}

/// Opaque user payload stored at a tree leaf.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Contents(Vec<u8>);

impl Contents {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Contents {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Contents {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Debug for Contents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Payloads are frequently text; print them readably when they are.
        f.debug_tuple("Contents").field(&self.0.as_bstr()).finish()
    }
}

#[derive(Debug, Error)]
#[error("Out-of-range date")]
pub struct TimestampOutOfRange;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }

    pub fn to_datetime(
        &self,
    ) -> Result<chrono::DateTime<chrono::FixedOffset>, TimestampOutOfRange> {
        let utc = match chrono::Utc.timestamp_opt(
            self.timestamp.0.div_euclid(1000),
            (self.timestamp.0.rem_euclid(1000)) as u32 * 1000000,
        ) {
            chrono::LocalResult::None => {
                return Err(TimestampOutOfRange);
            }
            chrono::LocalResult::Single(x) => x,
            chrono::LocalResult::Ambiguous(y, _z) => y,
        };

        Ok(utc.with_timezone(
            &chrono::FixedOffset::east_opt(self.tz_offset * 60)
                .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()),
        ))
    }
}

/// Authorship metadata attached to a [`Commit`].
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommitInfo {
    pub author: String,
    pub message: String,
    pub date: Timestamp,
}

/// Immutable commit object: metadata, parent commits and the root tree key.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    pub info: CommitInfo,
    pub parents: Vec<CommitId>,
    pub tree: Key,
}

/// One stored tree level: a sorted mapping from steps to keys.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    entries: Vec<(Step, Key)>,
}

impl Node {
    pub fn from_sorted_entries(entries: Vec<(Step, Key)>) -> Self {
        debug_assert!(entries.is_sorted_by(|(a, _), (b, _)| a < b));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Step, &Key)> {
        self.entries.iter().map(|(step, key)| (step, key))
    }

    pub fn into_entries(self) -> Vec<(Step, Key)> {
        self.entries
    }

    pub fn value(&self, step: &Step) -> Option<&Key> {
        let index = self
            .entries
            .binary_search_by_key(&step, |(step, _)| step)
            .ok()?;
        Some(&self.entries[index].1)
    }
}

/// Named, mutable pointer to a commit.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BranchName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Change notification published by the branch registry.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BranchEvent {
    /// The branch now points at `head`.
    Set { branch: BranchName, head: CommitId },
    /// The branch mapping was removed.
    Removed { branch: BranchName },
}

impl BranchEvent {
    pub fn branch(&self) -> &BranchName {
        match self {
            Self::Set { branch, .. } => branch,
            Self::Removed { branch } => branch,
        }
    }
}

/// Error that may occur during backend initialization.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct BackendInitError(pub Box<dyn std::error::Error + Send + Sync>);

/// Store error that may occur after the backend is loaded.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(
        "Invalid hash length for object of type {object_type} (expected {expected} bytes, got \
         {actual} bytes): {hash}"
    )]
    InvalidHashLength {
        expected: usize,
        actual: usize,
        object_type: String,
        hash: String,
    },
    #[error("Object {hash} of type {object_type} not found")]
    ObjectNotFound { object_type: String, hash: String },
    #[error("Error when reading object {hash} of type {object_type}")]
    ReadObject {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Could not write object of type {object_type}")]
    WriteObject {
        object_type: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Commit parent {parent} does not resolve")]
    UnresolvedParent { parent: CommitId },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
    /// A valid operation attempted, but failed because it isn't supported by
    /// the particular backend.
    #[error("{0}")]
    Unsupported(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Defines the interface for Merkle storage backends.
///
/// All four object stores are append-only and content-addressed: `add`
/// derives the returned id from the value's digest, so equal values get
/// equal ids. The `unsafe_add` variants trust a caller-supplied id and are
/// only sound when that id was computed by a peer store over the same
/// canonical encoding (slice import, replication). `index` maps an untagged
/// digest back to a kinded id when the store holds a matching object.
#[async_trait]
pub trait Backend: Any + Send + Sync + Debug {
    /// A unique name that identifies this backend implementation.
    fn name(&self) -> &str;

    /// The length of object ids in bytes.
    fn hash_length(&self) -> usize;

    /// Id of the empty node, the root tree of an empty branch.
    fn empty_node_id(&self) -> &NodeId;

    async fn contents_mem(&self, id: &ContentsId) -> BackendResult<bool>;
    async fn contents_find(&self, id: &ContentsId) -> BackendResult<Option<Contents>>;
    async fn contents_add(&self, contents: &Contents) -> BackendResult<ContentsId>;
    async fn contents_unsafe_add(&self, id: ContentsId, contents: Contents) -> BackendResult<()>;
    async fn contents_index(&self, hash: &Hash) -> BackendResult<Option<ContentsId>>;
    async fn contents_merge(
        &self,
        base: Option<ContentsId>,
        ours: Option<ContentsId>,
        theirs: Option<ContentsId>,
    ) -> BackendResult<MergeOutcome<Option<ContentsId>>>;

    async fn node_mem(&self, id: &NodeId) -> BackendResult<bool>;
    async fn node_find(&self, id: &NodeId) -> BackendResult<Option<Node>>;
    async fn node_add(&self, node: &Node) -> BackendResult<NodeId>;
    async fn node_unsafe_add(&self, id: NodeId, node: Node) -> BackendResult<()>;
    async fn node_index(&self, hash: &Hash) -> BackendResult<Option<NodeId>>;
    async fn node_merge(
        &self,
        base: Option<NodeId>,
        ours: Option<NodeId>,
        theirs: Option<NodeId>,
    ) -> BackendResult<MergeOutcome<Option<NodeId>>>;

    async fn commit_mem(&self, id: &CommitId) -> BackendResult<bool>;
    async fn commit_find(&self, id: &CommitId) -> BackendResult<Option<Commit>>;
    /// Writes a commit. Every listed parent must already resolve in the
    /// commit store.
    async fn commit_add(&self, commit: &Commit) -> BackendResult<CommitId>;
    async fn commit_unsafe_add(&self, id: CommitId, commit: Commit) -> BackendResult<()>;
    async fn commit_index(&self, hash: &Hash) -> BackendResult<Option<CommitId>>;
    /// Merges the trees of `ours` and `theirs` against `base`'s tree and
    /// writes a merge commit carrying `info` with parents `[ours, theirs]`.
    async fn commit_merge(
        &self,
        info: CommitInfo,
        base: Option<CommitId>,
        ours: CommitId,
        theirs: CommitId,
    ) -> BackendResult<MergeOutcome<CommitId>>;

    async fn branch_mem(&self, branch: &BranchName) -> BackendResult<bool>;
    async fn branch_find(&self, branch: &BranchName) -> BackendResult<Option<CommitId>>;
    /// Points `branch` at `head`. The update is atomic.
    async fn branch_set(&self, branch: &BranchName, head: CommitId) -> BackendResult<()>;
    /// Atomically moves `branch` from `old` to `new` (`None` meaning
    /// absent). Returns false and leaves the registry unchanged when the
    /// observed head disagrees with `old`.
    async fn branch_test_and_set(
        &self,
        branch: &BranchName,
        old: Option<CommitId>,
        new: Option<CommitId>,
    ) -> BackendResult<bool>;
    async fn branch_remove(&self, branch: &BranchName) -> BackendResult<()>;
    async fn branch_list(&self) -> BackendResult<Vec<BranchName>>;
    async fn branch_clear(&self) -> BackendResult<()>;

    /// Subscribes to branch registry changes. Events are broadcast to every
    /// subscriber; a lagging subscriber may miss events.
    fn watch_branches(&self) -> broadcast::Receiver<BranchEvent>;
}

impl dyn Backend {
    /// Returns reference of the implementation type.
    pub fn downcast_ref<T: Backend>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}
