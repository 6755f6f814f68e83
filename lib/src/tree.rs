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

//! Server-resident trees.
//!
//! A [`Tree`] is either a reference into the node store or an unsaved
//! overlay built on top of stored keys. Updates are functional: they return
//! a new tree sharing unchanged subtrees with the source, which is what
//! makes handle-based incremental composition cheap. [`Tree::save`]
//! persists the unsaved layers and collapses the tree back to a single
//! key.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::io;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::backend::Contents;
use crate::backend::Hash;
use crate::backend::Key;
use crate::backend::Node;
use crate::path::KeyPath;
use crate::path::Step;
use crate::wire::Wire;
use crate::wire::invalid_data;
use crate::wire::read_len;

/// A tree the server holds on behalf of a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Tree {
    /// Reference to a stored node or contents value.
    Key(Key),
    /// Unsaved contents leaf.
    Contents(Contents),
    /// Unsaved node level; children may mix stored and unsaved subtrees.
    Node(BTreeMap<Step, Tree>),
}

/// Kind of a tree entry as reported by [`Tree::list`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    Contents,
    Node,
}

impl Tree {
    /// A new empty tree.
    pub fn empty() -> Self {
        Self::Node(BTreeMap::new())
    }

    /// Expands one level into child trees, or `None` for a leaf.
    async fn level(&self, backend: &dyn Backend) -> BackendResult<Option<BTreeMap<Step, Self>>> {
        match self {
            Self::Node(children) => Ok(Some(children.clone())),
            Self::Key(Key::Node(id)) => {
                let node = backend.node_find(id).await?.unwrap_or_default();
                Ok(Some(
                    node.into_entries()
                        .into_iter()
                        .map(|(step, key)| (step, Self::Key(key)))
                        .collect(),
                ))
            }
            Self::Contents(_) | Self::Key(Key::Contents(_)) => Ok(None),
        }
    }

    /// The subtree at `path`, or `None` when nothing is stored there.
    pub async fn subtree(&self, backend: &dyn Backend, path: &KeyPath) -> BackendResult<Option<Self>> {
        let mut current = self.clone();
        for step in path.steps() {
            let Some(children) = current.level(backend).await? else {
                return Ok(None);
            };
            match children.get(step) {
                Some(child) => current = child.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// The contents stored at `path`, if any.
    pub async fn find(&self, backend: &dyn Backend, path: &KeyPath) -> BackendResult<Option<Contents>> {
        match self.subtree(backend, path).await? {
            Some(Self::Contents(contents)) => Ok(Some(contents)),
            Some(Self::Key(Key::Contents(id))) => backend.contents_find(&id).await,
            _ => Ok(None),
        }
    }

    /// Whether contents are stored at `path`.
    pub async fn mem(&self, backend: &dyn Backend, path: &KeyPath) -> BackendResult<bool> {
        match self.subtree(backend, path).await? {
            Some(Self::Contents(_) | Self::Key(Key::Contents(_))) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Whether a subtree (interior node) exists at `path`.
    pub async fn mem_tree(&self, backend: &dyn Backend, path: &KeyPath) -> BackendResult<bool> {
        match self.subtree(backend, path).await? {
            Some(Self::Node(_) | Self::Key(Key::Node(_))) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Lists the entries of the node at `path`. An absent or leaf position
    /// lists as empty.
    pub async fn list(
        &self,
        backend: &dyn Backend,
        path: &KeyPath,
    ) -> BackendResult<Vec<(Step, EntryKind)>> {
        let Some(subtree) = self.subtree(backend, path).await? else {
            return Ok(vec![]);
        };
        let Some(children) = subtree.level(backend).await? else {
            return Ok(vec![]);
        };
        Ok(children
            .into_iter()
            .map(|(step, child)| {
                let kind = match child {
                    Self::Contents(_) | Self::Key(Key::Contents(_)) => EntryKind::Contents,
                    Self::Node(_) | Self::Key(Key::Node(_)) => EntryKind::Node,
                };
                (step, kind)
            })
            .collect())
    }

    /// Returns a new tree with `value` stored at `path` (`None` removes the
    /// position). Intermediate nodes are created on the way down and empty
    /// nodes pruned on the way back up; the source tree is untouched.
    pub async fn set(
        &self,
        backend: &dyn Backend,
        path: &KeyPath,
        value: Option<Self>,
    ) -> BackendResult<Self> {
        let updated = set_at(backend, self.clone(), path.clone(), value).await?;
        Ok(updated.unwrap_or_else(Self::empty))
    }

    /// Persists every unsaved layer and returns the resulting key: a
    /// contents key for a leaf, a node key otherwise.
    pub fn save<'a>(&'a self, backend: &'a dyn Backend) -> BoxFuture<'a, BackendResult<Key>> {
        async move {
            match self {
                Self::Key(key) => Ok(key.clone()),
                Self::Contents(contents) => {
                    Ok(Key::Contents(backend.contents_add(contents).await?))
                }
                Self::Node(children) => {
                    let mut entries = Vec::with_capacity(children.len());
                    for (step, child) in children {
                        entries.push((step.clone(), child.save(backend).await?));
                    }
                    let node = Node::from_sorted_entries(entries);
                    Ok(Key::Node(backend.node_add(&node).await?))
                }
            }
        }
        .boxed()
    }

    /// The content digest of this tree, persisting unsaved layers first.
    pub async fn hash(&self, backend: &dyn Backend) -> BackendResult<Hash> {
        Ok(self.save(backend).await?.hash())
    }

    /// Fully materializes the tree for transfer to a client.
    pub fn to_local<'a>(&'a self, backend: &'a dyn Backend) -> BoxFuture<'a, BackendResult<LocalTree>> {
        async move {
            match self {
                Self::Contents(contents) => Ok(LocalTree::Contents(contents.clone())),
                Self::Key(Key::Contents(id)) => {
                    let contents = backend.contents_find(id).await?.ok_or_else(|| {
                        crate::backend::BackendError::ObjectNotFound {
                            object_type: "contents".to_string(),
                            hash: crate::object_id::ObjectId::hex(id),
                        }
                    })?;
                    Ok(LocalTree::Contents(contents))
                }
                Self::Key(Key::Node(_)) | Self::Node(_) => {
                    let children = self.level(backend).await?.unwrap_or_default();
                    let mut entries = Vec::with_capacity(children.len());
                    for (step, child) in children {
                        entries.push((step, child.to_local(backend).await?));
                    }
                    Ok(LocalTree::Node(entries))
                }
            }
        }
        .boxed()
    }
}

impl From<LocalTree> for Tree {
    fn from(local: LocalTree) -> Self {
        match local {
            LocalTree::Contents(contents) => Self::Contents(contents),
            LocalTree::Node(entries) => Self::Node(
                entries
                    .into_iter()
                    .map(|(step, child)| (step, Self::from(child)))
                    .collect(),
            ),
        }
    }
}

fn set_at(
    backend: &dyn Backend,
    tree: Tree,
    path: KeyPath,
    value: Option<Tree>,
) -> BoxFuture<'_, BackendResult<Option<Tree>>> {
    async move {
        let Some((step, rest)) = path.split_first() else {
            return Ok(value);
        };
        // A leaf in the middle of the path is overwritten by the write and
        // untouched by a removal.
        let mut children = match tree.level(backend).await? {
            Some(children) => children,
            None if value.is_some() => BTreeMap::new(),
            None => return Ok(Some(tree)),
        };
        let child = children.remove(step).unwrap_or_else(Tree::empty);
        if let Some(updated) = set_at(backend, child, rest, value).await? {
            children.insert(step.clone(), updated);
        }
        if children.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Tree::Node(children)))
        }
    }
    .boxed()
}

/// Concrete tree value shipped over the wire.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LocalTree {
    Contents(Contents),
    Node(Vec<(Step, LocalTree)>),
}

/// How a tree argument or result is named on the wire.
///
/// Responses always carry a [`TreeRef::Handle`]; requests may pass any
/// form. A handle only has meaning inside the session that allocated it.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TreeRef {
    Handle(u64),
    Key(Key),
    Local(LocalTree),
}

/// One entry of a `tree.batch_apply` request.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BatchOp {
    Add(Contents),
    AddTree(TreeRef),
    Remove,
}

impl Wire for EntryKind {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Contents => writer.write_u8(0).await,
            Self::Node => writer.write_u8(1).await,
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(Self::Contents),
            1 => Ok(Self::Node),
            tag => Err(invalid_data(format!("invalid entry kind {tag:#04x}"))),
        }
    }
}

fn encode_local<'a, W: AsyncWrite + Unpin + Send>(
    tree: &'a LocalTree,
    writer: &'a mut W,
) -> BoxFuture<'a, io::Result<()>> {
    async move {
        match tree {
            LocalTree::Contents(contents) => {
                writer.write_u8(0).await?;
                contents.encode(writer).await
            }
            LocalTree::Node(entries) => {
                writer.write_u8(1).await?;
                let len = u32::try_from(entries.len())
                    .map_err(|_| invalid_data("tree too large"))?;
                writer.write_u32(len).await?;
                for (step, child) in entries {
                    step.encode(writer).await?;
                    encode_local(child, writer).await?;
                }
                Ok(())
            }
        }
    }
    .boxed()
}

fn decode_local<R: AsyncRead + Unpin + Send>(reader: &mut R) -> BoxFuture<'_, io::Result<LocalTree>> {
    async move {
        match reader.read_u8().await? {
            0 => Ok(LocalTree::Contents(Contents::decode(reader).await?)),
            1 => {
                let len = read_len(reader).await?;
                let mut entries = Vec::with_capacity((len as usize).min(4096));
                for _ in 0..len {
                    let step = Step::decode(reader).await?;
                    let child = decode_local(reader).await?;
                    entries.push((step, child));
                }
                Ok(LocalTree::Node(entries))
            }
            tag => Err(invalid_data(format!("invalid tree tag {tag:#04x}"))),
        }
    }
    .boxed()
}

impl Wire for LocalTree {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        encode_local(self, writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        decode_local(reader).await
    }
}

impl Wire for TreeRef {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Handle(id) => {
                writer.write_u8(0).await?;
                writer.write_u64(*id).await
            }
            Self::Key(key) => {
                writer.write_u8(1).await?;
                key.encode(writer).await
            }
            Self::Local(local) => {
                writer.write_u8(2).await?;
                local.encode(writer).await
            }
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(Self::Handle(reader.read_u64().await?)),
            1 => Ok(Self::Key(Key::decode(reader).await?)),
            2 => Ok(Self::Local(LocalTree::decode(reader).await?)),
            tag => Err(invalid_data(format!("invalid tree ref tag {tag:#04x}"))),
        }
    }
}

impl Wire for BatchOp {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Add(contents) => {
                writer.write_u8(0).await?;
                contents.encode(writer).await
            }
            Self::AddTree(tree) => {
                writer.write_u8(1).await?;
                tree.encode(writer).await
            }
            Self::Remove => writer.write_u8(2).await,
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(Self::Add(Contents::decode(reader).await?)),
            1 => Ok(Self::AddTree(TreeRef::decode(reader).await?)),
            2 => Ok(Self::Remove),
            tag => Err(invalid_data(format!("invalid batch op tag {tag:#04x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use pollster::FutureExt as _;

    use super::*;
    use crate::mem_backend::MemBackend;
    use crate::wire;

    fn path(value: &str) -> KeyPath {
        KeyPath::parse(value).unwrap()
    }

    #[test]
    fn test_set_and_find() {
        let backend = MemBackend::new();
        let tree = Tree::empty();

        let tree = tree
            .set(&backend, &path("a/b"), Some(Tree::Contents(Contents::from("v1"))))
            .block_on()
            .unwrap();
        assert_eq!(
            tree.find(&backend, &path("a/b")).block_on().unwrap(),
            Some(Contents::from("v1"))
        );
        assert_eq!(tree.find(&backend, &path("a/c")).block_on().unwrap(), None);
        assert!(tree.mem(&backend, &path("a/b")).block_on().unwrap());
        assert!(tree.mem_tree(&backend, &path("a")).block_on().unwrap());
        assert!(!tree.mem_tree(&backend, &path("a/b")).block_on().unwrap());
    }

    #[test]
    fn test_set_does_not_touch_source() {
        let backend = MemBackend::new();
        let tree = Tree::empty()
            .set(&backend, &path("x"), Some(Tree::Contents(Contents::from("X"))))
            .block_on()
            .unwrap();
        let updated = tree
            .set(&backend, &path("y"), Some(Tree::Contents(Contents::from("Y"))))
            .block_on()
            .unwrap();

        assert_eq!(tree.find(&backend, &path("y")).block_on().unwrap(), None);
        assert_eq!(
            updated.find(&backend, &path("x")).block_on().unwrap(),
            Some(Contents::from("X"))
        );
        assert_eq!(
            updated.find(&backend, &path("y")).block_on().unwrap(),
            Some(Contents::from("Y"))
        );
    }

    #[test]
    fn test_remove_prunes_empty_nodes() {
        let backend = MemBackend::new();
        let tree = Tree::empty()
            .set(&backend, &path("a/b/c"), Some(Tree::Contents(Contents::from("v"))))
            .block_on()
            .unwrap();
        let tree = tree.set(&backend, &path("a/b/c"), None).block_on().unwrap();
        assert!(!tree.mem_tree(&backend, &path("a")).block_on().unwrap());
        assert_eq!(tree, Tree::empty());
    }

    #[test]
    fn test_list() {
        let backend = MemBackend::new();
        let tree = Tree::empty()
            .set(&backend, &path("x"), Some(Tree::Contents(Contents::from("X"))))
            .block_on()
            .unwrap()
            .set(&backend, &path("d/y"), Some(Tree::Contents(Contents::from("Y"))))
            .block_on()
            .unwrap();

        let mut entries = tree.list(&backend, &KeyPath::root()).block_on().unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (Step::new("d").unwrap(), EntryKind::Node),
                (Step::new("x").unwrap(), EntryKind::Contents),
            ]
        );
    }

    #[test]
    fn test_save_restores_through_key() {
        let backend = MemBackend::new();
        let tree = Tree::empty()
            .set(&backend, &path("a/b"), Some(Tree::Contents(Contents::from("v1"))))
            .block_on()
            .unwrap();

        let key = tree.save(&backend).block_on().unwrap();
        assert!(matches!(key, Key::Node(_)));
        let reloaded = Tree::Key(key);
        assert_eq!(
            reloaded.find(&backend, &path("a/b")).block_on().unwrap(),
            Some(Contents::from("v1"))
        );

        // A lone leaf saves as a contents key.
        let leaf = Tree::Contents(Contents::from("leaf"));
        assert!(matches!(
            leaf.save(&backend).block_on().unwrap(),
            Key::Contents(_)
        ));
    }

    #[test]
    fn test_save_is_content_addressed() {
        let backend = MemBackend::new();
        let make = || {
            Tree::empty()
                .set(&backend, &path("k"), Some(Tree::Contents(Contents::from("same"))))
                .block_on()
                .unwrap()
        };
        let first = make().save(&backend).block_on().unwrap();
        let second = make().save(&backend).block_on().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_to_local_roundtrip() {
        let backend = MemBackend::new();
        let tree = Tree::empty()
            .set(&backend, &path("a/b"), Some(Tree::Contents(Contents::from("v"))))
            .block_on()
            .unwrap();
        let local = tree.to_local(&backend).block_on().unwrap();
        let rebuilt = Tree::from(local.clone());
        assert_eq!(
            rebuilt.find(&backend, &path("a/b")).block_on().unwrap(),
            Some(Contents::from("v"))
        );

        // And the local tree survives the wire.
        let decoded: LocalTree = wire::from_slice(&wire::to_vec(&local)).unwrap();
        assert_eq!(decoded, local);
    }
}
