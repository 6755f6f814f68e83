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

//! The client runtime.
//!
//! A [`Client`] owns one connection and presents a single-threaded
//! request/response surface; callers wanting parallelism open more
//! clients. When the transport drops underneath a request, the client
//! re-establishes the connection (handshake included) and retries that
//! request exactly once; the retried request is the only one that may be
//! replayed, and a second failure surfaces to the caller.
//!
//! Less common commands without a typed wrapper go through [`Client::request`]
//! with the wire name and body; the codecs are picked by the body types.

#![expect(missing_docs)]

use std::collections::VecDeque;

use tracing::debug;

use crate::backend::BranchEvent;
use crate::backend::BranchName;
use crate::backend::CommitId;
use crate::backend::CommitInfo;
use crate::backend::Contents;
use crate::backend::Hash;
use crate::backend::Key;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::connection::RpcError;
use crate::path::KeyPath;
use crate::slice::Slice;
use crate::transport;
use crate::transport::Addr;
use crate::transport::TransportError;
use crate::tree::BatchOp;
use crate::tree::EntryKind;
use crate::tree::LocalTree;
use crate::tree::TreeRef;
use crate::wire::Message;
use crate::wire::WireFormat;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error frame. The connection stays
    /// usable.
    #[error("Server error: {0}")]
    Remote(String),
    /// A tree value was used after its session went away.
    #[error("Tree handle belongs to a disconnected session")]
    StaleTree,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(RpcError),
}

impl ClientError {
    fn is_disconnect(&self) -> bool {
        match self {
            Self::Rpc(err) => err.is_disconnect(),
            _ => false,
        }
    }
}

/// Client-side name for a server-resident tree.
///
/// The pair of session generation and server handle; operations route to
/// the session that allocated the handle, and using a tree after that
/// session disconnected fails on first use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tree {
    generation: u64,
    id: u64,
}

impl Tree {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One protocol connection to a server.
pub struct Client {
    config: ClientConfig,
    format: WireFormat,
    conn: Option<Connection>,
    // Bumped on every (re)connect; tree handles carry the generation they
    // were allocated under.
    generation: u64,
    events: VecDeque<BranchEvent>,
}

impl Client {
    /// Connects and performs the handshake with the compact binary codec.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with_format(config, WireFormat::Binary).await
    }

    /// Connects with an explicit codec family.
    pub async fn connect_with_format(
        config: ClientConfig,
        format: WireFormat,
    ) -> Result<Self, ClientError> {
        let mut client = Self {
            config,
            format,
            conn: None,
            generation: 0,
            events: VecDeque::new(),
        };
        client.ensure_connected().await?;
        Ok(client)
    }

    fn addr(&self) -> Result<Addr, TransportError> {
        let addr: Addr = self.config.uri.parse()?;
        if self.config.tls {
            if let Addr::Tcp { host, port } = addr {
                return Ok(Addr::TcpTls { host, port });
            }
        }
        Ok(addr)
    }

    async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let addr = self.addr()?;
        let stream = transport::connect(&addr).await?;
        let conn = Connection::connect(stream, self.format)
            .await
            .map_err(ClientError::Rpc)?;
        self.generation += 1;
        self.conn = Some(conn);
        debug!(%addr, generation = self.generation, "connected");
        Ok(())
    }

    /// Sends one request and decodes its response, reconnecting and
    /// retrying exactly once when the transport is gone.
    pub async fn request<Req: Message, Res: Message>(
        &mut self,
        name: &str,
        body: &Req,
    ) -> Result<Res, ClientError> {
        let mut reconnected = false;
        loop {
            match self.try_request(name, body).await {
                Err(err) if err.is_disconnect() && !reconnected => {
                    debug!(command = name, "transport closed, reconnecting once");
                    self.conn = None;
                    reconnected = true;
                }
                other => return other,
            }
        }
    }

    async fn try_request<Req: Message, Res: Message>(
        &mut self,
        name: &str,
        body: &Req,
    ) -> Result<Res, ClientError> {
        self.ensure_connected().await?;
        let conn = self.conn.as_mut().expect("just connected");
        conn.write_request(name, body)
            .await
            .map_err(ClientError::Rpc)?;
        match conn
            .read_response::<Res>(&mut self.events)
            .await
            .map_err(ClientError::Rpc)?
        {
            Ok(response) => Ok(response),
            Err(message) => Err(ClientError::Remote(message)),
        }
    }

    fn wrap_tree(&self, tree: TreeRef) -> Result<Tree, ClientError> {
        match tree {
            TreeRef::Handle(id) => Ok(Tree {
                generation: self.generation,
                id,
            }),
            other => Err(ClientError::Rpc(RpcError::Io(crate::wire::invalid_data(
                format!("expected tree handle in response, got {other:?}"),
            )))),
        }
    }

    fn tree_ref(&self, tree: &Tree) -> Result<TreeRef, ClientError> {
        if tree.generation != self.generation {
            return Err(ClientError::StaleTree);
        }
        Ok(TreeRef::Handle(tree.id))
    }

    // Connectivity

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.request("ping", &()).await
    }

    // Branch selection

    pub async fn set_current_branch(&mut self, branch: BranchName) -> Result<(), ClientError> {
        self.request("set_current_branch", &branch).await
    }

    pub async fn get_current_branch(&mut self) -> Result<BranchName, ClientError> {
        self.request("get_current_branch", &()).await
    }

    pub async fn head(
        &mut self,
        branch: Option<BranchName>,
    ) -> Result<Option<CommitId>, ClientError> {
        self.request("head", &branch).await
    }

    pub async fn set_head(
        &mut self,
        branch: Option<BranchName>,
        head: CommitId,
    ) -> Result<(), ClientError> {
        self.request("set_head", &(branch, head)).await
    }

    pub async fn remove_branch(&mut self, branch: BranchName) -> Result<(), ClientError> {
        self.request("remove_branch", &branch).await
    }

    pub async fn branches(&mut self) -> Result<Vec<BranchName>, ClientError> {
        self.request("branch.list", &()).await
    }

    // Store operations on the current branch

    pub async fn find(&mut self, path: KeyPath) -> Result<Option<Contents>, ClientError> {
        self.request("find", &path).await
    }

    pub async fn mem(&mut self, path: KeyPath) -> Result<bool, ClientError> {
        self.request("mem", &path).await
    }

    pub async fn mem_tree(&mut self, path: KeyPath) -> Result<bool, ClientError> {
        self.request("mem_tree", &path).await
    }

    pub async fn find_tree(&mut self, path: KeyPath) -> Result<Option<Tree>, ClientError> {
        let tree: Option<TreeRef> = self.request("find_tree", &path).await?;
        tree.map(|tree| self.wrap_tree(tree)).transpose()
    }

    pub async fn set(
        &mut self,
        path: KeyPath,
        info: CommitInfo,
        contents: Contents,
    ) -> Result<CommitId, ClientError> {
        self.request("set", &(path, info, contents)).await
    }

    pub async fn set_tree(
        &mut self,
        path: KeyPath,
        info: CommitInfo,
        tree: &Tree,
    ) -> Result<CommitId, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("set_tree", &(path, info, tree)).await
    }

    pub async fn remove(
        &mut self,
        path: KeyPath,
        info: CommitInfo,
    ) -> Result<Option<CommitId>, ClientError> {
        self.request("remove", &(path, info)).await
    }

    pub async fn test_and_set(
        &mut self,
        path: KeyPath,
        info: CommitInfo,
        test: Option<Contents>,
        set: Option<Contents>,
    ) -> Result<bool, ClientError> {
        self.request("test_and_set", &(path, info, test, set)).await
    }

    // Tree handles

    pub async fn tree_empty(&mut self) -> Result<Tree, ClientError> {
        let tree: TreeRef = self.request("tree.empty", &()).await?;
        self.wrap_tree(tree)
    }

    pub async fn tree_add(
        &mut self,
        tree: &Tree,
        path: KeyPath,
        contents: Contents,
    ) -> Result<Tree, ClientError> {
        let tree = self.tree_ref(tree)?;
        let updated: TreeRef = self.request("tree.add", &(tree, path, contents)).await?;
        self.wrap_tree(updated)
    }

    pub async fn tree_add_tree(
        &mut self,
        tree: &Tree,
        path: KeyPath,
        other: &Tree,
    ) -> Result<Tree, ClientError> {
        let tree = self.tree_ref(tree)?;
        let other = self.tree_ref(other)?;
        let updated: TreeRef = self.request("tree.add_tree", &(tree, path, other)).await?;
        self.wrap_tree(updated)
    }

    pub async fn tree_remove(&mut self, tree: &Tree, path: KeyPath) -> Result<Tree, ClientError> {
        let tree = self.tree_ref(tree)?;
        let updated: TreeRef = self.request("tree.remove", &(tree, path)).await?;
        self.wrap_tree(updated)
    }

    pub async fn tree_batch_apply(
        &mut self,
        tree: &Tree,
        ops: Vec<(KeyPath, BatchOp)>,
    ) -> Result<Tree, ClientError> {
        let tree = self.tree_ref(tree)?;
        let updated: TreeRef = self.request("tree.batch_apply", &(tree, ops)).await?;
        self.wrap_tree(updated)
    }

    pub async fn tree_find(
        &mut self,
        tree: &Tree,
        path: KeyPath,
    ) -> Result<Option<Contents>, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.find", &(tree, path)).await
    }

    pub async fn tree_mem(&mut self, tree: &Tree, path: KeyPath) -> Result<bool, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.mem", &(tree, path)).await
    }

    pub async fn tree_mem_tree(&mut self, tree: &Tree, path: KeyPath) -> Result<bool, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.mem_tree", &(tree, path)).await
    }

    pub async fn tree_list(
        &mut self,
        tree: &Tree,
        path: KeyPath,
    ) -> Result<Vec<(crate::path::Step, EntryKind)>, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.list", &(tree, path)).await
    }

    pub async fn tree_hash(&mut self, tree: &Tree) -> Result<Hash, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.hash", &tree).await
    }

    pub async fn tree_key(&mut self, tree: &Tree) -> Result<Key, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.key", &tree).await
    }

    pub async fn tree_save(&mut self, tree: &Tree) -> Result<Key, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.save", &tree).await
    }

    pub async fn tree_to_local(&mut self, tree: &Tree) -> Result<LocalTree, ClientError> {
        let tree = self.tree_ref(tree)?;
        self.request("tree.to_local", &tree).await
    }

    pub async fn tree_of_path(&mut self, path: KeyPath) -> Result<Tree, ClientError> {
        let tree: TreeRef = self.request("tree.of_path", &path).await?;
        self.wrap_tree(tree)
    }

    pub async fn tree_of_hash(&mut self, hash: Hash) -> Result<Tree, ClientError> {
        let tree: TreeRef = self.request("tree.of_hash", &hash).await?;
        self.wrap_tree(tree)
    }

    pub async fn tree_of_commit(&mut self, hash: Hash) -> Result<Tree, ClientError> {
        let tree: TreeRef = self.request("tree.of_commit", &hash).await?;
        self.wrap_tree(tree)
    }

    pub async fn tree_merge(
        &mut self,
        base: &Tree,
        ours: &Tree,
        theirs: &Tree,
    ) -> Result<Tree, ClientError> {
        let base = self.tree_ref(base)?;
        let ours = self.tree_ref(ours)?;
        let theirs = self.tree_ref(theirs)?;
        let merged: TreeRef = self.request("tree.merge", &(base, ours, theirs)).await?;
        self.wrap_tree(merged)
    }

    pub async fn tree_cleanup(&mut self, tree: Tree) -> Result<(), ClientError> {
        let tree = self.tree_ref(&tree)?;
        self.request("tree.cleanup", &tree).await
    }

    pub async fn tree_cleanup_all(&mut self) -> Result<(), ClientError> {
        self.request("tree.cleanup_all", &()).await
    }

    // Repository

    pub async fn export(&mut self, depth: Option<u64>) -> Result<Slice, ClientError> {
        self.request("export", &depth).await
    }

    pub async fn import(&mut self, slice: Slice) -> Result<(), ClientError> {
        self.request("import", &slice).await
    }

    pub async fn new_commit(
        &mut self,
        info: CommitInfo,
        parents: Vec<CommitId>,
        tree: Key,
    ) -> Result<CommitId, ClientError> {
        self.request("new_commit", &(info, parents, tree)).await
    }

    // Watches

    /// Installs the all-branches watch on this connection.
    pub async fn watch(&mut self) -> Result<(), ClientError> {
        self.request("branch.watch", &()).await
    }

    /// Installs a single-branch watch on this connection.
    pub async fn watch_key(&mut self, branch: BranchName) -> Result<(), ClientError> {
        self.request("branch.watch_key", &branch).await
    }

    pub async fn unwatch(&mut self) -> Result<(), ClientError> {
        self.request("branch.unwatch", &()).await
    }

    /// The next branch notification: either one queued up while reading
    /// responses, or the next notification frame off the connection.
    pub async fn next_event(&mut self) -> Result<BranchEvent, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        self.ensure_connected().await?;
        let conn = self.conn.as_mut().expect("just connected");
        conn.read_event().await.map_err(ClientError::Rpc)
    }
}
