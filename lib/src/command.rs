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

//! The command registry.
//!
//! Every command is a descriptor binding a wire name to a handler that
//! knows its own request and response types; the dispatch loop stays
//! untyped. The table is built once at startup and read-only afterwards.
//! Names are lowercase, stable identifiers and part of the wire protocol.

#![expect(missing_docs)]

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;

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
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::connection::RpcError;
use crate::path::KeyPath;
use crate::session::Session;
use crate::slice::Slice;
use crate::tree::BatchOp;
use crate::tree::TreeRef;

/// Process-wide facts handlers may consult.
#[derive(Debug)]
pub struct ServerInfo {
    pub config: ServerConfig,
}

/// How a handled request ended, as far as the dispatch loop cares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Response written.
    Done,
    /// Body failed to decode; "Invalid arguments" was sent.
    BadRequest,
    /// The handler failed recoverably; an error reply was sent and the
    /// dispatch loop should back off briefly.
    Recovered,
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<Outcome, RpcError>>;

type HandlerFn =
    for<'a> fn(&'a mut Connection, &'a mut Session, &'a ServerInfo) -> HandlerFuture<'a>;

/// One entry of the command table: a wire name plus the erased handler
/// carrying the request/response codecs. Exactly one response frame (ok or
/// error) is produced per accepted request.
pub struct CommandDesc {
    pub name: &'static str,
    run: HandlerFn,
}

impl CommandDesc {
    pub async fn run(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        info: &ServerInfo,
    ) -> Result<Outcome, RpcError> {
        (self.run)(conn, session, info).await
    }
}

impl std::fmt::Debug for CommandDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDesc").field("name", &self.name).finish()
    }
}

// Binds a wire name to a typed handler body. The generated handler decodes
// the request with the command's request codec, runs the body, and writes
// exactly one response frame; recoverable failures become error frames
// while transport failures propagate and end the session.
macro_rules! command {
    ($name:literal, |$session:ident, $info:ident, $req:ident: $Req:ty| -> $Res:ty $body:block) => {{
        fn handler<'a>(
            conn: &'a mut Connection,
            session: &'a mut Session,
            info: &'a ServerInfo,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                let $req: $Req = match conn.read_request_body().await {
                    Ok(req) => req,
                    Err(err) => {
                        tracing::debug!(command = $name, err = %err, "malformed request body");
                        conn.reply_error("Invalid arguments").await?;
                        return Ok(Outcome::BadRequest);
                    }
                };
                let $session = session;
                let $info = info;
                let result: Result<$Res, RpcError> = async move $body.await;
                match result {
                    Ok(response) => {
                        conn.write_ok(&response).await?;
                        Ok(Outcome::Done)
                    }
                    Err(RpcError::Recoverable(message)) => {
                        conn.reply_error(&message).await?;
                        Ok(Outcome::Recovered)
                    }
                    Err(err) => Err(err),
                }
            })
        }
        CommandDesc {
            name: $name,
            run: handler,
        }
    }};
}

/// Looks a command up by its wire name.
pub fn of_name(name: &str) -> Option<&'static CommandDesc> {
    if name.bytes().any(|byte| byte.is_ascii_uppercase()) {
        return REGISTRY.get(name.to_ascii_lowercase().as_str());
    }
    REGISTRY.get(name)
}

/// Enumerates every registered command, ordered by name.
pub fn commands() -> impl Iterator<Item = &'static CommandDesc> {
    REGISTRY.values()
}

static REGISTRY: Lazy<BTreeMap<&'static str, CommandDesc>> = Lazy::new(|| {
    build_commands()
        .into_iter()
        .map(|desc| (desc.name, desc))
        .collect()
});

fn build_commands() -> Vec<CommandDesc> {
    vec![
        // Connectivity
        command!("ping", |session, _info, _req: ()| -> () {
            Ok(session.ping())
        }),
        // Branch selection
        command!("set_current_branch", |session, _info, req: BranchName| -> () {
            Ok(session.set_current_branch(req))
        }),
        command!("get_current_branch", |session, _info, _req: ()| -> BranchName {
            Ok(session.get_current_branch())
        }),
        command!("head", |session, _info, req: Option<BranchName>| -> Option<CommitId> {
            session.head(req).await
        }),
        command!("set_head", |session, _info, req: (Option<BranchName>, CommitId)| -> () {
            let (branch, head) = req;
            session.set_head(branch, head).await
        }),
        command!("remove_branch", |session, _info, req: BranchName| -> () {
            session.remove_branch(req).await
        }),
        // Store operations on the current branch
        command!("find", |session, _info, req: KeyPath| -> Option<Contents> {
            session.find(req).await
        }),
        command!("mem", |session, _info, req: KeyPath| -> bool {
            session.mem(req).await
        }),
        command!("mem_tree", |session, _info, req: KeyPath| -> bool {
            session.mem_tree(req).await
        }),
        command!("find_tree", |session, _info, req: KeyPath| -> Option<TreeRef> {
            session.find_tree(req).await
        }),
        command!("set", |session, _info, req: (KeyPath, CommitInfo, Contents)| -> CommitId {
            let (path, info, contents) = req;
            session.set(path, info, contents).await
        }),
        command!("set_tree", |session, _info, req: (KeyPath, CommitInfo, TreeRef)| -> CommitId {
            let (path, info, tree) = req;
            session.set_tree(path, info, tree).await
        }),
        command!("remove", |session, _info, req: (KeyPath, CommitInfo)| -> Option<CommitId> {
            let (path, info) = req;
            session.remove(path, info).await
        }),
        command!(
            "test_and_set",
            |session, _info, req: (KeyPath, CommitInfo, Option<Contents>, Option<Contents>)| -> bool {
                let (path, info, test, set) = req;
                session.test_and_set(path, info, test, set).await
            }
        ),
        command!(
            "test_and_set_tree",
            |session, _info, req: (KeyPath, CommitInfo, Option<TreeRef>, Option<TreeRef>)| -> bool {
                let (path, info, test, set) = req;
                session.test_and_set_tree(path, info, test, set).await
            }
        ),
        // Tree handles
        command!("tree.empty", |session, _info, _req: ()| -> TreeRef {
            Ok(session.tree_empty())
        }),
        command!("tree.add", |session, _info, req: (TreeRef, KeyPath, Contents)| -> TreeRef {
            let (tree, path, contents) = req;
            session.tree_add(tree, path, contents).await
        }),
        command!("tree.add_tree", |session, _info, req: (TreeRef, KeyPath, TreeRef)| -> TreeRef {
            let (tree, path, other) = req;
            session.tree_add_tree(tree, path, other).await
        }),
        command!("tree.remove", |session, _info, req: (TreeRef, KeyPath)| -> TreeRef {
            let (tree, path) = req;
            session.tree_remove(tree, path).await
        }),
        command!(
            "tree.batch_apply",
            |session, _info, req: (TreeRef, Vec<(KeyPath, BatchOp)>)| -> TreeRef {
                let (tree, ops) = req;
                session.tree_batch_apply(tree, ops).await
            }
        ),
        command!("tree.find", |session, _info, req: (TreeRef, KeyPath)| -> Option<Contents> {
            let (tree, path) = req;
            session.tree_find(tree, path).await
        }),
        command!("tree.mem", |session, _info, req: (TreeRef, KeyPath)| -> bool {
            let (tree, path) = req;
            session.tree_mem(tree, path).await
        }),
        command!("tree.mem_tree", |session, _info, req: (TreeRef, KeyPath)| -> bool {
            let (tree, path) = req;
            session.tree_mem_tree(tree, path).await
        }),
        command!(
            "tree.list",
            |session, _info, req: (TreeRef, KeyPath)| -> Vec<(crate::path::Step, crate::tree::EntryKind)> {
                let (tree, path) = req;
                session.tree_list(tree, path).await
            }
        ),
        command!("tree.hash", |session, _info, req: TreeRef| -> Hash {
            session.tree_hash(req).await
        }),
        command!("tree.key", |session, _info, req: TreeRef| -> Key {
            session.tree_key(req).await
        }),
        command!("tree.to_local", |session, _info, req: TreeRef| -> crate::tree::LocalTree {
            session.tree_to_local(req).await
        }),
        command!("tree.of_path", |session, _info, req: KeyPath| -> TreeRef {
            session.tree_of_path(req).await
        }),
        command!("tree.of_hash", |session, _info, req: Hash| -> TreeRef {
            session.tree_of_hash(req).await
        }),
        command!("tree.of_commit", |session, _info, req: Hash| -> TreeRef {
            session.tree_of_commit(req).await
        }),
        command!("tree.save", |session, _info, req: TreeRef| -> Key {
            session.tree_save(req).await
        }),
        command!("tree.merge", |session, _info, req: (TreeRef, TreeRef, TreeRef)| -> TreeRef {
            let (base, ours, theirs) = req;
            session.tree_merge(base, ours, theirs).await
        }),
        command!("tree.abort", |session, _info, req: TreeRef| -> () {
            Ok(session.tree_cleanup(req))
        }),
        command!("tree.cleanup", |session, _info, req: TreeRef| -> () {
            Ok(session.tree_cleanup(req))
        }),
        command!("tree.cleanup_all", |session, _info, _req: ()| -> () {
            Ok(session.tree_cleanup_all())
        }),
        // Repository
        command!("export", |session, _info, req: Option<u64>| -> Slice {
            session.export(req).await
        }),
        command!("import", |session, _info, req: Slice| -> () {
            session.import(req).await
        }),
        command!("new_commit", |session, _info, req: (CommitInfo, Vec<CommitId>, Key)| -> CommitId {
            let (info, parents, tree) = req;
            session.new_commit(info, parents, tree).await
        }),
        // Contents store passthrough
        command!("contents.mem", |session, _info, req: ContentsId| -> bool {
            session.contents_mem(req).await
        }),
        command!("contents.find", |session, _info, req: ContentsId| -> Option<Contents> {
            session.contents_find(req).await
        }),
        command!("contents.add", |session, _info, req: Contents| -> ContentsId {
            session.contents_add(req).await
        }),
        command!("contents.unsafe_add", |session, _info, req: (ContentsId, Contents)| -> () {
            let (id, contents) = req;
            session.contents_unsafe_add(id, contents).await
        }),
        command!("contents.index", |session, _info, req: Hash| -> Option<ContentsId> {
            session.contents_index(req).await
        }),
        command!(
            "contents.merge",
            |session, _info, req: (Option<ContentsId>, Option<ContentsId>, Option<ContentsId>)|
                -> crate::merge::MergeOutcome<Option<ContentsId>> {
                let (base, ours, theirs) = req;
                session.contents_merge(base, ours, theirs).await
            }
        ),
        // Node store passthrough
        command!("node.mem", |session, _info, req: NodeId| -> bool {
            session.node_mem(req).await
        }),
        command!("node.find", |session, _info, req: NodeId| -> Option<Node> {
            session.node_find(req).await
        }),
        command!("node.add", |session, _info, req: Node| -> NodeId {
            session.node_add(req).await
        }),
        command!("node.unsafe_add", |session, _info, req: (NodeId, Node)| -> () {
            let (id, node) = req;
            session.node_unsafe_add(id, node).await
        }),
        command!("node.index", |session, _info, req: Hash| -> Option<NodeId> {
            session.node_index(req).await
        }),
        command!(
            "node.merge",
            |session, _info, req: (Option<NodeId>, Option<NodeId>, Option<NodeId>)|
                -> crate::merge::MergeOutcome<Option<NodeId>> {
                let (base, ours, theirs) = req;
                session.node_merge(base, ours, theirs).await
            }
        ),
        // Commit store passthrough
        command!("commit.mem", |session, _info, req: CommitId| -> bool {
            session.commit_mem(req).await
        }),
        command!("commit.find", |session, _info, req: CommitId| -> Option<Commit> {
            session.commit_find(req).await
        }),
        command!("commit.add", |session, _info, req: Commit| -> CommitId {
            session.commit_add(req).await
        }),
        command!("commit.unsafe_add", |session, _info, req: (CommitId, Commit)| -> () {
            let (id, commit) = req;
            session.commit_unsafe_add(id, commit).await
        }),
        command!("commit.index", |session, _info, req: Hash| -> Option<CommitId> {
            session.commit_index(req).await
        }),
        command!(
            "commit.merge",
            |session, _info, req: (CommitInfo, Option<CommitId>, CommitId, CommitId)|
                -> crate::merge::MergeOutcome<CommitId> {
                let (info, base, ours, theirs) = req;
                session.commit_merge(info, base, ours, theirs).await
            }
        ),
        // Branch registry passthrough
        command!("branch.mem", |session, _info, req: BranchName| -> bool {
            session.branch_mem(req).await
        }),
        command!("branch.find", |session, _info, req: BranchName| -> Option<CommitId> {
            session.branch_find(req).await
        }),
        command!("branch.set", |session, _info, req: (BranchName, CommitId)| -> () {
            let (branch, head) = req;
            session.branch_set(branch, head).await
        }),
        command!(
            "branch.test_and_set",
            |session, _info, req: (BranchName, Option<CommitId>, Option<CommitId>)| -> bool {
                let (branch, old, new) = req;
                session.branch_test_and_set(branch, old, new).await
            }
        ),
        command!("branch.remove", |session, _info, req: BranchName| -> () {
            session.branch_remove(req).await
        }),
        command!("branch.list", |session, _info, _req: ()| -> Vec<BranchName> {
            session.branch_list().await
        }),
        command!("branch.clear", |session, _info, _req: ()| -> () {
            session.branch_clear().await
        }),
        // Watches
        command!("branch.watch", |session, _info, _req: ()| -> () {
            session.branch_watch()
        }),
        command!("branch.watch_key", |session, _info, req: BranchName| -> () {
            session.branch_watch_key(req)
        }),
        command!("branch.unwatch", |session, _info, _req: ()| -> () {
            Ok(session.branch_unwatch())
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_name() {
        assert_eq!(of_name("ping").unwrap().name, "ping");
        assert_eq!(of_name("tree.add").unwrap().name, "tree.add");
        // Names are matched lowercase.
        assert_eq!(of_name("PING").unwrap().name, "ping");
        assert!(of_name("no-such-command").is_none());
    }

    #[test]
    fn test_registry_is_complete() {
        let names: Vec<&str> = commands().map(|desc| desc.name).collect();
        // Spot-check each command group.
        for name in [
            "ping",
            "set_current_branch",
            "test_and_set",
            "tree.empty",
            "tree.merge",
            "tree.cleanup_all",
            "export",
            "new_commit",
            "contents.unsafe_add",
            "node.index",
            "commit.merge",
            "branch.watch_key",
            "branch.unwatch",
        ] {
            assert!(names.contains(&name), "missing command {name}");
        }
        // Enumeration is sorted and duplicate-free.
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }
}
