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

use assert_matches::assert_matches;
use dagkv_lib::backend::Contents;
use dagkv_lib::backend::Key;
use dagkv_lib::client::ClientError;
use dagkv_lib::path::KeyPath;
use dagkv_lib::path::Step;
use dagkv_lib::tree::BatchOp;
use dagkv_lib::tree::EntryKind;
use dagkv_lib::tree::LocalTree;
use dagkv_lib::tree::TreeRef;
use pretty_assertions::assert_eq;
use testutils::TestServer;
use testutils::commit_info;
use testutils::contents;
use testutils::key_path;

#[tokio::test]
async fn test_tree_compose_and_inspect() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let h0 = client.tree_empty().await.unwrap();
    let h1 = client
        .tree_add(&h0, key_path("x"), contents("X"))
        .await
        .unwrap();
    let h2 = client
        .tree_add(&h1, key_path("y"), contents("Y"))
        .await
        .unwrap();

    let mut listing = client.tree_list(&h2, KeyPath::root()).await.unwrap();
    listing.sort();
    assert_eq!(
        listing,
        vec![
            (Step::new("x").unwrap(), EntryKind::Contents),
            (Step::new("y").unwrap(), EntryKind::Contents),
        ]
    );

    // Source handles stay valid after producing new trees.
    client.tree_cleanup(h0).await.unwrap();
    client.tree_cleanup(h1).await.unwrap();
    assert!(client.tree_mem(&h2, key_path("x")).await.unwrap());
    assert_eq!(
        client.tree_find(&h2, key_path("y")).await.unwrap(),
        Some(contents("Y"))
    );
}

#[tokio::test]
async fn test_tree_handles_are_session_scoped() {
    let server = TestServer::start().await;
    let mut owner = server.client().await;
    let mut intruder = server.client().await;

    let tree = owner.tree_empty().await.unwrap();
    let tree = owner
        .tree_add(&tree, key_path("x"), contents("X"))
        .await
        .unwrap();
    assert!(owner.tree_mem(&tree, key_path("x")).await.unwrap());

    // The same integer means nothing in another session.
    let err = intruder
        .request::<(TreeRef, KeyPath), bool>("tree.mem", &(TreeRef::Handle(tree.id()), key_path("x")))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("unknown tree handle"));
}

#[tokio::test]
async fn test_unknown_handle_is_recoverable() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let err = client
        .request::<TreeRef, Key>("tree.save", &TreeRef::Handle(999))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("unknown tree handle"));

    // The session survives the mistake.
    client.ping().await.unwrap();
    client.tree_empty().await.unwrap();
}

#[tokio::test]
async fn test_tree_batch_apply() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    let tree = client
        .tree_batch_apply(
            &tree,
            vec![
                (key_path("x"), BatchOp::Add(contents("X"))),
                (key_path("d/y"), BatchOp::Add(contents("Y"))),
                (key_path("x"), BatchOp::Remove),
            ],
        )
        .await
        .unwrap();

    assert!(!client.tree_mem(&tree, key_path("x")).await.unwrap());
    assert_eq!(
        client.tree_find(&tree, key_path("d/y")).await.unwrap(),
        Some(contents("Y"))
    );
    assert!(client.tree_mem_tree(&tree, key_path("d")).await.unwrap());
}

#[tokio::test]
async fn test_tree_save_and_hydrate() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    let tree = client
        .tree_add(&tree, key_path("a/b"), contents("v"))
        .await
        .unwrap();

    // Saving yields a node key for a branching tree.
    let key = client.tree_save(&tree).await.unwrap();
    assert_matches!(key, Key::Node(_));

    // Equal trees save to equal keys, and the hash round-trips through
    // tree.of_hash.
    let hash = client.tree_hash(&tree).await.unwrap();
    assert_eq!(client.tree_key(&tree).await.unwrap(), key);
    let hydrated = client.tree_of_hash(hash).await.unwrap();
    assert_eq!(
        client.tree_find(&hydrated, key_path("a/b")).await.unwrap(),
        Some(contents("v"))
    );

    // A lone leaf saves as a contents key.
    let leaf = client.tree_empty().await.unwrap();
    let leaf = client
        .tree_add(&leaf, key_path("only"), contents("leaf"))
        .await
        .unwrap();
    let sub = client
        .request::<(TreeRef, KeyPath), Option<Contents>>(
            "tree.find",
            &(TreeRef::Handle(leaf.id()), key_path("only")),
        )
        .await
        .unwrap();
    assert_eq!(sub, Some(contents("leaf")));
}

#[tokio::test]
async fn test_tree_to_local_and_back() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    let tree = client
        .tree_add(&tree, key_path("a/b"), contents("v"))
        .await
        .unwrap();
    let local = client.tree_to_local(&tree).await.unwrap();
    let LocalTree::Node(entries) = &local else {
        panic!("expected a node at the root, got {local:?}");
    };
    assert_eq!(entries.len(), 1);

    // A local tree can be passed back by value as a tree argument.
    let roundtripped: TreeRef = client
        .request("tree.add", &(
            TreeRef::Local(local.clone()),
            key_path("c"),
            contents("w"),
        ))
        .await
        .unwrap();
    let tree = TreeRef::Handle(match roundtripped {
        TreeRef::Handle(id) => id,
        other => panic!("expected handle, got {other:?}"),
    });
    let found: Option<Contents> = client
        .request("tree.find", &(tree, key_path("a/b")))
        .await
        .unwrap();
    assert_eq!(found, Some(contents("v")));
}

#[tokio::test]
async fn test_tree_of_path_and_set_tree() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .set(key_path("src/a"), commit_info("init"), contents("A"))
        .await
        .unwrap();

    // Hydrate the subtree at src and graft it somewhere else.
    let subtree = client.tree_of_path(key_path("src")).await.unwrap();
    client
        .set_tree(key_path("dst"), commit_info("graft"), &subtree)
        .await
        .unwrap();
    assert_eq!(
        client.find(key_path("dst/a")).await.unwrap(),
        Some(contents("A"))
    );

    // An absent path hydrates as the empty tree.
    let empty = client.tree_of_path(key_path("nowhere")).await.unwrap();
    assert_eq!(
        client.tree_list(&empty, KeyPath::root()).await.unwrap(),
        vec![]
    );
}

#[tokio::test]
async fn test_tree_of_commit() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let head = client
        .set(key_path("k"), commit_info("set"), contents("v"))
        .await
        .unwrap();
    let hash = dagkv_lib::backend::Hash::from_bytes(
        dagkv_lib::object_id::ObjectId::as_bytes(&head),
    );
    let tree = client.tree_of_commit(hash).await.unwrap();
    assert_eq!(
        client.tree_find(&tree, key_path("k")).await.unwrap(),
        Some(contents("v"))
    );
}

#[tokio::test]
async fn test_tree_merge() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let base = client.tree_empty().await.unwrap();
    let base = client
        .tree_add(&base, key_path("shared"), contents("S"))
        .await
        .unwrap();
    let ours = client
        .tree_add(&base, key_path("left"), contents("L"))
        .await
        .unwrap();
    let theirs = client
        .tree_add(&base, key_path("right"), contents("R"))
        .await
        .unwrap();

    let merged = client.tree_merge(&base, &ours, &theirs).await.unwrap();
    for (path, value) in [("shared", "S"), ("left", "L"), ("right", "R")] {
        assert_eq!(
            client.tree_find(&merged, key_path(path)).await.unwrap(),
            Some(contents(value)),
            "at {path}"
        );
    }

    // Diverging writes to the same path conflict, recoverably.
    let ours = client
        .tree_add(&base, key_path("shared"), contents("L"))
        .await
        .unwrap();
    let theirs = client
        .tree_add(&base, key_path("shared"), contents("R"))
        .await
        .unwrap();
    let err = client.tree_merge(&base, &ours, &theirs).await.unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("conflict"));
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_test_and_set_tree() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .set(key_path("dir/a"), commit_info("init"), contents("A"))
        .await
        .unwrap();
    let current = client.tree_of_path(key_path("dir")).await.unwrap();
    let replacement = client.tree_empty().await.unwrap();
    let replacement = client
        .tree_add(&replacement, key_path("b"), contents("B"))
        .await
        .unwrap();

    // Swap succeeds against the observed subtree.
    let swapped: bool = client
        .request(
            "test_and_set_tree",
            &(
                key_path("dir"),
                commit_info("swap"),
                Some(TreeRef::Handle(current.id())),
                Some(TreeRef::Handle(replacement.id())),
            ),
        )
        .await
        .unwrap();
    assert!(swapped);
    assert_eq!(client.find(key_path("dir/a")).await.unwrap(), None);
    assert_eq!(
        client.find(key_path("dir/b")).await.unwrap(),
        Some(contents("B"))
    );

    // The stale expectation now fails without changing anything.
    let swapped: bool = client
        .request(
            "test_and_set_tree",
            &(
                key_path("dir"),
                commit_info("swap again"),
                Some(TreeRef::Handle(current.id())),
                None::<TreeRef>,
            ),
        )
        .await
        .unwrap();
    assert!(!swapped);
    assert_eq!(
        client.find(key_path("dir/b")).await.unwrap(),
        Some(contents("B"))
    );
}

#[tokio::test]
async fn test_cleanup_all_invalidates_handles() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    client.tree_cleanup_all().await.unwrap();
    let err = client.tree_hash(&tree).await.unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("unknown tree handle"));
}

#[tokio::test]
async fn test_stale_tree_after_reconnect() {
    let mut server = TestServer::start_unix().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    server.restart().await;
    // The next request reconnects under a new session.
    client.ping().await.unwrap();

    let err = client
        .tree_add(&tree, key_path("x"), contents("X"))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::StaleTree);
}

#[tokio::test]
async fn test_new_commit() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let tree = client.tree_empty().await.unwrap();
    let tree = client
        .tree_add(&tree, key_path("k"), contents("v"))
        .await
        .unwrap();
    let key = client.tree_save(&tree).await.unwrap();

    let commit_id = client
        .new_commit(commit_info("handmade"), vec![], key)
        .await
        .unwrap();
    client.set_head(None, commit_id.clone()).await.unwrap();
    assert_eq!(
        client.find(key_path("k")).await.unwrap(),
        Some(contents("v"))
    );

    // A commit referencing an unknown parent is rejected.
    let tree = client.tree_save(&tree).await.unwrap();
    let err = client
        .new_commit(
            commit_info("orphan"),
            vec![dagkv_lib::backend::CommitId::from_hex("00ff")],
            tree,
        )
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("does not resolve"));
}
