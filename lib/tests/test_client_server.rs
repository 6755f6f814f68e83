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
use dagkv_lib::backend::BranchEvent;
use dagkv_lib::backend::BranchName;
use dagkv_lib::backend::Contents;
use dagkv_lib::backend::ContentsId;
use dagkv_lib::client::ClientError;
use dagkv_lib::wire::WireFormat;
use testutils::TestServer;
use testutils::commit_info;
use testutils::contents;
use testutils::key_path;

#[tokio::test]
async fn test_ping() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_set_find_mem() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .set(key_path("a/b"), commit_info("set v1"), contents("v1"))
        .await
        .unwrap();
    assert_eq!(
        client.find(key_path("a/b")).await.unwrap(),
        Some(contents("v1"))
    );
    assert_eq!(client.find(key_path("a/c")).await.unwrap(), None);
    assert!(client.mem(key_path("a/b")).await.unwrap());
    assert!(client.mem_tree(key_path("a")).await.unwrap());
}

#[tokio::test]
async fn test_cas_failure_leaves_value() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .set(key_path("k"), commit_info("init"), contents("A"))
        .await
        .unwrap();
    let swapped = client
        .test_and_set(
            key_path("k"),
            commit_info("cas"),
            Some(contents("B")),
            Some(contents("C")),
        )
        .await
        .unwrap();
    assert!(!swapped);
    assert_eq!(
        client.find(key_path("k")).await.unwrap(),
        Some(contents("A"))
    );
}

#[tokio::test]
async fn test_unknown_command_keeps_connection_usable() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    // Header-only request for a name the registry has never heard of.
    let err = client
        .request::<(), ()>("no-such-command", &())
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message == "unknown command");

    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_invalid_arguments_keeps_connection_usable() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    // `mem` expects a path; a list with an empty step has the right shape
    // on the wire but fails validation in the decoder.
    let err = client
        .request::<Vec<String>, bool>("mem", &vec![String::new()])
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message == "Invalid arguments");

    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_sequential_requests_are_ordered() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    for i in 0..10 {
        client
            .set(
                key_path("counter"),
                commit_info(&format!("write {i}")),
                contents(&i.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(
            client.find(key_path("counter")).await.unwrap(),
            Some(contents(&i.to_string()))
        );
    }
}

#[tokio::test]
async fn test_json_codec_family() {
    let server = TestServer::start().await;
    let mut client = server.client_with_format(WireFormat::Json).await;

    client.ping().await.unwrap();
    client
        .set(key_path("a/b"), commit_info("set"), contents("v1"))
        .await
        .unwrap();
    assert_eq!(
        client.find(key_path("a/b")).await.unwrap(),
        Some(contents("v1"))
    );

    // Both families read the same repository.
    let mut binary = server.client().await;
    assert_eq!(
        binary.find(key_path("a/b")).await.unwrap(),
        Some(contents("v1"))
    );
}

#[tokio::test]
async fn test_branch_selection() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    assert_eq!(
        client.get_current_branch().await.unwrap(),
        BranchName::new("main")
    );
    client
        .set(key_path("k"), commit_info("on main"), contents("M"))
        .await
        .unwrap();

    client
        .set_current_branch(BranchName::new("dev"))
        .await
        .unwrap();
    assert_eq!(
        client.get_current_branch().await.unwrap(),
        BranchName::new("dev")
    );
    // The store view follows the branch: dev starts unborn.
    assert_eq!(client.find(key_path("k")).await.unwrap(), None);
    client
        .set(key_path("k"), commit_info("on dev"), contents("D"))
        .await
        .unwrap();

    let mut branches = client.branches().await.unwrap();
    branches.sort();
    assert_eq!(
        branches,
        vec![BranchName::new("dev"), BranchName::new("main")]
    );

    assert!(client.head(Some(BranchName::new("dev"))).await.unwrap().is_some());
    client.remove_branch(BranchName::new("dev")).await.unwrap();
    assert_eq!(client.head(Some(BranchName::new("dev"))).await.unwrap(), None);
}

#[tokio::test]
async fn test_head_and_set_head() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let first = client
        .set(key_path("k"), commit_info("first"), contents("1"))
        .await
        .unwrap();
    let second = client
        .set(key_path("k"), commit_info("second"), contents("2"))
        .await
        .unwrap();
    assert_eq!(client.head(None).await.unwrap(), Some(second));

    // Rolling the branch back makes the old value visible again.
    client.set_head(None, first.clone()).await.unwrap();
    assert_eq!(client.head(None).await.unwrap(), Some(first));
    assert_eq!(
        client.find(key_path("k")).await.unwrap(),
        Some(contents("1"))
    );
}

#[tokio::test]
async fn test_reconnect_after_server_restart() {
    let mut server = TestServer::start_unix().await;
    let mut client = server.client().await;

    client
        .set(key_path("k"), commit_info("set"), contents("A"))
        .await
        .unwrap();
    assert_eq!(
        client.find(key_path("k")).await.unwrap(),
        Some(contents("A"))
    );

    // Kill the server from outside and bring a new one up on the same
    // socket. The client must neither hang nor fail uncleanly: the
    // in-memory backend did not persist, so the value is simply gone.
    server.restart().await;
    assert_eq!(client.find(key_path("k")).await.unwrap(), None);
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_when_server_stays_down_surfaces_error() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    client.ping().await.unwrap();

    drop(server);
    // Server teardown is asynchronous; keep pinging until the transport
    // is really gone. One reconnect attempt is made per request; with
    // nobody listening the failure surfaces instead of hanging.
    for _ in 0..100 {
        match client.ping().await {
            Ok(()) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            Err(err) => {
                assert_matches!(err, ClientError::Transport(_) | ClientError::Rpc(_));
                return;
            }
        }
    }
    panic!("server kept answering after shutdown");
}

#[tokio::test]
async fn test_content_addressed_passthrough() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let first: ContentsId = client
        .request("contents.add", &contents("payload"))
        .await
        .unwrap();
    let second: ContentsId = client
        .request("contents.add", &contents("payload"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let found: Option<Contents> = client.request("contents.find", &first).await.unwrap();
    assert_eq!(found, Some(contents("payload")));
    let other: ContentsId = client
        .request("contents.add", &contents("other"))
        .await
        .unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn test_branch_watch() {
    let server = TestServer::start().await;
    let mut watcher = server.client().await;
    let mut writer = server.client().await;

    watcher.watch().await.unwrap();
    let head = writer
        .set(key_path("k"), commit_info("set"), contents("v"))
        .await
        .unwrap();

    let event = watcher.next_event().await.unwrap();
    assert_eq!(
        event,
        BranchEvent::Set {
            branch: BranchName::new("main"),
            head,
        }
    );

    // A second watch on the same session is refused.
    let err = watcher.watch().await.unwrap_err();
    assert_matches!(err, ClientError::Remote(message) if message.contains("already installed"));

    watcher.unwatch().await.unwrap();
    watcher.ping().await.unwrap();
}

#[tokio::test]
async fn test_branch_watch_key_filters() {
    let server = TestServer::start().await;
    let mut watcher = server.client().await;
    let mut writer = server.client().await;

    watcher
        .watch_key(BranchName::new("interesting"))
        .await
        .unwrap();

    // A write to another branch must not reach the watcher.
    writer
        .set(key_path("k"), commit_info("noise"), contents("n"))
        .await
        .unwrap();
    writer
        .set_current_branch(BranchName::new("interesting"))
        .await
        .unwrap();
    let head = writer
        .set(key_path("k"), commit_info("signal"), contents("s"))
        .await
        .unwrap();

    let event = watcher.next_event().await.unwrap();
    assert_eq!(
        event,
        BranchEvent::Set {
            branch: BranchName::new("interesting"),
            head,
        }
    );
}

#[tokio::test]
async fn test_export_import() {
    let source = TestServer::start().await;
    let target = TestServer::start().await;
    let mut source_client = source.client().await;
    let mut target_client = target.client().await;

    source_client
        .set(key_path("a/b"), commit_info("one"), contents("1"))
        .await
        .unwrap();
    source_client
        .set(key_path("a/c"), commit_info("two"), contents("2"))
        .await
        .unwrap();
    let head = source_client.head(None).await.unwrap().unwrap();

    let slice = source_client.export(None).await.unwrap();
    assert!(!slice.is_empty());
    target_client.import(slice).await.unwrap();
    target_client.set_head(None, head).await.unwrap();

    assert_eq!(
        target_client.find(key_path("a/b")).await.unwrap(),
        Some(contents("1"))
    );
    assert_eq!(
        target_client.find(key_path("a/c")).await.unwrap(),
        Some(contents("2"))
    );
}

#[tokio::test]
async fn test_export_depth() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    for i in 0..3 {
        client
            .set(
                key_path("k"),
                commit_info(&format!("commit {i}")),
                contents(&i.to_string()),
            )
            .await
            .unwrap();
    }
    let full = client.export(None).await.unwrap();
    assert_eq!(full.commits.len(), 3);
    let shallow = client.export(Some(1)).await.unwrap();
    assert_eq!(shallow.commits.len(), 1);
}
