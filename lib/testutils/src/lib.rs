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

//! Fixtures for dagkv integration tests: in-process servers over the
//! in-memory backend, connected clients, and ready-made domain values.

use std::sync::Arc;

use dagkv_lib::backend::Backend;
use dagkv_lib::backend::CommitInfo;
use dagkv_lib::backend::Contents;
use dagkv_lib::backend::MillisSinceEpoch;
use dagkv_lib::backend::Timestamp;
use dagkv_lib::client::Client;
use dagkv_lib::config::ClientConfig;
use dagkv_lib::config::ServerConfig;
use dagkv_lib::mem_backend::MemBackend;
use dagkv_lib::path::KeyPath;
use dagkv_lib::server::Server;
use dagkv_lib::wire::WireFormat;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("dagkv-test-")
        .tempdir()
        .unwrap()
}

/// Commit metadata with a fixed author and timestamp, so test commits are
/// deterministic.
pub fn commit_info(message: &str) -> CommitInfo {
    CommitInfo {
        author: "test.user@example.com".to_string(),
        message: message.to_string(),
        date: Timestamp {
            timestamp: MillisSinceEpoch(0),
            tz_offset: 0,
        },
    }
}

pub fn key_path(value: &str) -> KeyPath {
    KeyPath::parse(value).unwrap()
}

pub fn contents(value: &str) -> Contents {
    Contents::from(value)
}

/// An in-process server over a fresh in-memory repository.
///
/// The server task is aborted (taking its sessions with it) when the
/// fixture is dropped. `restart` simulates a server crash: the old
/// process dies, a new one binds the same address over an empty
/// repository.
pub struct TestServer {
    uri: String,
    repo: Arc<MemBackend>,
    task: JoinHandle<()>,
    // Keeps the socket directory alive for unix transports.
    _dir: Option<TempDir>,
}

impl TestServer {
    /// Starts on an ephemeral localhost TCP port.
    pub async fn start() -> Self {
        Self::start_at("tcp://127.0.0.1:0".to_string(), None).await
    }

    /// Starts on a unix socket in a fresh temp directory.
    pub async fn start_unix() -> Self {
        let dir = new_temp_dir();
        let uri = format!("unix://{}", dir.path().join("dagkv.sock").display());
        Self::start_at(uri, Some(dir)).await
    }

    async fn start_at(uri: String, dir: Option<TempDir>) -> Self {
        let repo = Arc::new(MemBackend::new());
        let (uri, task) = spawn_server(uri, repo.clone()).await;
        Self {
            uri,
            repo,
            task,
            _dir: dir,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The repository shared by every session of this server.
    pub fn repo(&self) -> &Arc<MemBackend> {
        &self.repo
    }

    pub fn backend(&self) -> &dyn Backend {
        self.repo.as_ref()
    }

    /// Kills the server and binds a new one with a fresh repository on
    /// the same address. Established client connections are dropped.
    pub async fn restart(&mut self) {
        self.task.abort();
        // Wait for the old listener to release the address (and unlink
        // its socket file) before rebinding.
        let _ = (&mut self.task).await;
        let repo = Arc::new(MemBackend::new());
        let (uri, task) = spawn_server(self.uri.clone(), repo.clone()).await;
        self.uri = uri;
        self.repo = repo;
        self.task = task;
    }

    /// A connected client using the compact binary codec.
    pub async fn client(&self) -> Client {
        self.client_with_format(WireFormat::Binary).await
    }

    pub async fn client_with_format(&self, format: WireFormat) -> Client {
        let config = ClientConfig {
            uri: self.uri.clone(),
            tls: false,
        };
        Client::connect_with_format(config, format).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_server(uri: String, repo: Arc<MemBackend>) -> (String, JoinHandle<()>) {
    let config = ServerConfig {
        uri,
        ..ServerConfig::default()
    };
    let server = Server::bind(config, repo).await.unwrap();
    let uri = server.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (uri, task)
}
