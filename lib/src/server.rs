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

//! The server: accept loop and per-session dispatch.
//!
//! Each accepted connection becomes one cooperative task owning its
//! [`Session`] and the read half of its connection. Within a session,
//! requests are handled strictly one at a time, in arrival order;
//! concurrency across clients comes from running many such tasks over the
//! shared repository.

#![expect(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::Instrument as _;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;

use crate::backend::Backend;
use crate::command;
use crate::command::Outcome;
use crate::command::ServerInfo;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::connection::RpcError;
use crate::session::Session;
use crate::transport::Addr;
use crate::transport::BoxedStream;
use crate::transport::Listener;
use crate::transport::TransportError;

// Pause after a recoverable handler failure, as back-pressure against a
// client stuck in a tight error loop.
const RECOVERABLE_ERROR_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A bound protocol server sharing one repository across all sessions.
pub struct Server {
    listener: Listener,
    repo: Arc<dyn Backend>,
    info: Arc<ServerInfo>,
}

impl Server {
    /// Binds the transport named by the config. TLS URIs are rejected
    /// until a TLS layer is wired in.
    pub async fn bind(config: ServerConfig, repo: Arc<dyn Backend>) -> Result<Self, ServerError> {
        if config.tls.is_some() {
            return Err(TransportError::TlsUnsupported.into());
        }
        let addr: Addr = config.uri.parse()?;
        let listener = Listener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, backend = repo.name(), "server listening");
        Ok(Self {
            listener,
            repo,
            info: Arc::new(ServerInfo { config }),
        })
    }

    /// The bound address, with any ephemeral port resolved.
    pub fn local_addr(&self) -> Result<Addr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients forever. Each session runs on its own task; a
    /// failing session never takes the server down. Dropping the serve
    /// future tears every live session down with it.
    pub async fn serve(self) -> Result<(), ServerError> {
        let mut sessions = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let repo = self.repo.clone();
                    let info = self.info.clone();
                    sessions.spawn(handle_connection(stream, peer, repo, info));
                }
                // Reap finished sessions so the set stays small.
                Some(_) = sessions.join_next() => {}
            }
        }
    }
}

async fn handle_connection(
    stream: BoxedStream,
    peer: String,
    repo: Arc<dyn Backend>,
    info: Arc<ServerInfo>,
) {
    let span = info_span!("session", peer = %peer);
    async move {
        // Handshake first; on mismatch, close without further I/O.
        let mut conn = match Connection::accept(stream).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(%err, "handshake failed, closing");
                return;
            }
        };
        debug!(format = ?conn.format(), "session started");
        let mut session = Session::new(repo, conn.writer());
        match dispatch_loop(&mut conn, &mut session, &info).await {
            Ok(()) => debug!("peer disconnected"),
            Err(err) if err.is_disconnect() => debug!("connection lost mid-request"),
            Err(err) => error!(%err, "session failed"),
        }
        // Dropping the session releases tree handles and watches.
    }
    .instrument(span)
    .await
}

/// Runs one session's request loop until the peer goes away or the
/// transport fails.
async fn dispatch_loop(
    conn: &mut Connection,
    session: &mut Session,
    info: &ServerInfo,
) -> Result<(), RpcError> {
    loop {
        let Some(name) = conn.read_request_header().await? else {
            // Clean close between frames.
            return Ok(());
        };
        let Some(desc) = command::of_name(&name) else {
            debug!(command = %name, "unknown command");
            conn.reply_error("unknown command").await?;
            continue;
        };
        match desc.run(conn, session, info).await {
            Ok(Outcome::Done | Outcome::BadRequest) => {}
            Ok(Outcome::Recovered) => sleep(RECOVERABLE_ERROR_DELAY).await,
            Err(err) => return Err(err),
        }
    }
}
