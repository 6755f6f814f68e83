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

//! Transport addresses and byte streams.
//!
//! Addresses come from URIs: `unix://<socket-path>` and
//! `tcp://<host>:<port>` (port defaults to 8888), plus `tcp+tls://` which
//! parses but is rejected at bind/connect time — certificate provisioning
//! lives outside this crate. A server binds exactly one scheme.

#![expect(missing_docs)]

use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing::debug;

/// Default TCP port of the protocol.
pub const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid address {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("TLS transport requested but no TLS support is compiled in")]
    TlsUnsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed transport address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Addr {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
    TcpTls { host: String, port: u16 },
}

impl Addr {
    fn invalid(uri: &str, reason: impl Into<String>) -> TransportError {
        TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_host_port(uri: &str, rest: &str) -> Result<(String, u16), TransportError> {
        if rest.is_empty() {
            return Err(Self::invalid(uri, "missing host"));
        }
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Self::invalid(uri, format!("invalid port {port:?}")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((rest.to_string(), DEFAULT_PORT)),
        }
    }
}

impl FromStr for Addr {
    type Err = TransportError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Self::invalid(uri, "missing scheme"))?;
        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(Self::invalid(uri, "missing socket path"));
                }
                Ok(Self::Unix {
                    path: PathBuf::from(rest),
                })
            }
            "tcp" => {
                let (host, port) = Self::parse_host_port(uri, rest)?;
                Ok(Self::Tcp { host, port })
            }
            "tcp+tls" => {
                let (host, port) = Self::parse_host_port(uri, rest)?;
                Ok(Self::TcpTls { host, port })
            }
            _ => Err(Self::invalid(uri, format!("unknown scheme {scheme:?}"))),
        }
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::TcpTls { host, port } => write!(f, "tcp+tls://{host}:{port}"),
        }
    }
}

/// A connected bidirectional byte stream of any transport.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Connects to `addr` and returns the raw stream.
pub async fn connect(addr: &Addr) -> Result<BoxedStream, TransportError> {
    match addr {
        Addr::Unix { path } => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        Addr::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            // Request/response round-trips want low latency, not batching.
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Addr::TcpTls { .. } => Err(TransportError::TlsUnsupported),
    }
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound server socket. Dropping a unix listener unlinks its socket
/// file.
pub struct Listener {
    kind: ListenerKind,
    unlink: Option<PathBuf>,
}

impl Listener {
    pub async fn bind(addr: &Addr) -> Result<Self, TransportError> {
        match addr {
            Addr::Unix { path } => {
                // A stale socket file from a previous run blocks the bind.
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self {
                    kind: ListenerKind::Unix(listener),
                    unlink: Some(path.clone()),
                })
            }
            Addr::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self {
                    kind: ListenerKind::Tcp(listener),
                    unlink: None,
                })
            }
            Addr::TcpTls { .. } => Err(TransportError::TlsUnsupported),
        }
    }

    /// The address actually bound, with any ephemeral port resolved.
    pub fn local_addr(&self) -> Result<Addr, TransportError> {
        match &self.kind {
            ListenerKind::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr
                    .as_pathname()
                    .map(PathBuf::from)
                    .unwrap_or_default();
                Ok(Addr::Unix { path })
            }
            ListenerKind::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Addr::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
        }
    }

    /// Accepts the next client, returning the stream and a peer label for
    /// logging.
    pub async fn accept(&self) -> Result<(BoxedStream, String), TransportError> {
        match &self.kind {
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unlink {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(
            "unix:///tmp/db.sock".parse::<Addr>().unwrap(),
            Addr::Unix {
                path: PathBuf::from("/tmp/db.sock")
            }
        );
        assert_eq!(
            "tcp://127.0.0.1:9999".parse::<Addr>().unwrap(),
            Addr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9999
            }
        );
        // Default port
        assert_eq!(
            "tcp://example.com".parse::<Addr>().unwrap(),
            Addr::Tcp {
                host: "example.com".to_string(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(
            "tcp+tls://example.com:9999".parse::<Addr>().unwrap(),
            Addr::TcpTls {
                host: "example.com".to_string(),
                port: 9999
            }
        );
    }

    #[test]
    fn test_parse_addr_errors() {
        assert_matches!(
            "127.0.0.1:8888".parse::<Addr>(),
            Err(TransportError::InvalidUri { .. })
        );
        assert_matches!(
            "http://example.com".parse::<Addr>(),
            Err(TransportError::InvalidUri { .. })
        );
        assert_matches!(
            "tcp://host:notaport".parse::<Addr>(),
            Err(TransportError::InvalidUri { .. })
        );
        assert_matches!(
            "unix://".parse::<Addr>(),
            Err(TransportError::InvalidUri { .. })
        );
    }

    #[test]
    fn test_display_roundtrip() {
        for uri in ["unix:///tmp/db.sock", "tcp://localhost:8888"] {
            assert_eq!(uri.parse::<Addr>().unwrap().to_string(), uri);
        }
    }
}
