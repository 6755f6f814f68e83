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

//! Framed protocol connections.
//!
//! Frames, after the one-round-trip handshake (all integers big-endian):
//!
//! - request: `len:u16, name:utf8[len]`, body in the command's codec
//! - response: `status:u8` — 0 ok + body, 1 error + `len:u32` message,
//!   2 async branch notification + tagged event payload
//!
//! Writes go through a shared, locked writer: a full frame (header, body,
//! flush) is written under one lock acquisition, so notification frames
//! pushed by watch tasks never split a request/response pair. The reader
//! half stays exclusive to its dispatch (or client) loop.

#![expect(missing_docs)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWriteExt as _;
use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tracing::trace;

use crate::backend::BackendError;
use crate::backend::BranchEvent;
use crate::transport::BoxedStream;
use crate::wire;
use crate::wire::Message;
use crate::wire::WireFormat;
use crate::wire::invalid_data;

/// Handshake magic of protocol v1 with binary bodies.
pub const V1_BIN: u32 = u32::from_be_bytes(*b"dkb1");
/// Handshake magic of protocol v1 with self-describing JSON bodies.
pub const V1_JSON: u32 = u32::from_be_bytes(*b"dkj1");

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;
/// Reserved status for asynchronous watch notifications.
pub const STATUS_EVENT: u8 = 2;

// A command name longer than this is nonsense, not a command.
const MAX_NAME_LEN: u16 = 1024;

/// Protocol-layer error.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer closed the stream between frames.
    #[error("Connection closed by peer")]
    PeerClosed,
    #[error("Protocol version mismatch")]
    HandshakeMismatch,
    /// A request body failed to decode; the session survives this.
    #[error("Invalid arguments")]
    Decode(#[source] io::Error),
    /// Reported by a handler and sent to the peer; the session survives
    /// this.
    #[error("{0}")]
    Recoverable(String),
    /// Transport failure; the session is over.
    #[error(transparent)]
    Io(io::Error),
}

impl RpcError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    /// Whether this error means the transport itself is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::PeerClosed => true,
            Self::Io(err) => io_is_disconnect(err),
            _ => false,
        }
    }
}

impl From<BackendError> for RpcError {
    fn from(err: BackendError) -> Self {
        Self::Recoverable(err.to_string())
    }
}

fn io_is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Buffered, format-aware writer half. A whole frame is written per method
/// call; callers hold the surrounding lock for exactly that long.
pub struct FrameWriter {
    inner: BufWriter<WriteHalf<BoxedStream>>,
    format: WireFormat,
}

impl FrameWriter {
    async fn write_value<T: Message>(&mut self, value: &T) -> io::Result<()> {
        match self.format {
            WireFormat::Binary => value.encode(&mut self.inner).await,
            WireFormat::Json => {
                let buf = serde_json::to_vec(value)
                    .map_err(|err| invalid_data(format!("cannot encode body: {err}")))?;
                wire::write_bytes(&mut self.inner, &buf).await
            }
        }
    }

    /// Writes a request frame and flushes.
    pub async fn write_request<T: Message>(&mut self, name: &str, body: &T) -> io::Result<()> {
        let len = u16::try_from(name.len())
            .ok()
            .filter(|len| *len <= MAX_NAME_LEN)
            .ok_or_else(|| invalid_data("command name too long"))?;
        self.inner.write_u16(len).await?;
        self.inner.write_all(name.as_bytes()).await?;
        self.write_value(body).await?;
        self.inner.flush().await
    }

    /// Writes an ok response frame and flushes.
    pub async fn write_ok<T: Message>(&mut self, body: &T) -> io::Result<()> {
        self.inner.write_u8(STATUS_OK).await?;
        self.write_value(body).await?;
        self.inner.flush().await
    }

    /// Writes an error response frame and flushes.
    pub async fn write_error(&mut self, message: &str) -> io::Result<()> {
        self.inner.write_u8(STATUS_ERR).await?;
        wire::write_bytes(&mut self.inner, message.as_bytes()).await?;
        self.inner.flush().await
    }

    /// Writes an asynchronous notification frame and flushes.
    pub async fn write_event(&mut self, event: &BranchEvent) -> io::Result<()> {
        self.inner.write_u8(STATUS_EVENT).await?;
        self.write_value(event).await?;
        self.inner.flush().await
    }
}

/// One framed protocol connection, either side.
pub struct Connection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: Arc<Mutex<FrameWriter>>,
    format: WireFormat,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("format", &self.format).finish_non_exhaustive()
    }
}

impl Connection {
    fn new(stream: BoxedStream, format: WireFormat) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: Arc::new(Mutex::new(FrameWriter {
                inner: BufWriter::new(write_half),
                format,
            })),
            format,
        }
    }

    /// Server side of the handshake: adopt the initiator's codec family and
    /// acknowledge it. An unknown magic leaves the stream untouched so the
    /// caller can close without further I/O.
    pub async fn accept(mut stream: BoxedStream) -> Result<Self, RpcError> {
        let magic = stream.read_u32().await.map_err(map_closed_err)?;
        let format = match magic {
            V1_BIN => WireFormat::Binary,
            V1_JSON => WireFormat::Json,
            _ => return Err(RpcError::HandshakeMismatch),
        };
        stream.write_u32(magic).await.map_err(RpcError::Io)?;
        stream.flush().await.map_err(RpcError::Io)?;
        trace!(?format, "handshake accepted");
        Ok(Self::new(stream, format))
    }

    /// Client side of the handshake: announce the desired codec family and
    /// require the acceptor to echo it.
    pub async fn connect(mut stream: BoxedStream, format: WireFormat) -> Result<Self, RpcError> {
        let magic = match format {
            WireFormat::Binary => V1_BIN,
            WireFormat::Json => V1_JSON,
        };
        stream.write_u32(magic).await.map_err(RpcError::Io)?;
        stream.flush().await.map_err(RpcError::Io)?;
        let echoed = stream.read_u32().await.map_err(map_closed_err)?;
        if echoed != magic {
            return Err(RpcError::HandshakeMismatch);
        }
        Ok(Self::new(stream, format))
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Shared handle to the writer half, for asynchronous notification
    /// pushes.
    pub fn writer(&self) -> Arc<Mutex<FrameWriter>> {
        self.writer.clone()
    }

    /// Reads the next request header. `Ok(None)` is the distinguished
    /// peer-closed condition: the stream ended cleanly between frames.
    pub async fn read_request_header(&mut self) -> Result<Option<String>, RpcError> {
        let mut first = [0u8; 1];
        match self.reader.read(&mut first).await {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(err) if io_is_disconnect(&err) => return Ok(None),
            Err(err) => return Err(RpcError::Io(err)),
        }
        let second = self.reader.read_u8().await.map_err(RpcError::Io)?;
        let len = u16::from_be_bytes([first[0], second]);
        if len > MAX_NAME_LEN {
            return Err(RpcError::Io(invalid_data("command name too long")));
        }
        let mut name = vec![0; usize::from(len)];
        self.reader
            .read_exact(&mut name)
            .await
            .map_err(RpcError::Io)?;
        let name = String::from_utf8(name)
            .map_err(|err| RpcError::Io(invalid_data(format!("invalid command name: {err}"))))?;
        Ok(Some(name))
    }

    /// Reads a request body. Failures are decode errors: the command knows
    /// the type, the bytes disagreed.
    pub async fn read_request_body<T: Message>(&mut self) -> Result<T, RpcError> {
        self.read_value().await.map_err(RpcError::Decode)
    }

    async fn read_value<T: Message>(&mut self) -> io::Result<T> {
        match self.format {
            WireFormat::Binary => T::decode(&mut self.reader).await,
            WireFormat::Json => {
                let buf = wire::read_bytes(&mut self.reader).await?;
                serde_json::from_slice(&buf)
                    .map_err(|err| invalid_data(format!("cannot decode body: {err}")))
            }
        }
    }

    /// Client side: reads frames until a response arrives, queueing any
    /// notification frames seen on the way. Returns the remote error
    /// message when the response status is an error.
    pub async fn read_response<T: Message>(
        &mut self,
        events: &mut VecDeque<BranchEvent>,
    ) -> Result<Result<T, String>, RpcError> {
        loop {
            match self.reader.read_u8().await.map_err(map_closed_err)? {
                STATUS_OK => {
                    let body = self.read_value().await.map_err(RpcError::Io)?;
                    return Ok(Ok(body));
                }
                STATUS_ERR => {
                    let message = self.read_error_message().await?;
                    return Ok(Err(message));
                }
                STATUS_EVENT => {
                    let event: BranchEvent = self.read_value().await.map_err(RpcError::Io)?;
                    events.push_back(event);
                }
                status => {
                    return Err(RpcError::Io(invalid_data(format!(
                        "invalid response status {status:#04x}"
                    ))));
                }
            }
        }
    }

    /// Client side: waits for the next notification frame. Any other frame
    /// here means the peer broke the protocol.
    pub async fn read_event(&mut self) -> Result<BranchEvent, RpcError> {
        match self.reader.read_u8().await.map_err(map_closed_err)? {
            STATUS_EVENT => self.read_value().await.map_err(RpcError::Io),
            status => Err(RpcError::Io(invalid_data(format!(
                "expected notification frame, got status {status:#04x}"
            )))),
        }
    }

    async fn read_error_message(&mut self) -> Result<String, RpcError> {
        let bytes = wire::read_bytes(&mut self.reader)
            .await
            .map_err(RpcError::Io)?;
        String::from_utf8(bytes)
            .map_err(|err| RpcError::Io(invalid_data(format!("invalid error message: {err}"))))
    }

    /// Writes an ok response frame.
    pub async fn write_ok<T: Message>(&self, body: &T) -> Result<(), RpcError> {
        self.writer.lock().await.write_ok(body).await.map_err(RpcError::Io)
    }

    /// Writes an error response frame.
    pub async fn reply_error(&self, message: &str) -> Result<(), RpcError> {
        self.writer
            .lock()
            .await
            .write_error(message)
            .await
            .map_err(RpcError::Io)
    }

    /// Writes a request frame.
    pub async fn write_request<T: Message>(&self, name: &str, body: &T) -> Result<(), RpcError> {
        self.writer
            .lock()
            .await
            .write_request(name, body)
            .await
            .map_err(RpcError::Io)
    }
}

fn map_closed_err(err: io::Error) -> RpcError {
    if io_is_disconnect(&err) {
        RpcError::PeerClosed
    } else {
        RpcError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    fn pair() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(4096);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_handshake_both_families() {
        for format in [WireFormat::Binary, WireFormat::Json] {
            let (client, server) = pair();
            let (client, server) = tokio::join!(
                Connection::connect(client, format),
                Connection::accept(server),
            );
            assert_eq!(client.unwrap().format(), format);
            assert_eq!(server.unwrap().format(), format);
        }
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let (mut client, server) = pair();
        let ((), accepted) = tokio::join!(
            async {
                client.write_u32(0xdead_beef).await.unwrap();
                client.flush().await.unwrap();
            },
            Connection::accept(server),
        );
        assert_matches!(accepted, Err(RpcError::HandshakeMismatch));
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (client, server) = pair();
        let (client, server) = tokio::join!(
            Connection::connect(client, WireFormat::Binary),
            Connection::accept(server),
        );
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        client
            .write_request("ping", &"hello".to_string())
            .await
            .unwrap();
        let name = server.read_request_header().await.unwrap().unwrap();
        assert_eq!(name, "ping");
        let body: String = server.read_request_body().await.unwrap();
        assert_eq!(body, "hello");

        server.write_ok(&42u64).await.unwrap();
        let mut events = VecDeque::new();
        let response: Result<u64, String> = client.read_response(&mut events).await.unwrap();
        assert_eq!(response, Ok(42));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (client, server) = pair();
        let (client, server) = tokio::join!(
            Connection::connect(client, WireFormat::Json),
            Connection::accept(server),
        );
        let (mut client, server) = (client.unwrap(), server.unwrap());

        server.reply_error("unknown command").await.unwrap();
        let mut events = VecDeque::new();
        let response: Result<(), String> = client.read_response(&mut events).await.unwrap();
        assert_eq!(response, Err("unknown command".to_string()));
    }

    #[tokio::test]
    async fn test_peer_close_is_distinguished() {
        let (client, server) = pair();
        let (client, server) = tokio::join!(
            Connection::connect(client, WireFormat::Binary),
            Connection::accept(server),
        );
        let (client, mut server) = (client.unwrap(), server.unwrap());

        drop(client);
        assert_matches!(server.read_request_header().await, Ok(None));
    }

    #[tokio::test]
    async fn test_event_interleaves_before_response() {
        let (client, server) = pair();
        let (client, server) = tokio::join!(
            Connection::connect(client, WireFormat::Binary),
            Connection::accept(server),
        );
        let (mut client, server) = (client.unwrap(), server.unwrap());

        let event = BranchEvent::Removed {
            branch: crate::backend::BranchName::new("gone"),
        };
        server.writer().lock().await.write_event(&event).await.unwrap();
        server.write_ok(&()).await.unwrap();

        let mut events = VecDeque::new();
        let response: Result<(), String> = client.read_response(&mut events).await.unwrap();
        assert_eq!(response, Ok(()));
        assert_eq!(events.pop_front(), Some(event));
    }
}
