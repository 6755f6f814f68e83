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

//! The compact binary wire codec.
//!
//! These encodings ARE the protocol: every length prefix and tag byte here
//! is wire-stable. All integers are big-endian. The layout rules:
//!
//! - unit: zero bytes
//! - bool / u8: one byte
//! - u16 / u32 / u64 / i32 / i64: fixed-width big-endian
//! - byte strings and text: `u32` length prefix + raw bytes
//! - option: presence byte (0/1) + payload
//! - list: `u32` element count + elements
//! - tuple: concatenation
//! - tagged variant: `u8` tag + payload
//!
//! The codec is pure: it holds no session state and performs no I/O of its
//! own beyond the reader/writer it is handed. The binary encoding of a
//! value is also its canonical form for content addressing.
//!
//! A second, self-describing codec family frames each body as a `u32`
//! length prefix plus a JSON document ([`WireFormat::Json`]); headers and
//! the handshake are identical in both families. The family is fixed at
//! handshake time.

#![expect(missing_docs)]

use std::future::Future;
use std::io;

use pollster::FutureExt as _;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::backend::BranchEvent;
use crate::backend::BranchName;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::CommitInfo;
use crate::backend::Contents;
use crate::backend::ContentsId;
use crate::backend::Hash;
use crate::backend::Key;
use crate::backend::MillisSinceEpoch;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::backend::Timestamp;
use crate::merge::MergeConflict;
use crate::merge::MergeOutcome;
use crate::object_id::ObjectId as _;
use crate::path::KeyPath;
use crate::path::Step;

/// Upper bound on any single length prefix. A peer announcing more than
/// this is malformed (or hostile); decoding fails instead of allocating.
pub const MAX_LEN: u32 = 64 << 20;

/// Codec family negotiated by the handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireFormat {
    /// Compact binary encoding, the canonical form.
    Binary,
    /// Self-describing JSON bodies, length-prefixed.
    Json,
}

/// A value with a binary wire encoding.
///
/// `decode` must consume exactly the bytes `encode` produced; the framing
/// carries no body length, so the codec is the sole authority on where a
/// body ends.
pub trait Wire: Sized + Send + Sync {
    fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn decode<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
    ) -> impl Future<Output = io::Result<Self>> + Send;
}

/// Bound for anything that can cross the connection: encodable in both
/// codec families.
pub trait Message: Wire + serde::Serialize + serde::de::DeserializeOwned {}

impl<T: Wire + serde::Serialize + serde::de::DeserializeOwned> Message for T {}

pub(crate) fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

pub(crate) async fn write_bytes<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    bytes: &[u8],
) -> io::Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| invalid_data("payload too large"))?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await
}

pub(crate) async fn read_bytes<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_LEN {
        return Err(invalid_data(format!("length prefix {len} exceeds limit")));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn read_len<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<u32> {
    let len = reader.read_u32().await?;
    if len > MAX_LEN {
        return Err(invalid_data(format!("length prefix {len} exceeds limit")));
    }
    Ok(len)
}

/// Encodes `value` in the binary family into a buffer. This is the
/// canonical encoding used for content addressing. Writing to memory never
/// suspends nor fails.
pub fn to_vec<T: Wire>(value: &T) -> Vec<u8> {
    let mut cursor = io::Cursor::new(Vec::new());
    value.encode(&mut cursor).block_on().unwrap();
    cursor.into_inner()
}

/// Decodes a binary-family value from `bytes`, requiring every byte to be
/// consumed.
pub fn from_slice<T: Wire>(bytes: &[u8]) -> io::Result<T> {
    let mut cursor = io::Cursor::new(bytes);
    let value = T::decode(&mut cursor).block_on()?;
    if cursor.position() != bytes.len() as u64 {
        return Err(invalid_data("trailing bytes after value"));
    }
    Ok(value)
}

impl Wire for () {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, _writer: &mut W) -> io::Result<()> {
        Ok(())
    }

    async fn decode<R: AsyncRead + Unpin + Send>(_reader: &mut R) -> io::Result<Self> {
        Ok(())
    }
}

impl Wire for bool {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(u8::from(*self)).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(invalid_data(format!("invalid bool byte {byte:#04x}"))),
        }
    }
}

macro_rules! impl_wire_int {
    ($($ty:ty { $write:ident, $read:ident })*) => {
        $(
            impl Wire for $ty {
                async fn encode<W: AsyncWrite + Unpin + Send>(
                    &self,
                    writer: &mut W,
                ) -> io::Result<()> {
                    writer.$write(*self).await
                }

                async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
                    reader.$read().await
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 { write_u8, read_u8 }
    u16 { write_u16, read_u16 }
    u32 { write_u32, read_u32 }
    u64 { write_u64, read_u64 }
    i32 { write_i32, read_i32 }
    i64 { write_i64, read_i64 }
}

impl Wire for String {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        write_bytes(writer, self.as_bytes()).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let bytes = read_bytes(reader).await?;
        Self::from_utf8(bytes).map_err(|err| invalid_data(format!("invalid utf-8 text: {err}")))
    }
}

impl<T: Wire> Wire for Option<T> {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            None => writer.write_u8(0).await,
            Some(value) => {
                writer.write_u8(1).await?;
                value.encode(writer).await
            }
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader).await?)),
            byte => Err(invalid_data(format!("invalid option byte {byte:#04x}"))),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        let len = u32::try_from(self.len()).map_err(|_| invalid_data("list too long"))?;
        writer.write_u32(len).await?;
        for item in self {
            item.encode(writer).await?;
        }
        Ok(())
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let len = read_len(reader).await?;
        let mut items = Vec::with_capacity((len as usize).min(4096));
        for _ in 0..len {
            items.push(T::decode(reader).await?);
        }
        Ok(items)
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.0.encode(writer).await?;
        self.1.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let a = A::decode(reader).await?;
        let b = B::decode(reader).await?;
        Ok((a, b))
    }
}

impl<A: Wire, B: Wire, C: Wire> Wire for (A, B, C) {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.0.encode(writer).await?;
        self.1.encode(writer).await?;
        self.2.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let a = A::decode(reader).await?;
        let b = B::decode(reader).await?;
        let c = C::decode(reader).await?;
        Ok((a, b, c))
    }
}

impl<A: Wire, B: Wire, C: Wire, D: Wire> Wire for (A, B, C, D) {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.0.encode(writer).await?;
        self.1.encode(writer).await?;
        self.2.encode(writer).await?;
        self.3.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let a = A::decode(reader).await?;
        let b = B::decode(reader).await?;
        let c = C::decode(reader).await?;
        let d = D::decode(reader).await?;
        Ok((a, b, c, d))
    }
}

macro_rules! impl_wire_id {
    ($($name:ident)*) => {
        $(
            impl Wire for $name {
                async fn encode<W: AsyncWrite + Unpin + Send>(
                    &self,
                    writer: &mut W,
                ) -> io::Result<()> {
                    write_bytes(writer, self.as_bytes()).await
                }

                async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
                    Ok(Self::new(read_bytes(reader).await?))
                }
            }
        )*
    };
}

impl_wire_id!(Hash ContentsId NodeId CommitId);

impl Wire for Key {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Contents(id) => {
                writer.write_u8(0).await?;
                id.encode(writer).await
            }
            Self::Node(id) => {
                writer.write_u8(1).await?;
                id.encode(writer).await
            }
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(Self::Contents(ContentsId::decode(reader).await?)),
            1 => Ok(Self::Node(NodeId::decode(reader).await?)),
            tag => Err(invalid_data(format!("invalid key tag {tag:#04x}"))),
        }
    }
}

impl Wire for Contents {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        write_bytes(writer, self.as_bytes()).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        Ok(Self::new(read_bytes(reader).await?))
    }
}

impl Wire for Step {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        write_bytes(writer, self.as_str().as_bytes()).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let text = String::decode(reader).await?;
        Self::new(text).map_err(|err| invalid_data(err.to_string()))
    }
}

impl Wire for KeyPath {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        let len = u32::try_from(self.len()).map_err(|_| invalid_data("path too long"))?;
        writer.write_u32(len).await?;
        for step in self.steps() {
            step.encode(writer).await?;
        }
        Ok(())
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let len = read_len(reader).await?;
        let mut steps = Vec::with_capacity((len as usize).min(4096));
        for _ in 0..len {
            steps.push(Step::decode(reader).await?);
        }
        Ok(Self::from_steps(steps))
    }
}

impl Wire for BranchName {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        write_bytes(writer, self.as_str().as_bytes()).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        Ok(Self::new(String::decode(reader).await?))
    }
}

impl Wire for Timestamp {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i64(self.timestamp.0).await?;
        writer.write_i32(self.tz_offset).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let millis = reader.read_i64().await?;
        let tz_offset = reader.read_i32().await?;
        Ok(Self {
            timestamp: MillisSinceEpoch(millis),
            tz_offset,
        })
    }
}

impl Wire for CommitInfo {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.author.encode(writer).await?;
        self.message.encode(writer).await?;
        self.date.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let author = String::decode(reader).await?;
        let message = String::decode(reader).await?;
        let date = Timestamp::decode(reader).await?;
        Ok(Self {
            author,
            message,
            date,
        })
    }
}

impl Wire for Commit {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.info.encode(writer).await?;
        self.parents.encode(writer).await?;
        self.tree.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let info = CommitInfo::decode(reader).await?;
        let parents = Vec::<CommitId>::decode(reader).await?;
        let tree = Key::decode(reader).await?;
        Ok(Self {
            info,
            parents,
            tree,
        })
    }
}

impl Wire for Node {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        let len = u32::try_from(self.len()).map_err(|_| invalid_data("node too large"))?;
        writer.write_u32(len).await?;
        for (step, key) in self.entries() {
            step.encode(writer).await?;
            key.encode(writer).await?;
        }
        Ok(())
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let len = read_len(reader).await?;
        let mut entries = Vec::with_capacity((len as usize).min(4096));
        for _ in 0..len {
            let step = Step::decode(reader).await?;
            let key = Key::decode(reader).await?;
            entries.push((step, key));
        }
        // Serialized nodes are sorted; reject anything else so equal nodes
        // have equal encodings.
        if !entries.is_sorted_by(|(a, _), (b, _)| a < b) {
            return Err(invalid_data("node entries not sorted"));
        }
        Ok(Self::from_sorted_entries(entries))
    }
}

impl Wire for BranchEvent {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Set { branch, head } => {
                writer.write_u8(0).await?;
                branch.encode(writer).await?;
                head.encode(writer).await
            }
            Self::Removed { branch } => {
                writer.write_u8(1).await?;
                branch.encode(writer).await
            }
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => {
                let branch = BranchName::decode(reader).await?;
                let head = CommitId::decode(reader).await?;
                Ok(Self::Set { branch, head })
            }
            1 => {
                let branch = BranchName::decode(reader).await?;
                Ok(Self::Removed { branch })
            }
            tag => Err(invalid_data(format!("invalid event tag {tag:#04x}"))),
        }
    }
}

impl Wire for MergeConflict {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        self.path.encode(writer).await
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        let path = KeyPath::decode(reader).await?;
        Ok(Self { path })
    }
}

impl<T: Wire> Wire for MergeOutcome<T> {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Merged(value) => {
                writer.write_u8(0).await?;
                value.encode(writer).await
            }
            Self::Conflict(conflict) => {
                writer.write_u8(1).await?;
                conflict.encode(writer).await
            }
        }
    }

    async fn decode<R: AsyncRead + Unpin + Send>(reader: &mut R) -> io::Result<Self> {
        match reader.read_u8().await? {
            0 => Ok(Self::Merged(T::decode(reader).await?)),
            1 => Ok(Self::Conflict(MergeConflict::decode(reader).await?)),
            tag => Err(invalid_data(format!("invalid outcome tag {tag:#04x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: T) {
        let encoded = to_vec(&value);
        let decoded: T = from_slice(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_primitive_roundtrip() {
        roundtrip(());
        roundtrip(true);
        roundtrip(false);
        roundtrip(0x1234u16);
        roundtrip(u32::MAX);
        roundtrip(u64::MAX);
        roundtrip(-42i64);
        roundtrip("hello".to_string());
        roundtrip(String::new());
        roundtrip(Some("x".to_string()));
        roundtrip(None::<String>);
        roundtrip(vec![1u64, 2, 3]);
        roundtrip(("a".to_string(), 7u64));
    }

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(to_vec(&0x0102u16), b"\x01\x02");
        assert_eq!(to_vec(&"ab".to_string()), b"\x00\x00\x00\x02ab");
        assert_eq!(to_vec(&Some(true)), b"\x01\x01");
        assert_eq!(to_vec(&None::<bool>), b"\x00");
        assert_eq!(to_vec(&vec![1u8, 2]), b"\x00\x00\x00\x02\x01\x02");
    }

    #[test]
    fn test_domain_roundtrip() {
        roundtrip(Hash::from_hex("0011aabb"));
        roundtrip(Key::Contents(ContentsId::from_hex("aa")));
        roundtrip(Key::Node(NodeId::from_hex("bb")));
        roundtrip(Contents::from("payload"));
        roundtrip(KeyPath::parse("a/b/c").unwrap());
        roundtrip(KeyPath::root());
        roundtrip(BranchName::new("main"));
        roundtrip(Commit {
            info: CommitInfo {
                author: "test".to_string(),
                message: "msg".to_string(),
                date: Timestamp {
                    timestamp: MillisSinceEpoch(1000),
                    tz_offset: 60,
                },
            },
            parents: vec![CommitId::from_hex("cc")],
            tree: Key::Node(NodeId::from_hex("dd")),
        });
        roundtrip(BranchEvent::Removed {
            branch: BranchName::new("gone"),
        });
        roundtrip(MergeOutcome::Merged(Some(NodeId::from_hex("ee"))));
        roundtrip(MergeOutcome::<Option<NodeId>>::Conflict(MergeConflict {
            path: KeyPath::parse("a").unwrap(),
        }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(from_slice::<bool>(b"\x02").is_err());
        assert!(from_slice::<Option<bool>>(b"\x07").is_err());
        // Truncated length prefix
        assert!(from_slice::<String>(b"\x00\x00\x00\x05ab").is_err());
        // Trailing bytes
        assert!(from_slice::<bool>(b"\x01\x00").is_err());
        // Oversized length prefix fails before allocating
        assert!(from_slice::<String>(b"\xff\xff\xff\xff").is_err());
    }
}
