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

//! Library for dagkv: a content-addressed, branch-and-commit versioned
//! key-value store served over a framed binary protocol.
//!
//! The storage side is a Git-like Merkle DAG: opaque contents at the
//! leaves of trees, commits pointing at trees and parent commits, and
//! named branches pointing at commits, all behind the [`backend::Backend`]
//! trait. The protocol side is a command-dispatch server
//! ([`server::Server`]) and a reconnecting client ([`client::Client`])
//! sharing one wire codec ([`wire`]). Server-side trees are handed to
//! clients as session-scoped integer handles so that repeated tree
//! manipulation never re-serializes large structures.

#![warn(missing_docs)]

pub mod backend;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod hex_util;
pub mod mem_backend;
pub mod merge;
pub mod object_id;
pub mod path;
pub mod server;
pub mod session;
pub mod slice;
pub mod store;
pub mod transport;
pub mod tree;
pub mod wire;
