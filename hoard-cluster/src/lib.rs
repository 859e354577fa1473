// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster coordination for the hoard shared HTTP cache.
//!
//! This crate holds everything that only matters when more than one cache
//! node is running:
//! - [`Ring`]: the consistent-hash ring that maps a cache key to the peer
//!   owning it.
//! - [`ClusterMemory`]: the cluster-shared memory pool. Bytes published on
//!   one node are retrievable from any peer via a small HTTP surface.
//! - [`Directory`]: the client for the external directory service (service
//!   registration, health queries, KV store, sessions).
//! - [`Registrar`]: node registration plus the watch loops that feed peer
//!   updates, invalidation events and config reloads back to the cache.
//! - [`DistLock`]: the short-lived session-scoped lock used to elect one
//!   cluster-wide deleter per key.

pub mod directory;
pub mod lock;
pub mod pool;
pub mod registrar;
pub mod ring;
mod server;

pub use directory::Directory;
pub use lock::DistLock;
pub use pool::ClusterMemory;
pub use registrar::{local_ip, ClusterOptions, Registrar};
pub use ring::Ring;
pub use server::spawn_peer_server;
