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

//! The cluster-shared memory pool.
//!
//! One logical cache shared by all peers: each key is owned by exactly one
//! peer, decided by the consistent-hash [Ring]. A node publishes bytes into
//! its local store; a node looking a key up serves it locally when possible,
//! otherwise asks the owner over HTTP. When no peer holds the key, the
//! lookup fails with the [`NoPrecollect`](ErrorType::NoPrecollect) sentinel
//! so the caller can fall through to an upstream fetch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use hoard_error::{Error, ErrorType, OrErr, Result};
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::ring::Ring;

/// The URL path prefix of the peer-to-peer surface.
pub const PEER_PATH_PREFIX: &str = "/_groupcache/";

// Escape everything a cache key may contain that is not safe inside one URL
// path segment.
pub(crate) const PEER_KEY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

// Local byte store with an LRU byte budget.
struct LocalStore {
    entries: LruCache<String, Bytes>,
    used: usize,
    budget: usize,
}

impl LocalStore {
    fn new(budget: usize) -> Self {
        LocalStore {
            entries: LruCache::unbounded(),
            used: 0,
            budget,
        }
    }

    fn get(&mut self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Bytes) {
        self.used += value.len();
        if let Some((_, old)) = self.entries.push(key, value) {
            // replaced value under the same key
            self.used -= old.len();
        }
        while self.used > self.budget {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.used -= evicted.len(),
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.pop(key) {
            self.used -= old.len();
        }
    }
}

/// The cluster-shared memory cache.
///
/// Cheap to share behind an [Arc]; the peer set can be swapped at any time
/// without blocking in-flight lookups.
pub struct ClusterMemory {
    group: String,
    self_addr: SocketAddr,
    ring: ArcSwap<Ring>,
    local: Mutex<LocalStore>,
    client: reqwest::Client,
}

impl ClusterMemory {
    /// Create a new [ClusterMemory].
    ///
    /// - `group`: the group name, part of the peer URL path.
    /// - `self_addr`: the address this node's peer surface is reachable at.
    /// - `max_bytes`: local byte budget. Oldest entries are dropped first
    ///   once exceeded; this is a soft cap, not byte-accurate enforcement.
    pub fn new(group: &str, self_addr: SocketAddr, max_bytes: usize) -> Arc<Self> {
        Arc::new(ClusterMemory {
            group: group.to_string(),
            self_addr,
            ring: ArcSwap::new(Arc::new(Ring::new(&[self_addr]))),
            local: Mutex::new(LocalStore::new(max_bytes.max(1))),
            client: reqwest::Client::new(),
        })
    }

    /// The group name of this pool.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The address of this node's peer surface.
    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    /// Replace the peer set. Lookups pick up the new ring immediately.
    pub fn set_peers(&self, mut peers: Vec<SocketAddr>) {
        if !peers.contains(&self.self_addr) {
            peers.push(self.self_addr);
        }
        peers.sort_unstable();
        peers.dedup();
        debug!("cluster pool {}: peer set -> {:?}", self.group, peers);
        self.ring.store(Arc::new(Ring::new(&peers)));
    }

    /// Publish bytes under the key on this node.
    ///
    /// The writer keeps the bytes locally even when it does not own the key:
    /// it just produced them from upstream and will serve its own hits from
    /// here, while owning peers answer for the rest of the cluster.
    pub fn store(&self, key: &str, value: Bytes) {
        self.local.lock().insert(key.to_string(), value);
    }

    /// Drop the local copy of the key, if any.
    pub fn remove(&self, key: &str) {
        self.local.lock().remove(key);
    }

    /// Look the key up in this node's local store only.
    pub fn load_local(&self, key: &str) -> Option<Bytes> {
        self.local.lock().get(key)
    }

    /// Retrieve the bytes stored under the key anywhere in the cluster.
    ///
    /// Checks the local store first, then asks the owning peer. Fails with
    /// [ErrorType::NoPrecollect] when no peer holds the key.
    pub async fn load(&self, key: &str) -> Result<Bytes> {
        if let Some(bytes) = self.load_local(key) {
            return Ok(bytes);
        }

        let owner = self.ring.load().owner(key.as_bytes());
        match owner {
            Some(addr) if addr != self.self_addr => self.fetch_from_peer(addr, key).await,
            // we own the key (or are alone) and do not have it
            _ => Error::e_explain(ErrorType::NoPrecollect, "no peer holds the key"),
        }
    }

    /// The peer URL used to fetch the key from the given address.
    pub fn peer_url(&self, addr: SocketAddr, key: &str) -> String {
        format!(
            "http://{}{}{}/{}",
            addr,
            PEER_PATH_PREFIX,
            utf8_percent_encode(&self.group, PEER_KEY_ESCAPE),
            utf8_percent_encode(key, PEER_KEY_ESCAPE)
        )
    }

    async fn fetch_from_peer(&self, addr: SocketAddr, key: &str) -> Result<Bytes> {
        let url = self.peer_url(addr, key);
        let resp = self
            .client
            .get(&url)
            .timeout(PEER_FETCH_TIMEOUT)
            .send()
            .await
            .or_err_with(ErrorType::PeerError, || format!("GET {url}"))?;

        match resp.status().as_u16() {
            200 => resp
                .bytes()
                .await
                .or_err(ErrorType::PeerError, "reading peer body"),
            404 => Error::e_explain(ErrorType::NoPrecollect, "owner does not hold the key"),
            status => {
                warn!("peer {addr} answered {status} for {key}");
                Error::e_explain(
                    ErrorType::PeerError,
                    format!("unexpected peer status {status}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<ClusterMemory> {
        ClusterMemory::new("http_cache", "127.0.0.1:8999".parse().unwrap(), 1024)
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let pool = pool();
        pool.store("a", Bytes::from_static(b"hello"));
        let got = pool.load("a").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_load_missing_is_no_precollect() {
        let pool = pool();
        let err = pool.load("missing").await.unwrap_err();
        assert!(err.is_no_precollect());
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = pool();
        pool.store("a", Bytes::from_static(b"hello"));
        pool.remove("a");
        assert!(pool.load("a").await.is_err());
    }

    #[test]
    fn test_byte_budget_evicts_oldest() {
        let mut store = LocalStore::new(10);
        store.insert("a".into(), Bytes::from_static(b"aaaaa"));
        store.insert("b".into(), Bytes::from_static(b"bbbbb"));
        store.insert("c".into(), Bytes::from_static(b"ccccc"));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
        assert!(store.used <= 10);
    }

    #[test]
    fn test_replace_same_key_accounting() {
        let mut store = LocalStore::new(10);
        store.insert("a".into(), Bytes::from_static(b"aaaaa"));
        store.insert("a".into(), Bytes::from_static(b"aa"));
        assert_eq!(store.used, 2);
    }

    #[test]
    fn test_peer_url_escapes_key() {
        let pool = pool();
        let url = pool.peer_url(
            "10.0.0.2:80".parse().unwrap(),
            "GET example.com/x?q=1",
        );
        assert_eq!(
            url,
            "http://10.0.0.2:80/_groupcache/http_cache/GET%20example.com%2Fx%3Fq=1"
        );
    }
}
