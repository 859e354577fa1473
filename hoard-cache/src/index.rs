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

//! The cache index.
//!
//! Fingerprints map to lists of entries, sharded over a fixed number of
//! buckets to keep lock contention low. A fingerprint holds more than one
//! entry only when `Vary` produced distinct representations. Every stored
//! entry gets a scheduled sweep that removes it once it has outlived its
//! stale grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hoard_cluster::{DistLock, Registrar};
use hoard_error::Result;
use log::{debug, error};
use parking_lot::RwLock;

use crate::config::Config;
use crate::entry::Entry;
use crate::key::bucket_index;
use crate::RequestHead;

// grace the leader gives its peers to observe an invalidation event before
// the next node's sweeper fires
const PEER_OBSERVE_DELAY: Duration = Duration::from_secs(3);

type EntryList = Vec<Arc<Entry>>;

/// The sharded fingerprint -> entries map.
pub struct HttpCache {
    buckets: Vec<RwLock<HashMap<String, EntryList>>>,
    stale_max_age: Duration,
    registrar: Option<Arc<Registrar>>,
}

impl HttpCache {
    /// Build the index. With a [Registrar], evictions go through the
    /// cluster's distributed-lock election instead of running locally only.
    pub fn new(config: &Config, registrar: Option<Arc<Registrar>>) -> Arc<Self> {
        let buckets = (0..config.cache_buckets_num)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Arc::new(HttpCache {
            buckets,
            stale_max_age: Duration::from_secs(config.stale_max_age),
            registrar,
        })
    }

    fn bucket(&self, key: &str) -> &RwLock<HashMap<String, EntryList>> {
        &self.buckets[bucket_index(key, self.buckets.len())]
    }

    /// Find the entry for `key` matching the request's `Vary` dimensions.
    ///
    /// Stale entries are only returned with `include_stale`.
    pub fn get(&self, key: &str, head: &RequestHead, include_stale: bool) -> Option<Arc<Entry>> {
        let bucket = self.bucket(key).read();
        let entries = bucket.get(key)?;
        entries
            .iter()
            .find(|e| (e.is_fresh() || include_stale) && e.matches_vary(head))
            .cloned()
    }

    /// Snapshot of all fingerprints currently holding at least one entry.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for (key, entries) in bucket.iter() {
                if !entries.is_empty() {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Store an entry and schedule its sweep.
    ///
    /// An existing entry matching the same `Vary` dimensions is replaced in
    /// place and cleaned in the background.
    pub fn put(self: &Arc<Self>, entry: Arc<Entry>) {
        let key = entry.key().to_string();
        {
            let mut bucket = self.bucket(&key).write();
            let entries = bucket.entry(key).or_default();

            let mut replaced = false;
            for slot in entries.iter_mut() {
                if slot.matches_vary(entry.request()) {
                    let old = std::mem::replace(slot, entry.clone());
                    tokio::spawn(async move {
                        if let Err(e) = old.clean().await {
                            error!("cleaning replaced entry: {e}");
                        }
                    });
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                entries.push(entry.clone());
            }
        }
        self.schedule_sweep(&entry);
    }

    /// Purge every fresh entry under the fingerprint immediately. Expired
    /// ones are left to their scheduled sweeps.
    pub async fn del(&self, key: &str) -> Result<()> {
        let entries: EntryList = {
            let bucket = self.bucket(key).read();
            match bucket.get(key) {
                Some(entries) => entries.clone(),
                None => return Ok(()),
            }
        };

        for entry in entries {
            if entry.is_fresh() {
                if let Err(e) = self.clean_entry(&entry).await {
                    error!("clean entry error: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn schedule_sweep(self: &Arc<Self>, entry: &Arc<Entry>) {
        let cache = self.clone();
        let entry = entry.clone();
        let deadline = entry.expiration() + self.stale_max_age;
        tokio::spawn(async move {
            let nap = deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(nap).await;
            if let Err(e) = cache.clean_entry(&entry).await {
                error!("sweeping entry {}: {e}", entry.key());
            }
        });
    }

    // Remove the entry from its bucket, then clean its backend. The bucket
    // lock is never held across the I/O.
    async fn clean_entry(&self, entry: &Arc<Entry>) -> Result<()> {
        let removed = {
            let mut bucket = self.bucket(entry.key()).write();
            match bucket.get_mut(entry.key()) {
                Some(entries) => {
                    match entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
                        Some(pos) => {
                            entries.remove(pos);
                            true
                        }
                        None => false,
                    }
                }
                None => false,
            }
        };
        if !removed {
            // replaced or already swept, its replacement owns cleanup now
            return Ok(());
        }

        match self.registrar.as_ref() {
            None => entry.clean().await,
            Some(registrar) => self.distributed_clean(registrar, entry).await,
        }
    }

    // Elect one cluster-wide deleter for this key. Losing the election
    // means another node cleans; this node's index entry is gone already.
    async fn distributed_clean(&self, registrar: &Arc<Registrar>, entry: &Arc<Entry>) -> Result<()> {
        let lock_key = registrar.lock_key(entry.key());
        let value = registrar.node_ip().to_string();
        let lock = DistLock::acquire(registrar.directory(), &lock_key, &value).await?;
        let Some(lock) = lock else {
            return Ok(());
        };

        debug!("elected deleter for {}", entry.key());
        let result = entry.clean().await;
        // let peers see the lock key before the session reaps it
        tokio::time::sleep(PEER_OBSERVE_DELAY).await;
        lock.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use http::{HeaderMap, Method, StatusCode};

    fn config() -> Config {
        Config {
            stale_max_age: 1,
            ..Config::default()
        }
    }

    fn request(headers: &[(&str, &str)]) -> RequestHead {
        let mut head = RequestHead::new(Method::GET, "/".parse().unwrap());
        for (name, value) in headers {
            head.headers.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        head
    }

    fn entry(key: &str, req_headers: &[(&str, &str)], resp_headers: &[(&str, &str)]) -> Arc<Entry> {
        let mut map = HeaderMap::new();
        for (name, value) in resp_headers {
            map.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        // public for an hour
        map.insert(
            http::header::CACHE_CONTROL,
            "max-age=3600".parse().unwrap(),
        );
        Arc::new(Entry::new(
            key,
            request(req_headers),
            Response::stub(StatusCode::OK, map),
            &config(),
        ))
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let cache = HttpCache::new(&config(), None);
        assert!(cache.get("abc", &request(&[]), false).is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = HttpCache::new(&config(), None);
        let e = entry("hello", &[], &[]);
        cache.put(e.clone());

        let got = cache.get("hello", &request(&[]), false).unwrap();
        assert!(Arc::ptr_eq(&got, &e));
    }

    #[tokio::test]
    async fn test_keys_and_del() {
        let cache = HttpCache::new(&config(), None);
        cache.put(entry("friday", &[], &[]));
        assert!(cache.keys().contains(&"friday".to_string()));

        cache.del("friday").await.unwrap();
        assert!(cache.get("friday", &request(&[]), false).is_none());
    }

    #[tokio::test]
    async fn test_vary_creates_sibling_entries() {
        let cache = HttpCache::new(&config(), None);
        let gzip = entry("k", &[("accept-encoding", "gzip")], &[("vary", "Accept-Encoding")]);
        let brotli = entry("k", &[("accept-encoding", "br")], &[("vary", "Accept-Encoding")]);
        cache.put(gzip.clone());
        cache.put(brotli.clone());

        let got = cache
            .get("k", &request(&[("accept-encoding", "gzip")]), false)
            .unwrap();
        assert!(Arc::ptr_eq(&got, &gzip));
        let got = cache
            .get("k", &request(&[("accept-encoding", "br")]), false)
            .unwrap();
        assert!(Arc::ptr_eq(&got, &brotli));
    }

    #[tokio::test]
    async fn test_put_replaces_matching_vary() {
        let cache = HttpCache::new(&config(), None);
        let first = entry("k", &[], &[]);
        let second = entry("k", &[], &[]);
        cache.put(first);
        cache.put(second.clone());

        let got = cache.get("k", &request(&[]), false).unwrap();
        assert!(Arc::ptr_eq(&got, &second));
        // still a single representation
        assert_eq!(cache.keys(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_entry_needs_include_stale() {
        let cache = HttpCache::new(&config(), None);
        let mut map = HeaderMap::new();
        map.insert(http::header::CACHE_CONTROL, "max-age=1".parse().unwrap());
        let e = Arc::new(Entry::new(
            "soon-stale",
            request(&[]),
            Response::stub(StatusCode::OK, map),
            &config(),
        ));
        cache.put(e);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("soon-stale", &request(&[]), false).is_none());
        assert!(cache.get("soon-stale", &request(&[]), true).is_some());
    }
}
