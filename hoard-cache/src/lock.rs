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

//! The URL lock registry.
//!
//! One mutex per fingerprint, so concurrent misses for the same key
//! coalesce behind a single upstream fetch: the first holder fetches, the
//! rest wake up to a populated cache. Key mutexes are created on first use
//! and retained for the life of the process; the registry itself shards by
//! the same crc32 bucketing as the cache index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::key::bucket_index;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Sharded per-fingerprint mutex registry.
pub struct UrlLock {
    buckets: Vec<Mutex<HashMap<String, KeyLock>>>,
}

impl UrlLock {
    pub fn new(buckets_num: usize) -> Self {
        UrlLock {
            buckets: (0..buckets_num).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Take the lock for `key`, suspending while another holder is present.
    ///
    /// The guard must live until the request is fully answered.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut bucket = self.buckets[bucket_index(key, self.buckets.len())].lock();
            bucket
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(UrlLock::new(8));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same-key").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = UrlLock::new(8);
        let _a = locks.acquire("a").await;
        // must not deadlock even when "b" lands in the same shard
        let _b = locks.acquire("b").await;
    }
}
