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

//! The cluster-shared memory backend.
//!
//! Writes buffer locally; closing publishes the buffer into the shared
//! [ClusterMemory] pool under the entry's storage key. Reads may be served
//! by a remote peer; a miss across the whole cluster surfaces as the
//! `NoPrecollect` sentinel which the handler turns into an upstream fetch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_cluster::ClusterMemory;
use hoard_error::Result;
use parking_lot::Mutex;

use super::{Backend, BodyReader, CompleteReader};

/// Body storage in the cluster-shared memory pool.
pub struct ClusterBackend {
    key: String,
    pool: Arc<ClusterMemory>,
    buf: Mutex<Vec<u8>>,
    written: AtomicUsize,
}

impl ClusterBackend {
    /// `key` is the effective storage key the bytes are published under.
    pub fn new(key: &str, pool: Arc<ClusterMemory>) -> Self {
        ClusterBackend {
            key: key.to_string(),
            pool,
            buf: Mutex::new(Vec::new()),
            written: AtomicUsize::new(0),
        }
    }

    /// The storage key of this backend.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.buf.lock().extend_from_slice(data);
        self.written.fetch_add(data.len(), Ordering::Relaxed);
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let body = std::mem::take(&mut *self.buf.lock());
        self.pool.store(&self.key, Bytes::from(body));
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        self.pool.remove(&self.key);
        Ok(())
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        let body = self.pool.load(&self.key).await?;
        Ok(Box::new(CompleteReader::new(body)))
    }

    fn length(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}
