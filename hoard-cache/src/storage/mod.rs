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

//! Cache backend storage abstraction
//!
//! A backend is a single-producer, multiple-consumer byte store for one
//! cache entry. Writes are append-only and sequential; readers observe a
//! prefix of the writer's output.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_cluster::ClusterMemory;
use hoard_error::{Error, ErrorType, Result};

use crate::config::{CacheType, Config};

mod cluster;
mod file;
mod kv;
mod memory;
pub mod subscription;
mod writer;

pub use cluster::ClusterBackend;
pub use file::FileBackend;
pub use kv::{init_kv_client, parse_kv_settings, KvBackend, KvSettings};
pub use memory::MemoryBackend;
pub use writer::{DiscardBackend, WriterBackend};

/// Storage for the body of one cache entry.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Append bytes to the stored body. Returns the number of bytes taken.
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Push buffered bytes down to the underlying store.
    async fn flush(&self) -> Result<()>;

    /// Seal the body: no further writes. Must be safe to call once only;
    /// writing after close is not supported.
    async fn close(&self) -> Result<()>;

    /// Remove the stored body. Safe to call after [Self::close]; must not
    /// destroy bytes still being read.
    async fn clean(&self) -> Result<()>;

    /// Open an independent reader over the stored body. Idempotent:
    /// any number of readers may coexist.
    async fn get_reader(&self) -> Result<BodyReader>;

    /// The number of body bytes this backend holds so far.
    fn length(&self) -> usize;

    /// Whether readers may consume the body while it is still being
    /// written. Non-streaming backends require [Self::close] first.
    fn supports_streaming_read(&self) -> bool {
        false
    }
}

/// Reading side of a [Backend].
#[async_trait]
pub trait ReadBody: Send {
    /// Read the next chunk of the body.
    ///
    /// Return `None` when no more body to read.
    async fn read_body(&mut self) -> Result<Option<Bytes>>;
}

/// Boxed body reader
pub type BodyReader = Box<dyn ReadBody + Send>;

/// A reader over a body that is already complete in memory.
pub struct CompleteReader {
    body: Bytes,
    done: bool,
}

impl CompleteReader {
    pub fn new(body: Bytes) -> Self {
        CompleteReader { body, done: false }
    }
}

#[async_trait]
impl ReadBody for CompleteReader {
    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        if self.done || self.body.is_empty() {
            Ok(None)
        } else {
            self.done = true;
            Ok(Some(self.body.clone()))
        }
    }
}

/// Build the backend of the configured type for one entry.
///
/// `key` is the entry's effective storage key (Vary-extended and escaped);
/// `expiration` bounds the lifetime for stores that expire server-side.
pub async fn build_backend(
    config: &Config,
    key: &str,
    expiration: SystemTime,
    pool: Option<&Arc<ClusterMemory>>,
) -> Result<Arc<dyn Backend>> {
    match config.cache_type {
        CacheType::File => Ok(Arc::new(FileBackend::new(Path::new(&config.path)).await?)),
        CacheType::InMemory => {
            let pool = pool.ok_or_else(|| {
                Error::explain(
                    ErrorType::InternalError,
                    "in_memory backend used before the memory pool was provisioned",
                )
            })?;
            Ok(Arc::new(ClusterBackend::new(key, pool.clone())))
        }
        CacheType::Redis => Ok(Arc::new(KvBackend::new(key, expiration))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_reader_single_chunk() {
        let mut reader = CompleteReader::new(Bytes::from_static(b"abc"));
        assert_eq!(reader.read_body().await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert_eq!(reader.read_body().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_complete_reader_empty() {
        let mut reader = CompleteReader::new(Bytes::new());
        assert_eq!(reader.read_body().await.unwrap(), None);
    }
}
