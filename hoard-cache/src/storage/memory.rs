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

//! The local in-process memory backend.
//!
//! Buffers the body into a growing byte vector. Readers get the completed
//! body only; the response layer holds them back until the writer closes.
//! This is what the in-memory cache type degrades to when distribution is
//! off and no pool exists, and what tests reach for.

use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::Result;
use parking_lot::Mutex;

use super::{Backend, BodyReader, CompleteReader};

/// Body storage in a plain in-process buffer.
pub struct MemoryBackend {
    buf: Mutex<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            buf: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        self.buf.lock().clear();
        Ok(())
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        let body = Bytes::from(self.buf.lock().clone());
        Ok(Box::new(CompleteReader::new(body)))
    }

    fn length(&self) -> usize {
        self.buf.lock().len()
    }
}
