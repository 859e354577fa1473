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

//! Pass-through backends.
//!
//! [WriterBackend] wraps the downstream client writer so the private
//! (uncacheable) path flows through the same response plumbing as cached
//! entries, just without storing anything. [DiscardBackend] swallows a
//! body nobody will read, e.g. a 5xx upstream reply that was replaced by a
//! stale entry.

use std::sync::Arc;

use async_trait::async_trait;
use hoard_error::{Error, ErrorType, Result};

use super::{Backend, BodyReader};
use crate::ClientWriter;

/// Forwards body bytes straight to the client instead of storing them.
pub struct WriterBackend {
    client: Arc<dyn ClientWriter>,
}

impl WriterBackend {
    pub fn new(client: Arc<dyn ClientWriter>) -> Self {
        WriterBackend { client }
    }
}

#[async_trait]
impl Backend for WriterBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.client.write_body(data).await
    }

    async fn flush(&self) -> Result<()> {
        self.client.flush().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        Ok(())
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        Error::e_explain(ErrorType::ReadError, "private responses are not readable")
    }

    fn length(&self) -> usize {
        0
    }
}

/// Swallows everything written into it.
pub struct DiscardBackend;

#[async_trait]
impl Backend for DiscardBackend {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        Ok(())
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        Error::e_explain(ErrorType::ReadError, "discarded responses are not readable")
    }

    fn length(&self) -> usize {
        0
    }
}
