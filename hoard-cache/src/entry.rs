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

//! Cache entries.
//!
//! An [Entry] ties a request snapshot to the [Response] that answered it,
//! together with the cacheability verdict and the expiration instant.
//! Multiple entries may share one fingerprint when the response varies on
//! request headers; [Entry::matches_vary] decides which one a request may
//! reuse.

use std::sync::Arc;
use std::time::SystemTime;

use hoard_cluster::ClusterMemory;
use hoard_error::Result;
use http::{header, StatusCode};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::config::Config;
use crate::policy;
use crate::response::Response;
use crate::storage::{build_backend, ClusterBackend, WriterBackend};
use crate::{ClientWriter, RequestHead};

/// A cached request/response pair.
// https://httpwg.org/specs/rfc7234.html#caching.overview
pub struct Entry {
    key: String,
    is_public: bool,
    expiration: SystemTime,
    request: RequestHead,
    response: Arc<Response>,
}

impl Entry {
    /// Build an entry for the given request and response, scoring its
    /// cacheability on the way.
    pub fn new(key: &str, request: RequestHead, response: Arc<Response>, config: &Config) -> Entry {
        let (is_public, expiration) = policy::cache_status(
            &request,
            response.status(),
            &response.snap_header(),
            config,
            SystemTime::now(),
        );
        Entry {
            key: key.to_string(),
            is_public,
            expiration,
            request,
            response,
        }
    }

    /// A probe entry bound to the cluster pool under the given fingerprint.
    ///
    /// Used when another node may have published this key already: reading
    /// it either serves the peer's bytes or fails with `NoPrecollect`.
    pub fn provisional(key: &str, request: RequestHead, pool: &Arc<ClusterMemory>) -> Entry {
        let storage_key = escape_storage_key(key, "");
        let backend = Arc::new(ClusterBackend::new(&storage_key, pool.clone()));
        Entry {
            key: key.to_string(),
            is_public: true,
            expiration: SystemTime::now(),
            request,
            response: Response::sealed(StatusCode::OK, backend),
        }
    }

    /// The fingerprint this entry is indexed under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the decision engine allowed storing this response.
    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// The instant this entry goes stale.
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    /// The stored response.
    pub fn response(&self) -> &Arc<Response> {
        &self.response
    }

    /// The stored request snapshot.
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Whether this entry is not expired yet.
    pub fn is_fresh(&self) -> bool {
        self.expiration > SystemTime::now()
    }

    /// Whether `head` agrees with the stored request on every header named
    /// in the stored response's `Vary`.
    // https://httpwg.org/specs/rfc7231.html#header.vary
    pub fn matches_vary(&self, head: &RequestHead) -> bool {
        let snap = self.response.snap_header();
        let vary = snap
            .get(header::VARY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        for name in vary.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if head.header_str(name) != self.request.header_str(name) {
                return false;
            }
        }
        true
    }

    /// The effective storage key: the fingerprint extended with the request
    /// values of every `Vary` dimension, path-escaped.
    // https://cloud.google.com/cdn/docs/caching#vary-headers
    pub fn storage_key(&self) -> String {
        let snap = self.response.snap_header();
        let vary = snap
            .get(header::VARY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut suffix = String::new();
        for name in vary.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            suffix.push_str(self.request.header_str(name));
        }
        escape_storage_key(&self.key, &suffix)
    }

    /// Attach a body backend of the configured type to the response.
    pub async fn set_backend(
        &self,
        config: &Config,
        pool: Option<&Arc<ClusterMemory>>,
    ) -> Result<()> {
        let backend =
            build_backend(config, &self.storage_key(), self.expiration, pool).await?;
        self.response.set_body(backend);
        Ok(())
    }

    /// Purge the stored body.
    pub async fn clean(&self) -> Result<()> {
        self.response.clean().await
    }

    /// Answer an uncacheable response by wiring the client through as the
    /// body storage: the upstream worker writes straight to the client.
    pub(crate) async fn write_private(&self, client: Arc<dyn ClientWriter>) -> Result<()> {
        client.write_header(self.response.status()).await?;
        self.response
            .set_body(Arc::new(WriterBackend::new(client)));
        self.response.wait_close().await;
        Ok(())
    }
}

fn escape_storage_key(key: &str, vary_suffix: &str) -> String {
    let mut raw = String::with_capacity(key.len() + vary_suffix.len());
    raw.push_str(key);
    raw.push_str(vary_suffix);
    utf8_percent_encode(&raw, NON_ALPHANUMERIC).to_string()
}
