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

//! The per-request cache handler.
//!
//! For every request this decides between bypass, hit, miss and skip,
//! coalesces concurrent misses behind the URL lock, and keeps the upstream
//! fetch detached from the first client so late waiters still receive a
//! complete response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hoard_cluster::ClusterMemory;
use hoard_error::{BError, Result};
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::entry::Entry;
use crate::index::HttpCache;
use crate::key;
use crate::lock::UrlLock;
use crate::response::Response;
use crate::storage::{DiscardBackend, WriterBackend};
use crate::{CacheStatus, ClientWriter, RequestHead};

/// The outer server's way of producing a response: invoke the next handler
/// in its chain against our [Response].
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn serve(&self, head: RequestHead, body: Bytes, response: Arc<Response>) -> Result<()>;
}

/// The cache middleware.
pub struct CacheHandler {
    config: Arc<Config>,
    cache: Arc<HttpCache>,
    locks: Arc<UrlLock>,
    pool: Option<Arc<ClusterMemory>>,
}

impl CacheHandler {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<HttpCache>,
        locks: Arc<UrlLock>,
        pool: Option<Arc<ClusterMemory>>,
    ) -> Self {
        CacheHandler {
            config,
            cache,
            locks,
            pool,
        }
    }

    /// The cache index this handler serves from.
    pub fn cache(&self) -> &Arc<HttpCache> {
        &self.cache
    }

    /// Serve one request.
    pub async fn handle(
        &self,
        head: RequestHead,
        body: Bytes,
        client: Arc<dyn ClientWriter>,
        next: Arc<dyn Upstream>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut upstream_duration = Duration::ZERO;

        let result = self
            .dispatch(&head, body, &client, next, &mut upstream_duration)
            .await;

        if upstream_duration.is_zero() {
            debug!(
                "cache handler: host={} method={} uri={} request_time={:?}",
                head.host(),
                head.method,
                head.uri,
                started.elapsed(),
            );
        } else {
            debug!(
                "cache handler: host={} method={} uri={} request_time={:?} upstream_time={:?}",
                head.host(),
                head.method,
                head.uri,
                started.elapsed(),
                upstream_duration,
            );
        }
        result
    }

    async fn dispatch(
        &self,
        head: &RequestHead,
        body: Bytes,
        client: &Arc<dyn ClientWriter>,
        next: Arc<dyn Upstream>,
        upstream_duration: &mut Duration,
    ) -> Result<()> {
        if !should_use_cache(head, &self.config) {
            self.stamp(client, CacheStatus::Bypass);
            return self
                .serve_direct(head.clone(), body, client, next, upstream_duration)
                .await;
        }

        let key = key::build_key(&self.config.cache_key_template, head, &body);

        // one fetch per key at a time; everyone else queues here
        let _guard = self.locks.acquire(&key).await;

        if let Some(previous) = self.cache.get(&key, head, false) {
            if previous.is_public() {
                match self.respond(head, client, &previous, CacheStatus::Hit).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        // the body is not retrievable: the cluster no longer
                        // holds the bytes, or the backend failed the read.
                        // The entry's status code answers, with no body.
                        if !e.is_no_precollect() {
                            warn!("serving cached entry for {key}: {e}");
                        }
                        self.stamp(client, CacheStatus::Hit);
                        client.write_header(previous.response().status()).await?;
                        return Ok(());
                    }
                }
            }
        } else if let Some(pool) = self.probe_pool() {
            // another node may have published this key already
            let probe = Arc::new(Entry::provisional(&key, head.clone(), pool));
            match self.respond(head, client, &probe, CacheStatus::Hit).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_no_precollect() => {}
                Err(e) => return Err(e),
            }
        }

        let fetch_started = Instant::now();
        let (response, mut upstream_err) = self.fetch_upstream(head.clone(), body, next);
        // headers, unless the worker bails out before producing any
        tokio::select! {
            _ = response.wait_headers() => {}
            _ = response.wait_close() => {}
        }
        *upstream_duration = fetch_started.elapsed();

        let entry = Arc::new(Entry::new(
            &key,
            head.clone(),
            response.clone(),
            &self.config,
        ));

        if let Some(e) = pop_upstream_error(&mut upstream_err) {
            let code = if response.headers_written() {
                response.status()
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            client.write_header(code).await?;
            return Err(e);
        }

        // stale-on-error: a 5xx upstream does not shadow a usable stale copy
        if response.status().is_server_error() {
            if let Some(stale) = self.cache.get(&key, head, true) {
                if stale.is_public() {
                    response.set_body(Arc::new(DiscardBackend));
                    match self.respond(head, client, &stale, CacheStatus::Hit).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            // an unreadable stale body still answers with its
                            // stored status, never with the 5xx below
                            warn!("serving stale entry for {key}: {e}");
                            self.stamp(client, CacheStatus::Hit);
                            client.write_header(stale.response().status()).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }

        if entry.is_public() {
            if let Err(e) = entry.set_backend(&self.config, self.pool.as_ref()).await {
                client.write_header(StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Err(e);
            }
            self.cache.put(entry.clone());
            return self.respond(head, client, &entry, CacheStatus::Miss).await;
        }

        self.respond(head, client, &entry, CacheStatus::Skip).await
    }

    // The pool is only probed when it is actually shared with peers.
    fn probe_pool(&self) -> Option<&Arc<ClusterMemory>> {
        if self.config.distributed.is_some() {
            self.pool.as_ref()
        } else {
            None
        }
    }

    /// Spawn the upstream fetch on its own task so that the first client
    /// going away cannot abort a response other waiters depend on.
    fn fetch_upstream(
        &self,
        head: RequestHead,
        body: Bytes,
        next: Arc<dyn Upstream>,
    ) -> (Arc<Response>, oneshot::Receiver<Result<()>>) {
        let response = Response::new();
        let (err_tx, err_rx) = oneshot::channel();
        let worker_response = response.clone();
        tokio::spawn(async move {
            let result = next.serve(head, body, worker_response.clone()).await;
            if let Err(e) = &result {
                error!("upstream worker: {e}");
            }
            let _ = err_tx.send(result);
            if let Err(e) = worker_response.close().await {
                error!("sealing upstream response: {e}");
            }
        });
        (response, err_rx)
    }

    // Replay an entry to the client. Ordered so that nothing reaches the
    // client before the body source is known to be usable.
    async fn respond(
        &self,
        head: &RequestHead,
        client: &Arc<dyn ClientWriter>,
        entry: &Arc<Entry>,
        status: CacheStatus,
    ) -> Result<()> {
        let response = entry.response();

        if !entry.is_public() {
            self.stamp(client, status);
            copy_headers(&response.snap_header(), client.as_ref());
            return entry.write_private(client.clone()).await;
        }

        if head.method == Method::HEAD {
            self.stamp(client, status);
            copy_headers(&response.snap_header(), client.as_ref());
            client.write_header(response.status()).await?;
            return Ok(());
        }

        let mut reader = response.get_reader().await?;

        self.stamp(client, status);
        copy_headers(&response.snap_header(), client.as_ref());
        let length = response.body_length();
        if length > 0 {
            // the snapshot dropped Content-Length, restore what we stored
            if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
                client.append_header(header::CONTENT_LENGTH, value);
            }
        }
        client.write_header(response.status()).await?;

        while let Some(chunk) = reader.read_body().await? {
            client.write_body(&chunk).await?;
        }
        Ok(())
    }

    // Full pass-through for requests the cache never considers.
    async fn serve_direct(
        &self,
        head: RequestHead,
        body: Bytes,
        client: &Arc<dyn ClientWriter>,
        next: Arc<dyn Upstream>,
        upstream_duration: &mut Duration,
    ) -> Result<()> {
        let fetch_started = Instant::now();
        let (response, mut upstream_err) = self.fetch_upstream(head, body, next);
        tokio::select! {
            _ = response.wait_headers() => {}
            _ = response.wait_close() => {}
        }
        *upstream_duration = fetch_started.elapsed();

        // a bypass mirrors the origin verbatim, live headers included
        {
            let headers = response.headers_mut();
            for (name, value) in headers.iter() {
                client.append_header(name.clone(), value.clone());
            }
        }
        client.write_header(response.status()).await?;
        response.set_body(Arc::new(WriterBackend::new(client.clone())));
        response.wait_close().await;

        match pop_upstream_error(&mut upstream_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stamp(&self, client: &Arc<dyn ClientWriter>, status: CacheStatus) {
        if self.config.status_header.is_empty() {
            return;
        }
        if let Ok(name) = HeaderName::from_bytes(self.config.status_header.as_bytes()) {
            client.append_header(name, HeaderValue::from_static(status.as_str()));
        }
    }
}

/// Copy every header pair of `from` onto the client.
pub fn copy_headers(from: &http::HeaderMap, client: &dyn ClientWriter) {
    for (name, value) in from.iter() {
        client.append_header(name.clone(), value.clone());
    }
}

fn pop_upstream_error(rx: &mut oneshot::Receiver<Result<()>>) -> Option<BError> {
    match rx.try_recv() {
        Ok(Err(e)) => Some(e),
        _ => None,
    }
}

// Whether the cache considers this request at all.
fn should_use_cache(head: &RequestHead, config: &Config) -> bool {
    if !config.method_matches(&head.method) {
        return false;
    }

    // a previous request for this URL may have been answered for another
    // range, serving it whole would be wrong
    if head.headers.contains_key(header::RANGE) {
        return false;
    }

    if is_websocket(head) {
        return false;
    }

    true
}

fn is_websocket(head: &RequestHead) -> bool {
    let upgrade = head
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return false;
    }
    head.headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.eq_ignore_ascii_case("websocket"))
}
