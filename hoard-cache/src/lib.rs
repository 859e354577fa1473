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

//! A shared HTTP cache for reverse proxies.
//!
//! The cache sits between a server and its upstream handler chain. For
//! every request it either replays a stored response (honoring RFC 7234
//! freshness and `Vary`), or forwards upstream once while concurrent
//! requests for the same key wait on the result. Bodies live in one of
//! several storage backends; a cluster of cache nodes can share the
//! in-memory backend and fan invalidations out through an external
//! directory service.
//!
//! The outer HTTP server stays out of scope: it supplies requests, a
//! client writer and an upstream invocation primitive ([Upstream]), and
//! mounts the [admin] endpoints wherever it wants them.

#![allow(clippy::new_without_default)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hoard_cluster::{local_ip, spawn_peer_server, ClusterMemory, ClusterOptions, Registrar};
use hoard_error::{ErrorType, OrErr, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod admin;
pub mod cache_control;
pub mod config;
pub mod entry;
pub mod handler;
pub mod index;
pub mod key;
pub mod lock;
pub mod policy;
pub mod response;
pub mod storage;

pub use config::{CacheType, Config, DistributedConfig};
pub use entry::Entry;
pub use handler::{CacheHandler, Upstream};
pub use index::HttpCache;
pub use lock::UrlLock;
pub use response::Response;

/// How a request was answered, stamped into the status header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache.
    Hit,
    /// Fetched upstream and stored.
    Miss,
    /// Fetched upstream, response was not storable.
    Skip,
    /// The cache never considered this request.
    Bypass,
}

impl CacheStatus {
    /// The status header value for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Skip => "skip",
            CacheStatus::Bypass => "bypass",
        }
    }
}

/// Snapshot of the request a cache decision is made for.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        RequestHead {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// The host this request addresses: `Host` header first, absolute-form
    /// URI second.
    pub fn host(&self) -> &str {
        if let Some(host) = self.headers.get(http::header::HOST) {
            if let Ok(host) = host.to_str() {
                return host;
            }
        }
        self.uri.authority().map(|a| a.as_str()).unwrap_or("")
    }

    /// The first value of the named header, empty when absent or not
    /// printable.
    pub fn header_str(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

/// The downstream side of one request: whatever the outer server writes
/// client responses with.
#[async_trait]
pub trait ClientWriter: Send + Sync {
    /// Add a header to the pending response.
    fn append_header(&self, name: HeaderName, value: HeaderValue);

    /// Send the status line and everything appended so far.
    async fn write_header(&self, code: StatusCode) -> Result<()>;

    /// Send body bytes.
    async fn write_body(&self, data: &[u8]) -> Result<usize>;

    /// Flush buffered body bytes to the client.
    async fn flush(&self) -> Result<()>;
}

// Process-wide state. The handler is created per route but every route
// shares one index, one lock registry and one cluster registration.
static CONFIG: OnceCell<ArcSwap<Config>> = OnceCell::new();
static CACHE: OnceCell<Arc<HttpCache>> = OnceCell::new();
static URL_LOCKS: OnceCell<Arc<UrlLock>> = OnceCell::new();
static POOL: OnceCell<Arc<ClusterMemory>> = OnceCell::new();
static REGISTRAR: OnceCell<Arc<Registrar>> = OnceCell::new();
static PEER_SERVER: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>> = Mutex::new(None);

const POOL_GROUP: &str = "http_cache";
// drain budget for the peer surface and the directory on teardown
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// The live configuration.
pub fn current_config() -> Arc<Config> {
    CONFIG
        .get_or_init(|| ArcSwap::new(Arc::new(Config::default())))
        .load_full()
}

/// The process-wide cache index, once provisioned.
pub fn shared_cache() -> Option<Arc<HttpCache>> {
    CACHE.get().cloned()
}

/// Wire the cache up from a validated [Config] and hand back the handler.
///
/// Safe to call once per process; later calls swap the configuration but
/// keep the already-sized index and lock registry (bucket sizing is fixed
/// for the process lifetime).
pub async fn provision(config: Config) -> Result<CacheHandler> {
    config.validate()?;
    let config = Arc::new(config);
    CONFIG
        .get_or_init(|| ArcSwap::new(config.clone()))
        .store(config.clone());

    if config.cache_type == CacheType::Redis {
        let settings = storage::parse_kv_settings(&config.redis_connection_setting)?;
        storage::init_kv_client(&settings).await?;
    }

    // joining the cluster fails the whole provision: a node that cannot
    // announce itself must not silently serve alone
    let registrar = match config.distributed.as_ref() {
        Some(dist) if config.cache_type == CacheType::InMemory => {
            let registrar = match REGISTRAR.get() {
                Some(existing) => existing.clone(),
                None => {
                    let registrar = Registrar::register(ClusterOptions {
                        directory_addr: dist.addr.clone(),
                        service_name: dist.service_name.clone(),
                        key_prefix: dist.key_prefix.clone(),
                        config_key: dist.config_key.clone(),
                        peer_port: dist.peer_port,
                        health_port: dist.health_port,
                        health_path: dist.health_path.clone(),
                    })
                    .await?;
                    let _ = REGISTRAR.set(registrar.clone());
                    registrar
                }
            };
            Some(registrar)
        }
        _ => None,
    };

    let pool = match config.cache_type {
        CacheType::InMemory => {
            let pool = POOL
                .get_or_init(|| {
                    let self_addr = match registrar.as_ref() {
                        Some(reg) => {
                            let port = config
                                .distributed
                                .as_ref()
                                .map(|d| d.peer_port)
                                .unwrap_or(80);
                            std::net::SocketAddr::new(reg.node_ip(), port)
                        }
                        None => match local_ip() {
                            Ok(ip) => std::net::SocketAddr::new(ip, 80),
                            Err(_) => "127.0.0.1:80".parse().unwrap(),
                        },
                    };
                    ClusterMemory::new(POOL_GROUP, self_addr, config.cache_max_memory_size)
                })
                .clone();
            Some(pool)
        }
        _ => None,
    };

    let cache = CACHE
        .get_or_init(|| HttpCache::new(&config, registrar.clone()))
        .clone();
    let locks = URL_LOCKS
        .get_or_init(|| Arc::new(UrlLock::new(config.cache_buckets_num)))
        .clone();

    if let (Some(registrar), Some(pool)) = (registrar.as_ref(), pool.as_ref()) {
        start_cluster(registrar, pool, &cache).await?;
    }

    Ok(CacheHandler::new(config, cache, locks, pool))
}

// Serve peers, follow peer health, invalidations and config updates.
async fn start_cluster(
    registrar: &Arc<Registrar>,
    pool: &Arc<ClusterMemory>,
    cache: &Arc<HttpCache>,
) -> Result<()> {
    {
        let mut server = PEER_SERVER.lock();
        if server.is_none() {
            // bound outside the lock is nicer but the race is provision-only
            drop(server);
            let (handle, shutdown) = spawn_peer_server(pool.clone(), pool.self_addr()).await?;
            server = PEER_SERVER.lock();
            if server.is_none() {
                *server = Some((handle, shutdown));
            }
        }
    }

    {
        let pool = pool.clone();
        registrar.watch_peers(move |peers| pool.set_peers(peers));
    }
    {
        let cache = cache.clone();
        registrar.watch_invalidations(move |key| {
            let cache = cache.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = cache.del(&key).await {
                    error!("applying peer invalidation of {key}: {e}");
                }
            });
        });
    }
    registrar.watch_config(|raw| match std::str::from_utf8(raw) {
        Ok(raw) => match Config::load_yaml(raw) {
            Ok(new_config) => {
                info!("configuration reloaded from the directory");
                CONFIG
                    .get_or_init(|| ArcSwap::new(Arc::new(Config::default())))
                    .store(Arc::new(new_config));
            }
            Err(e) => warn!("ignoring bad config from the directory: {e}"),
        },
        Err(_) => warn!("ignoring non-utf8 config from the directory"),
    });

    Ok(())
}

/// Tear down what [provision] started: stop serving peers and leave the
/// directory. The index itself lives for the process.
pub async fn cleanup() -> Result<()> {
    let server = PEER_SERVER.lock().take();
    if let Some((handle, shutdown)) = server {
        let _ = shutdown.send(true);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!("peer surface did not drain in time");
        }
    }

    if let Some(registrar) = REGISTRAR.get() {
        tokio::time::timeout(SHUTDOWN_TIMEOUT, registrar.deregister())
            .await
            .or_err(ErrorType::DirectoryError, "deregistration timed out")??;
    }
    Ok(())
}
