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

//! Node registration and the directory watch loops.
//!
//! A node announces itself under `<service>:<ip>:<uuid>` with an HTTP health
//! check, then follows three event streams: passing health checks (peer
//! set), the invalidation key prefix (cross-node deletes), and a single
//! config key (hot reload). Events are surfaced as plain callbacks; the
//! cache wires them to its own state so this crate never depends on it.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use hoard_error::{ErrorType, OrErr, Result};
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::directory::{Directory, HealthCheck, KvPair, ServiceRegistration};

// how long to pause a watch loop after a directory error
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Settings for joining a cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Directory agent address, `host:port`.
    pub directory_addr: String,
    /// Service name this node registers under.
    pub service_name: String,
    /// KV prefix carrying invalidation events.
    pub key_prefix: String,
    /// KV key watched for config hot reloads.
    pub config_key: String,
    /// Port of the peer byte surface.
    pub peer_port: u16,
    /// Port the health check probes.
    pub health_port: u16,
    /// Path the health check probes.
    pub health_path: String,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            directory_addr: "localhost:8500".to_string(),
            service_name: "cache_server".to_string(),
            key_prefix: "del_cache_key/".to_string(),
            config_key: "caddy_config".to_string(),
            peer_port: 80,
            health_port: 7777,
            health_path: "/health".to_string(),
        }
    }
}

/// Find the IP this node is reachable at from its peers.
pub fn local_ip() -> Result<IpAddr> {
    // Routing trick: no packet is sent, the kernel just picks the
    // interface it would route through.
    let socket =
        UdpSocket::bind("0.0.0.0:0").or_err(ErrorType::InternalError, "binding probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .or_err(ErrorType::InternalError, "routing probe socket")?;
    let addr = socket
        .local_addr()
        .or_err(ErrorType::InternalError, "reading probe address")?;
    Ok(addr.ip())
}

/// A registered cluster node plus its watch loops.
pub struct Registrar {
    directory: Arc<Directory>,
    options: ClusterOptions,
    service_id: String,
    node_ip: IpAddr,
    shutdown: watch::Sender<bool>,
    watch_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Registrar {
    /// Register this node with the directory. Failure here is fatal for the
    /// provision phase: a node that cannot announce itself must not join.
    pub async fn register(options: ClusterOptions) -> Result<Arc<Registrar>> {
        let directory = Arc::new(Directory::new(&options.directory_addr)?);
        let node_ip = local_ip()?;
        let service_id = format!("{}:{}:{}", options.service_name, node_ip, Uuid::new_v4());

        let registration = ServiceRegistration {
            id: service_id.clone(),
            name: options.service_name.clone(),
            address: node_ip.to_string(),
            port: options.health_port,
            check: HealthCheck {
                name: format!("health check for {}", options.service_name),
                http: format!("http://{}:{}{}", node_ip, options.health_port, options.health_path),
                method: "GET".to_string(),
                interval: "30s".to_string(),
                timeout: "10s".to_string(),
                tls_skip_verify: true,
                deregister_critical_service_after: "15s".to_string(),
            },
        };
        directory.register_service(&registration).await?;
        debug!("registered {service_id} with the directory");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Registrar {
            directory,
            options,
            service_id,
            node_ip,
            shutdown,
            watch_tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// The directory client this node registered through.
    pub fn directory(&self) -> Arc<Directory> {
        self.directory.clone()
    }

    /// This node's service ID.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// This node's IP as seen by peers.
    pub fn node_ip(&self) -> IpAddr {
        self.node_ip
    }

    /// The invalidation lock key for a cache key.
    pub fn lock_key(&self, cache_key: &str) -> String {
        format!("{}{}", self.options.key_prefix, cache_key)
    }

    /// Follow the service's passing health checks and hand every peer-set
    /// change to `on_peers`. Peer IPs come out of the service IDs.
    pub fn watch_peers<F>(self: &Arc<Self>, on_peers: F)
    where
        F: Fn(Vec<SocketAddr>) + Send + Sync + 'static,
    {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut index = None;
            loop {
                let query = this
                    .directory
                    .passing_services(&this.options.service_name, index);
                let result = tokio::select! {
                    r = query => r,
                    _ = shutdown.changed() => return,
                };
                match result {
                    Ok((entries, next_index)) => {
                        let mut peers: Vec<SocketAddr> = entries
                            .iter()
                            .filter(|e| e.service.service == this.options.service_name)
                            .filter_map(|e| peer_ip_from_service_id(&e.service.id))
                            .map(|ip| SocketAddr::new(ip, this.options.peer_port))
                            .collect();
                        peers.sort_unstable();
                        peers.dedup();
                        on_peers(peers);
                        index = Some(next_index);
                    }
                    Err(e) => {
                        warn!("peer watch: {e}");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
            }
        });
        self.watch_tasks.lock().push(task);
    }

    /// Follow the invalidation key prefix. For every event initiated by
    /// another node, the prefix is trimmed off and the remaining cache key
    /// is handed to `on_invalidate`.
    pub fn watch_invalidations<F>(self: &Arc<Self>, on_invalidate: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let this = self.clone();
        let own_ip = self.node_ip.to_string();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut index = None;
            loop {
                let query = this.directory.kv_list(&this.options.key_prefix, index);
                let result = tokio::select! {
                    r = query => r,
                    _ = shutdown.changed() => return,
                };
                match result {
                    Ok((pairs, next_index)) => {
                        let prev = index.unwrap_or(0);
                        for pair in new_pairs(&pairs, prev) {
                            let initiator = String::from_utf8_lossy(&pair.value);
                            if initiator == own_ip {
                                continue;
                            }
                            if let Some(key) = pair.key.strip_prefix(&this.options.key_prefix) {
                                debug!("invalidation of {key} from {initiator}");
                                on_invalidate(key);
                            }
                        }
                        index = Some(next_index);
                    }
                    Err(e) => {
                        warn!("invalidation watch: {e}");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
            }
        });
        self.watch_tasks.lock().push(task);
    }

    /// Follow the config key and hand every new value to `on_config`.
    pub fn watch_config<F>(self: &Arc<Self>, on_config: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut index = None;
            loop {
                let query = this.directory.kv_watch(&this.options.config_key, index);
                let result = tokio::select! {
                    r = query => r,
                    _ = shutdown.changed() => return,
                };
                match result {
                    Ok((pair, next_index)) => {
                        if let Some(pair) = pair {
                            if pair.modify_index > index.unwrap_or(0) && index.is_some() {
                                debug!("config key changed, reloading");
                                on_config(&pair.value);
                            }
                        }
                        index = Some(next_index);
                    }
                    Err(e) => {
                        warn!("config watch: {e}");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
            }
        });
        self.watch_tasks.lock().push(task);
    }

    /// Stop the watch loops and remove this node from the directory.
    pub async fn deregister(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.watch_tasks.lock().drain(..) {
            task.abort();
        }
        self.directory.deregister_service(&self.service_id).await
    }
}

// `<service>:<ip>:<uuid>` -> ip
fn peer_ip_from_service_id(id: &str) -> Option<IpAddr> {
    let mut parts = id.split(':');
    let _service = parts.next()?;
    parts.next()?.parse().ok()
}

// Pairs whose modify index is newer than the previously observed one.
fn new_pairs(pairs: &[KvPair], prev_index: u64) -> impl Iterator<Item = &KvPair> {
    pairs.iter().filter(move |p| p.modify_index > prev_index)
}
