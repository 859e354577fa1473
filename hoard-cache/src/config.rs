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

//! Cache configuration.

use hoard_error::{Error, ErrorType, OrErr, Result};
use serde::{Deserialize, Serialize};

use crate::policy::RuleMatcher;

/// The storage backend kind for cached bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Bodies are written to temp files; readers can stream a body while it
    /// is still being written.
    File,
    /// Bodies live in the (optionally cluster-shared) memory pool.
    InMemory,
    /// Bodies live in an external Redis store.
    Redis,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::File => "file",
            CacheType::InMemory => "in_memory",
            CacheType::Redis => "redis",
        }
    }
}

/// Settings for joining a cluster of cache peers. Present only when
/// distribution is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Directory agent address, `host:port`.
    pub addr: String,
    /// Service name this node registers under.
    pub service_name: String,
    /// KV prefix under which invalidation events are published.
    pub key_prefix: String,
    /// KV key watched for configuration hot reloads.
    pub config_key: String,
    /// Port of the peer byte surface.
    pub peer_port: u16,
    /// Port the directory health check probes.
    pub health_port: u16,
    /// Path the directory health check probes.
    pub health_path: String,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            addr: "localhost:8500".to_string(),
            service_name: "cache_server".to_string(),
            key_prefix: "del_cache_key/".to_string(),
            config_key: "caddy_config".to_string(),
            peer_port: 80,
            health_port: 7777,
            health_path: "/health".to_string(),
        }
    }
}

/// The cache configuration.
///
/// All durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which storage backend holds cached bodies.
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Response header used to tag hit/miss/skip/bypass. Empty disables it.
    pub status_header: String,
    /// Fallback TTL for cacheable responses without a usable explicit expiry.
    pub default_max_age: u64,
    /// TTL stamped on non-cacheable responses to pace retries.
    pub lock_timeout: u64,
    /// How long past expiration an entry lingers for stale-on-error before
    /// its sweep runs.
    pub stale_max_age: u64,
    /// HTTP methods considered cacheable.
    pub match_methods: Vec<String>,
    /// Shard count for the cache index and the URL lock registry.
    pub cache_buckets_num: usize,
    /// Byte budget for the in-memory pool.
    pub cache_max_memory_size: usize,
    /// Directory for the file backend.
    pub path: String,
    /// Substitution template for the cache fingerprint.
    pub cache_key_template: String,
    /// `addr [db [password]]`, space separated.
    pub redis_connection_setting: String,
    /// Predicates a response must match to be cached.
    pub rule_matchers: Vec<RuleMatcher>,
    /// Cluster settings; `None` runs the cache standalone.
    pub distributed: Option<DistributedConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_type: CacheType::File,
            status_header: "X-Cache-Status".to_string(),
            default_max_age: 5 * 60,
            lock_timeout: 5 * 60,
            stale_max_age: 5 * 60,
            match_methods: vec!["GET".to_string(), "HEAD".to_string()],
            cache_buckets_num: 256,
            cache_max_memory_size: 1 << 30,
            path: "/tmp/caddy_cache".to_string(),
            cache_key_template: "{method} {host}{path}?{query}".to_string(),
            redis_connection_setting: "localhost:6379 0".to_string(),
            rule_matchers: Vec::new(),
            distributed: None,
        }
    }
}

impl Config {
    /// Load a [Config] from its YAML (or JSON) representation.
    pub fn load_yaml(conf_str: &str) -> Result<Self> {
        let conf: Config = serde_yaml::from_str(conf_str)
            .or_err(ErrorType::InternalError, "parsing cache config")?;
        conf.validate()?;
        Ok(conf)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cache_buckets_num == 0 {
            return Error::e_explain(ErrorType::InternalError, "cache_buckets_num must be > 0");
        }
        if self.cache_key_template.is_empty() {
            return Error::e_explain(ErrorType::InternalError, "cache_key_template must be set");
        }
        if self.match_methods.is_empty() {
            return Error::e_explain(ErrorType::InternalError, "match_methods must not be empty");
        }
        if self.cache_type == CacheType::File && self.path.is_empty() {
            return Error::e_explain(
                ErrorType::InternalError,
                "path must be set for the file backend",
            );
        }
        if self.cache_type == CacheType::Redis && self.redis_connection_setting.is_empty() {
            return Error::e_explain(
                ErrorType::InternalError,
                "redis_connection_setting must be set for the redis backend",
            );
        }
        Ok(())
    }

    /// Whether the request method is one this cache considers at all.
    pub fn method_matches(&self, method: &http::Method) -> bool {
        self.match_methods.iter().any(|m| m == method.as_str())
    }
}
