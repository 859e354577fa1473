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

//! Client for the external directory service (Consul HTTP API).
//!
//! Only the small slice of the API the cache needs: agent service
//! registration with an HTTP health check, passing-health queries, the KV
//! store with blocking queries, and sessions for the distributed lock.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hoard_error::{Error, ErrorType, OrErr, Result};
use serde::{Deserialize, Serialize};

/// How long a blocking query is allowed to hang before the directory
/// answers with "no change".
pub const WATCH_WAIT: Duration = Duration::from_secs(30);

// the client timeout needs headroom over the server-side wait
const REQUEST_TIMEOUT: Duration = Duration::from_secs(40);

/// Service registration payload.
#[derive(Debug, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Check")]
    pub check: HealthCheck,
}

/// HTTP health check attached to a service registration.
#[derive(Debug, Serialize)]
pub struct HealthCheck {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "HTTP")]
    pub http: String,
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Timeout")]
    pub timeout: String,
    #[serde(rename = "TLSSkipVerify")]
    pub tls_skip_verify: bool,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// One entry of a health query answer.
#[derive(Debug, Deserialize)]
pub struct HealthEntry {
    #[serde(rename = "Service")]
    pub service: HealthService,
}

#[derive(Debug, Deserialize)]
pub struct HealthService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Address")]
    pub address: String,
}

/// One key/value pair from the KV store. `value` is already base64-decoded.
#[derive(Debug, Clone)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct RawKvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

impl RawKvPair {
    fn decode(self) -> Result<KvPair> {
        let value = match self.value {
            Some(encoded) => BASE64
                .decode(encoded)
                .or_err(ErrorType::DirectoryError, "decoding KV value")?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            modify_index: self.modify_index,
        })
    }
}

#[derive(Debug, Serialize)]
struct SessionRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: String,
}

#[derive(Debug, Deserialize)]
struct SessionReply {
    #[serde(rename = "ID")]
    id: String,
}

/// The directory client.
pub struct Directory {
    base: String,
    client: reqwest::Client,
}

impl Directory {
    /// Create a client talking to the agent at `addr` (`host:port`).
    pub fn new(addr: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .or_err(ErrorType::DirectoryError, "building directory client")?;
        Ok(Directory {
            base: format!("http://{addr}"),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn expect_ok(resp: reqwest::Response, what: &'static str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Error::e_explain(
                ErrorType::DirectoryError,
                format!("{what}: directory answered {}", resp.status()),
            )
        }
    }

    /// Register this node's cache service, health-checked by the directory.
    pub async fn register_service(&self, reg: &ServiceRegistration) -> Result<()> {
        let resp = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(reg)
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "registering service")?;
        Self::expect_ok(resp, "register").await?;
        Ok(())
    }

    /// Remove a service registration.
    pub async fn deregister_service(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{id}")))
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "deregistering service")?;
        Self::expect_ok(resp, "deregister").await?;
        Ok(())
    }

    /// List the passing instances of the service.
    ///
    /// With `index`, this is a blocking query: the directory holds the
    /// request until the result changes or [WATCH_WAIT] passes. Returns the
    /// entries and the index to resume watching from.
    pub async fn passing_services(
        &self,
        name: &str,
        index: Option<u64>,
    ) -> Result<(Vec<HealthEntry>, u64)> {
        let mut url = format!("{}?passing=true", self.url(&format!("/v1/health/service/{name}")));
        if let Some(index) = index {
            url.push_str(&format!("&index={}&wait={}s", index, WATCH_WAIT.as_secs()));
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "querying service health")?;
        let resp = Self::expect_ok(resp, "health query").await?;
        let next_index = consul_index(&resp);
        let entries: Vec<HealthEntry> = resp
            .json()
            .await
            .or_err(ErrorType::DirectoryError, "decoding health entries")?;
        Ok((entries, next_index))
    }

    /// Store a value under the key.
    pub async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}")))
            .body(value.to_vec())
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "writing KV pair")?;
        Self::expect_ok(resp, "kv put").await?;
        Ok(())
    }

    /// Read the value stored under the key, `None` when absent.
    pub async fn kv_get(&self, key: &str) -> Result<Option<KvPair>> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/kv/{key}")))
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "reading KV pair")?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::expect_ok(resp, "kv get").await?;
        let mut raw: Vec<RawKvPair> = resp
            .json()
            .await
            .or_err(ErrorType::DirectoryError, "decoding KV pair")?;
        match raw.pop() {
            Some(pair) => Ok(Some(pair.decode()?)),
            None => Ok(None),
        }
    }

    /// Delete the key.
    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/kv/{key}")))
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "deleting KV pair")?;
        Self::expect_ok(resp, "kv delete").await?;
        Ok(())
    }

    /// List every pair under the prefix, optionally as a blocking query.
    pub async fn kv_list(
        &self,
        prefix: &str,
        index: Option<u64>,
    ) -> Result<(Vec<KvPair>, u64)> {
        let mut url = format!("{}?recurse=true", self.url(&format!("/v1/kv/{prefix}")));
        if let Some(index) = index {
            url.push_str(&format!("&index={}&wait={}s", index, WATCH_WAIT.as_secs()));
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "listing KV prefix")?;
        if resp.status().as_u16() == 404 {
            // an empty prefix still carries a fresh index
            return Ok((Vec::new(), consul_index(&resp)));
        }
        let resp = Self::expect_ok(resp, "kv list").await?;
        let next_index = consul_index(&resp);
        let raw: Vec<RawKvPair> = resp
            .json()
            .await
            .or_err(ErrorType::DirectoryError, "decoding KV prefix")?;
        let pairs = raw
            .into_iter()
            .map(RawKvPair::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok((pairs, next_index))
    }

    /// Watch a single key with a blocking query.
    pub async fn kv_watch(
        &self,
        key: &str,
        index: Option<u64>,
    ) -> Result<(Option<KvPair>, u64)> {
        let mut url = self.url(&format!("/v1/kv/{key}"));
        if let Some(index) = index {
            url.push_str(&format!("?index={}&wait={}s", index, WATCH_WAIT.as_secs()));
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "watching KV pair")?;
        if resp.status().as_u16() == 404 {
            return Ok((None, consul_index(&resp)));
        }
        let resp = Self::expect_ok(resp, "kv watch").await?;
        let next_index = consul_index(&resp);
        let mut raw: Vec<RawKvPair> = resp
            .json()
            .await
            .or_err(ErrorType::DirectoryError, "decoding KV pair")?;
        let pair = match raw.pop() {
            Some(pair) => Some(pair.decode()?),
            None => None,
        };
        Ok((pair, next_index))
    }

    /// Create a session with the given TTL. The session deletes its held
    /// keys when it is invalidated (`Behavior: delete`), which is what gives
    /// lock keys their linger-then-vanish lifecycle.
    pub async fn session_create(&self, name: &str, ttl: Duration) -> Result<String> {
        let body = SessionRequest {
            name: name.to_string(),
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "delete".to_string(),
        };
        let resp = self
            .client
            .put(self.url("/v1/session/create"))
            .json(&body)
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "creating session")?;
        let resp = Self::expect_ok(resp, "session create").await?;
        let reply: SessionReply = resp
            .json()
            .await
            .or_err(ErrorType::DirectoryError, "decoding session")?;
        Ok(reply.id)
    }

    /// Destroy a session. Keys held by it are deleted by the directory.
    pub async fn session_destroy(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/session/destroy/{id}")))
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "destroying session")?;
        Self::expect_ok(resp, "session destroy").await?;
        Ok(())
    }

    /// Try to acquire the key for the session. `Ok(false)` means another
    /// session holds it.
    pub async fn kv_acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}?acquire={session}")))
            .body(value.to_vec())
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "acquiring lock key")?;
        let resp = Self::expect_ok(resp, "kv acquire").await?;
        let body = resp
            .text()
            .await
            .or_err(ErrorType::DirectoryError, "reading acquire answer")?;
        Ok(body.trim() == "true")
    }

    /// Release the key held by the session. The key itself stays behind
    /// until the session goes away.
    pub async fn kv_release(&self, key: &str, session: &str) -> Result<bool> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}?release={session}")))
            .send()
            .await
            .or_err(ErrorType::DirectoryError, "releasing lock key")?;
        let resp = Self::expect_ok(resp, "kv release").await?;
        let body = resp
            .text()
            .await
            .or_err(ErrorType::DirectoryError, "reading release answer")?;
        Ok(body.trim() == "true")
    }
}

// Pull the watch index out of the `X-Consul-Index` answer header.
fn consul_index(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get("X-Consul-Index")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
