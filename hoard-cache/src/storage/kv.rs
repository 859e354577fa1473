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

//! The external key-value (Redis) backend.
//!
//! Writes buffer locally; closing sets the key in the external store with
//! an expiry matching the entry's. The store owns eviction from there on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_error::{Error, ErrorType, OrErr, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{Backend, BodyReader, CompleteReader};

// one shared multiplexed connection for the whole process
static KV_CLIENT: OnceCell<ConnectionManager> = OnceCell::new();

/// Connection settings for the external store: `addr [db [password]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSettings {
    pub addr: String,
    pub db: i64,
    pub password: Option<String>,
}

impl KvSettings {
    fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}/{}", password, self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

/// Parse the space-separated `addr [db [password]]` connection string.
pub fn parse_kv_settings(setting: &str) -> Result<KvSettings> {
    let mut parts = setting.split_whitespace();
    let addr = parts
        .next()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::explain(ErrorType::InternalError, "empty redis setting"))?
        .to_string();
    let db = match parts.next() {
        Some(db) => db
            .parse()
            .or_err(ErrorType::InternalError, "parsing redis db index")?,
        None => 0,
    };
    let password = parts.next().map(|p| p.to_string());
    Ok(KvSettings { addr, db, password })
}

/// Connect the process-wide client. Called once during provision; later
/// calls against the same settings are no-ops.
pub async fn init_kv_client(settings: &KvSettings) -> Result<()> {
    if KV_CLIENT.get().is_some() {
        return Ok(());
    }
    let client = redis::Client::open(settings.url())
        .or_err(ErrorType::LookupError, "opening redis client")?;
    let mut manager = ConnectionManager::new(client)
        .await
        .or_err(ErrorType::LookupError, "connecting to redis")?;
    let _: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .or_err(ErrorType::LookupError, "pinging redis")?;
    // a racing provision may have won; both hold the same settings
    let _ = KV_CLIENT.set(manager);
    Ok(())
}

fn client() -> Result<ConnectionManager> {
    KV_CLIENT
        .get()
        .cloned()
        .ok_or_else(|| Error::explain(ErrorType::InternalError, "redis client not provisioned"))
}

/// Body storage in the external key-value store.
pub struct KvBackend {
    key: String,
    expiration: SystemTime,
    buf: Mutex<Vec<u8>>,
    written: AtomicUsize,
}

impl KvBackend {
    /// `key` is the effective storage key; `expiration` becomes the
    /// server-side TTL at close time.
    pub fn new(key: &str, expiration: SystemTime) -> Self {
        KvBackend {
            key: key.to_string(),
            expiration,
            buf: Mutex::new(Vec::new()),
            written: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Backend for KvBackend {
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
        let ttl = self
            .expiration
            .duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .max(1);
        let mut conn = client()?;
        conn.set_ex::<_, _, ()>(&self.key, body, ttl)
            .await
            .or_err(ErrorType::WriteError, "storing body in redis")
    }

    async fn clean(&self) -> Result<()> {
        let mut conn = client()?;
        conn.del::<_, ()>(&self.key)
            .await
            .or_err(ErrorType::WriteError, "deleting body from redis")
    }

    async fn get_reader(&self) -> Result<BodyReader> {
        let mut conn = client()?;
        let body: Option<Vec<u8>> = conn
            .get(&self.key)
            .await
            .or_err(ErrorType::ReadError, "fetching body from redis")?;
        match body {
            Some(body) => Ok(Box::new(CompleteReader::new(Bytes::from(body)))),
            None => Error::e_explain(ErrorType::LookupError, "key expired from redis"),
        }
    }

    fn length(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}
