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

//! The session-scoped distributed lock.
//!
//! Used to elect exactly one cluster-wide deleter per cache key. The lock
//! key doubles as the invalidation event: its value is the initiator's IP,
//! and peers watching the key prefix drop their local copies when they see
//! it. The backing session is left to expire on its own so the key lingers
//! long enough for every peer to observe it.

use std::sync::Arc;
use std::time::Duration;

use hoard_error::Result;
use log::debug;

use crate::directory::Directory;

// lock sessions are one-shot, a short TTL bounds how long the key lingers
const SESSION_TTL: Duration = Duration::from_secs(15);

/// A held distributed lock. Acquisition is try-once: contention means
/// another node is the leader for this key and the caller should skip.
pub struct DistLock {
    directory: Arc<Directory>,
    key: String,
    session: String,
}

impl DistLock {
    /// Try to take the lock on `key` once, stamping `value` (the local IP)
    /// into the lock key. `Ok(None)` when another session holds it.
    pub async fn acquire(
        directory: Arc<Directory>,
        key: &str,
        value: &str,
    ) -> Result<Option<DistLock>> {
        let session = directory.session_create(key, SESSION_TTL).await?;
        let acquired = directory
            .kv_acquire(key, value.as_bytes(), &session)
            .await?;
        if !acquired {
            debug!("lost lock election for {key}");
            directory.session_destroy(&session).await?;
            return Ok(None);
        }
        Ok(Some(DistLock {
            directory,
            key: key.to_string(),
            session,
        }))
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock.
    ///
    /// The key is only released, not deleted: the session's delete-on-expiry
    /// removes it after [SESSION_TTL], which is the linger window peers use
    /// to observe the invalidation.
    pub async fn release(self) -> Result<()> {
        self.directory.kv_release(&self.key, &self.session).await?;
        Ok(())
    }
}
