// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Lease locks.
//!
//! A lease carries an expiry so a crashed holder cannot keep a queue locked
//! forever. Whoever finds an expired lease may take it over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PersistenceBackend;

/// Lease record, stored as JSON by the file backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,

    pub acquired_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(lease: Duration) -> Self {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            holder_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + lease,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Proof of holding a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LockToken {
    pub name: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(name: &str, info: &LockInfo) -> Self {
        Self {
            name: name.to_string(),
            holder_id: info.holder_id.clone(),
            expires_at: info.expires_at,
        }
    }
}

/// Releases its lease when dropped, on every exit path.
pub struct LockGuard {
    backend: Arc<dyn PersistenceBackend>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// `Ok(None)` when the lease is held elsewhere.
    pub fn try_acquire(
        backend: Arc<dyn PersistenceBackend>,
        name: &str,
        lease: Duration,
    ) -> crate::StorageResult<Option<Self>> {
        let token = backend.lock(name, lease)?;
        Ok(token.map(|token| Self {
            backend,
            token: Some(token),
        }))
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    pub fn release(mut self) -> crate::StorageResult<()> {
        match self.token.take() {
            Some(token) => self.backend.release(&token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.backend.release(&token) {
                tracing::warn!(lock = %token.name, error = %e, "Failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryBackend;

    #[test]
    fn test_guard_releases_on_drop() {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());
        {
            let guard = LockGuard::try_acquire(backend.clone(), "q", Duration::from_secs(20))
                .unwrap()
                .expect("lock should be free");
            assert!(guard.token().is_some());
            assert!(LockGuard::try_acquire(backend.clone(), "q", Duration::from_secs(20))
                .unwrap()
                .is_none());
        }
        assert!(LockGuard::try_acquire(backend, "q", Duration::from_secs(20))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_lease_expiry() {
        let info = LockInfo::new(Duration::ZERO);
        assert!(info.is_expired());
        assert!(!LockInfo::new(Duration::from_secs(60)).is_expired());
    }
}
