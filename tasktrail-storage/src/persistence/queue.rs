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

//! Typed durable queue over a [`PersistenceBackend`].
//!
//! Each item is stored under `<prefix>#<score>#<uuid>` and the key is pushed
//! onto a scored queue with the insertion time as score, so draining is
//! oldest first. The score in the key lets a pop that cannot read its
//! payloads put the keys back where they were.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{now_score, LockGuard, PersistenceBackend};
use crate::error::StorageResult;

const RESET_CHUNK: usize = 1_000;

pub struct DurableQueue<T> {
    backend: Arc<dyn PersistenceBackend>,
    queue: String,
    key_prefix: String,
    lock_name: String,
    lock_lease: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        queue: impl Into<String>,
        key_prefix: impl Into<String>,
        lock_name: impl Into<String>,
        lock_lease: Duration,
    ) -> Self {
        Self {
            backend,
            queue: queue.into(),
            key_prefix: key_prefix.into(),
            lock_name: lock_name.into(),
            lock_lease,
            _item: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    pub fn push(&self, item: &T) -> StorageResult<()> {
        let score = now_score();
        let key = format!("{}#{}#{}", self.key_prefix, score, Uuid::new_v4());
        let payload = bincode::serialize(item)?;
        // Value first: a popped member must always find its payload.
        self.backend.put_to_store(&key, &payload, None)?;
        if let Err(e) = self.backend.push_to_queue(&self.queue, &key, score) {
            let _ = self.backend.delete_from_store(std::slice::from_ref(&key));
            return Err(e);
        }
        Ok(())
    }

    /// Remove and return up to `count` of the oldest items.
    ///
    /// If the payloads cannot be read the keys go back on the queue with
    /// their original scores. A failed payload cleanup only leaves garbage
    /// behind, so the items are still returned.
    pub fn pop_oldest(&self, count: usize) -> StorageResult<Vec<T>> {
        let keys = self.backend.pop_oldest(&self.queue, count)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut values = match self.backend.get_from_store(&keys) {
            Ok(values) => values,
            Err(e) => {
                self.requeue(&keys);
                return Err(e);
            }
        };
        let mut items = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(bytes) = values.remove(key) else {
                tracing::warn!(queue = %self.queue, key = %key, "Queue entry without payload");
                continue;
            };
            match bincode::deserialize(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::error!(queue = %self.queue, key = %key, error = %e, "Dropping undecodable queue entry")
                }
            }
        }
        if let Err(e) = self.backend.delete_from_store(&keys) {
            tracing::warn!(queue = %self.queue, keys = keys.len(), error = %e, "Failed to delete popped payloads");
        }
        Ok(items)
    }

    fn requeue(&self, keys: &[String]) {
        for key in keys {
            let score = score_of(key).unwrap_or_else(now_score);
            if let Err(e) = self.backend.push_to_queue(&self.queue, key, score) {
                tracing::error!(queue = %self.queue, key = %key, error = %e, "Could not requeue entry, payload orphaned");
            }
        }
    }

    /// Locked fetch used by retry workers.
    ///
    /// Returns nothing when another instance holds the queue lock, or when
    /// the oldest entry is younger than `min_dwell`.
    pub fn fetch(&self, max: usize, min_dwell: Duration) -> StorageResult<Vec<T>> {
        let Some(guard) =
            LockGuard::try_acquire(self.backend.clone(), &self.lock_name, self.lock_lease)?
        else {
            tracing::debug!(queue = %self.queue, "Queue locked by another instance, skipping fetch");
            return Ok(Vec::new());
        };

        if !min_dwell.is_zero() {
            let oldest = self.backend.min_score(&self.queue)?;
            let dwell_ms = i64::try_from(min_dwell.as_millis()).unwrap_or(i64::MAX);
            match oldest {
                Some(score) if now_score().saturating_sub(score) >= dwell_ms => {}
                _ => return Ok(Vec::new()),
            }
        }

        let items = self.pop_oldest(max)?;
        guard.release()?;
        Ok(items)
    }

    pub fn size(&self) -> StorageResult<usize> {
        self.backend.queue_size(&self.queue)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn reset(&self) -> StorageResult<usize> {
        let mut removed = 0;
        loop {
            let keys = self.backend.pop_oldest(&self.queue, RESET_CHUNK)?;
            if keys.is_empty() {
                break;
            }
            removed += keys.len();
            self.backend.delete_from_store(&keys)?;
        }
        Ok(removed)
    }
}

/// Push score embedded in a `<prefix>#<score>#<uuid>` key.
fn score_of(key: &str) -> Option<i64> {
    let mut parts = key.rsplitn(3, '#');
    parts.next()?;
    parts.next()?.parse().ok()
}
