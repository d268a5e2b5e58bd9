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

//! In-process backend. Used by tests and as the degraded-mode fallback.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{LockInfo, LockToken, PersistenceBackend};
use crate::error::{StorageError, StorageResult};

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, BTreeSet<(i64, String)>>>,
    store: Mutex<HashMap<String, StoredValue>>,
    locks: Mutex<HashMap<String, LockInfo>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable("memory backend closed".into()));
        }
        Ok(())
    }
}

impl PersistenceBackend for MemoryBackend {
    fn push_to_queue(&self, queue: &str, member: &str, score: i64) -> StorageResult<()> {
        self.ensure_open()?;
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .insert((score, member.to_string()));
        Ok(())
    }

    fn pop_oldest(&self, queue: &str, count: usize) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let mut queues = self.queues.lock();
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::with_capacity(count.min(entries.len()));
        while popped.len() < count {
            match entries.pop_first() {
                Some((_, member)) => popped.push(member),
                None => break,
            }
        }
        Ok(popped)
    }

    fn min_score(&self, queue: &str) -> StorageResult<Option<i64>> {
        self.ensure_open()?;
        Ok(self
            .queues
            .lock()
            .get(queue)
            .and_then(|entries| entries.first().map(|(score, _)| *score)))
    }

    fn queue_size(&self, queue: &str) -> StorageResult<usize> {
        self.ensure_open()?;
        Ok(self.queues.lock().get(queue).map_or(0, BTreeSet::len))
    }

    fn get_from_store(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut store = self.store.lock();
        let mut found = HashMap::new();
        for key in keys {
            let expired = match store.get(key) {
                Some(stored) if stored.expires_at.map_or(true, |at| at > now) => {
                    found.insert(key.clone(), stored.value.clone());
                    false
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                store.remove(key);
            }
        }
        Ok(found)
    }

    fn put_to_store(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StorageResult<()> {
        self.ensure_open()?;
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        self.store.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete_from_store(&self, keys: &[String]) -> StorageResult<()> {
        self.ensure_open()?;
        let mut store = self.store.lock();
        for key in keys {
            store.remove(key);
        }
        Ok(())
    }

    fn lock(&self, name: &str, lease: Duration) -> StorageResult<Option<LockToken>> {
        self.ensure_open()?;
        let mut locks = self.locks.lock();
        if let Some(current) = locks.get(name) {
            if !current.is_expired() {
                return Ok(None);
            }
            tracing::debug!(lock = name, holder = %current.holder_id, "Taking over expired lock");
        }
        let info = LockInfo::new(lease);
        let token = LockToken::new(name, &info);
        locks.insert(name.to_string(), info);
        Ok(Some(token))
    }

    fn release(&self, token: &LockToken) -> StorageResult<()> {
        let mut locks = self.locks.lock();
        if locks
            .get(&token.name)
            .is_some_and(|info| info.holder_id == token.holder_id)
        {
            locks.remove(&token.name);
        }
        Ok(())
    }

    fn is_created_successfully(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
