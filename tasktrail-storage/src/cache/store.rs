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

//! Caches kept in the shared persistence backend, so several pipeline
//! instances see the same tasks and orphans. Entries expire by TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tasktrail_core::{Task, TaskUpdate};

use super::{OrphanCache, TaskCache};
use crate::persistence::PersistenceBackend;

const TASK_KEY_PREFIX: &str = "task_cache#";
const ORPHAN_KEY_PREFIX: &str = "orphan_cache#";

fn keys(prefix: &str, ids: &[String]) -> Vec<String> {
    ids.iter().map(|id| format!("{}{}", prefix, id)).collect()
}

pub struct StoreTaskCache {
    backend: Arc<dyn PersistenceBackend>,
    ttl: Option<Duration>,
}

impl StoreTaskCache {
    pub fn new(backend: Arc<dyn PersistenceBackend>, ttl: Option<Duration>) -> Self {
        Self { backend, ttl }
    }
}

impl TaskCache for StoreTaskCache {
    fn get_many(&self, ids: &[String]) -> HashMap<String, Task> {
        let stored = match self.backend.get_from_store(&keys(TASK_KEY_PREFIX, ids)) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Task cache lookup failed, treating as miss");
                return HashMap::new();
            }
        };
        ids.iter()
            .filter_map(|id| {
                let bytes = stored.get(&format!("{}{}", TASK_KEY_PREFIX, id))?;
                match serde_json::from_slice::<Task>(bytes) {
                    Ok(task) => Some((id.clone(), task)),
                    Err(e) => {
                        tracing::warn!(task_id = %id, error = %e, "Unreadable cached task");
                        None
                    }
                }
            })
            .collect()
    }

    fn put_many(&self, tasks: &HashMap<String, Task>) {
        let ids: Vec<String> = tasks.keys().cloned().collect();
        let mut existing = self.get_many(&ids);
        for (id, task) in tasks {
            let merged = match existing.remove(id) {
                Some(mut cached) => {
                    cached.apply(&TaskUpdate::from_task(id.clone(), task));
                    cached
                }
                None => task.clone(),
            };
            let result = serde_json::to_vec(&merged.cache_projection())
                .map_err(crate::StorageError::from)
                .and_then(|bytes| {
                    self.backend
                        .put_to_store(&format!("{}{}", TASK_KEY_PREFIX, id), &bytes, self.ttl)
                });
            if let Err(e) = result {
                tracing::warn!(task_id = %id, error = %e, "Failed to cache task");
            }
        }
    }
}

pub struct StoreOrphanCache {
    backend: Arc<dyn PersistenceBackend>,
    ttl: Option<Duration>,
    write_lock: Mutex<()>,
}

impl StoreOrphanCache {
    pub fn new(backend: Arc<dyn PersistenceBackend>, ttl: Option<Duration>) -> Self {
        Self {
            backend,
            ttl,
            write_lock: Mutex::new(()),
        }
    }
}

impl OrphanCache for StoreOrphanCache {
    fn pull_waiting_children(&self, parent_ids: &[String]) -> HashMap<String, Vec<String>> {
        let _guard = self.write_lock.lock();
        let keys = keys(ORPHAN_KEY_PREFIX, parent_ids);
        let stored = match self.backend.get_from_store(&keys) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Orphan cache lookup failed");
                return HashMap::new();
            }
        };
        if stored.is_empty() {
            return HashMap::new();
        }
        let found_keys: Vec<String> = stored.keys().cloned().collect();
        if let Err(e) = self.backend.delete_from_store(&found_keys) {
            tracing::warn!(error = %e, "Failed to remove pulled orphan entries");
        }
        parent_ids
            .iter()
            .filter_map(|parent| {
                let bytes = stored.get(&format!("{}{}", ORPHAN_KEY_PREFIX, parent))?;
                serde_json::from_slice::<Vec<String>>(bytes)
                    .ok()
                    .map(|children| (parent.clone(), children))
            })
            .collect()
    }

    fn record_orphan(&self, parent_id: &str, child_id: &str) {
        let _guard = self.write_lock.lock();
        let key = format!("{}{}", ORPHAN_KEY_PREFIX, parent_id);
        let mut children: Vec<String> = self
            .backend
            .get_from_store(std::slice::from_ref(&key))
            .ok()
            .and_then(|mut found| found.remove(&key))
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        if children.iter().any(|c| c == child_id) {
            return;
        }
        children.push(child_id.to_string());
        let result = serde_json::to_vec(&children)
            .map_err(crate::StorageError::from)
            .and_then(|bytes| self.backend.put_to_store(&key, &bytes, self.ttl));
        if let Err(e) = result {
            tracing::warn!(parent_id, child_id, error = %e, "Failed to record orphan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryBackend;
    use chrono::Utc;
    use tasktrail_core::Event;

    #[test]
    fn test_shared_between_instances() {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());
        let writer = StoreTaskCache::new(backend.clone(), None);
        let reader = StoreTaskCache::new(backend.clone(), None);

        let task = Task::from_events(&[Event::start("t", "job", Utc::now(), None).with_log("big")]);
        writer.put_many(&HashMap::from([("t".to_string(), task.clone())]));

        let found = reader.get_many(&["t".to_string(), "missing".to_string()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found["t"], task.cache_projection());
    }

    #[test]
    fn test_orphan_pull_is_destructive() {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());
        let orphans = StoreOrphanCache::new(backend, Some(Duration::from_secs(60)));
        orphans.record_orphan("p", "a");
        orphans.record_orphan("p", "b");

        let pulled = orphans.pull_waiting_children(&["p".to_string()]);
        assert_eq!(pulled["p"], vec!["a", "b"]);
        assert!(orphans.pull_waiting_children(&["p".to_string()]).is_empty());
    }

    #[test]
    fn test_backend_failure_is_a_miss() {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(MemoryBackend::new());
        let cache = StoreTaskCache::new(backend.clone(), None);
        backend.close().unwrap();
        assert!(cache.get_many(&["t".to_string()]).is_empty());
    }
}
