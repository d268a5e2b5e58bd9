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

//! In-process caches bounded by approximate byte weight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;

use tasktrail_core::{Task, TaskUpdate};

use super::{entry_weight, CacheStats, OrphanCache, TaskCache};

fn bounded_cache<V>(max_weight_bytes: u64, ttl: Option<Duration>) -> Cache<String, V>
where
    V: Clone + Send + Sync + serde::Serialize + 'static,
{
    let builder = Cache::builder()
        .max_capacity(max_weight_bytes)
        .weigher(|key: &String, value: &V| entry_weight(key, value))
        .eviction_policy(EvictionPolicy::lru());
    match ttl {
        Some(ttl) => builder.time_to_live(ttl).build(),
        None => builder.build(),
    }
}

pub struct LocalTaskCache {
    cache: Cache<String, Task>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalTaskCache {
    pub fn new(max_weight_bytes: u64, ttl: Option<Duration>) -> Self {
        Self {
            cache: bounded_cache(max_weight_bytes, ttl),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Run pending evictions now instead of lazily.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl TaskCache for LocalTaskCache {
    fn get_many(&self, ids: &[String]) -> HashMap<String, Task> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.cache.get(id) {
                Some(task) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(id.clone(), task);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        found
    }

    fn put_many(&self, tasks: &HashMap<String, Task>) {
        for (id, task) in tasks {
            let merged = match self.cache.get(id) {
                Some(mut cached) => {
                    cached.apply(&TaskUpdate::from_task(id.clone(), task));
                    cached
                }
                None => task.clone(),
            };
            self.cache.insert(id.clone(), merged.cache_projection());
        }
    }
}

pub struct LocalOrphanCache {
    cache: Cache<String, Vec<String>>,
    // Serialises read-modify-write of the waiting lists.
    write_lock: Mutex<()>,
}

impl LocalOrphanCache {
    pub fn new(max_weight_bytes: u64, ttl: Option<Duration>) -> Self {
        Self {
            cache: bounded_cache(max_weight_bytes, ttl),
            write_lock: Mutex::new(()),
        }
    }

    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn waiting_parents(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl OrphanCache for LocalOrphanCache {
    fn pull_waiting_children(&self, parent_ids: &[String]) -> HashMap<String, Vec<String>> {
        let _guard = self.write_lock.lock();
        parent_ids
            .iter()
            .filter_map(|parent| {
                self.cache
                    .remove(parent)
                    .map(|children| (parent.clone(), children))
            })
            .collect()
    }

    fn record_orphan(&self, parent_id: &str, child_id: &str) {
        let _guard = self.write_lock.lock();
        let mut children = self.cache.get(parent_id).unwrap_or_default();
        if !children.iter().any(|c| c == child_id) {
            children.push(child_id.to_string());
            self.cache.insert(parent_id.to_string(), children);
        }
    }
}
