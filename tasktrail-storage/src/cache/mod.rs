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

//! Task and orphan caches.
//!
//! Both caches are advisory. A miss means "unknown" and the caller falls
//! back to the document store; a backend failure is logged and treated as
//! a miss. Concurrent writers race last-write-wins.
//!
//! ## Weight
//!
//! ```text
//! weight = 2 * (key.len() + json(value).len())
//! ```

mod local;
mod scoped;
mod store;

pub use local::{LocalOrphanCache, LocalTaskCache};
pub use scoped::{EnvOrphanCache, EnvTaskCache};
pub use store::{StoreOrphanCache, StoreTaskCache};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use tasktrail_core::config::{CacheConfig, CacheStrategy};
use tasktrail_core::Task;

use crate::persistence::PersistenceBackend;

/// Last known merge-relevant state of tasks, by id.
pub trait TaskCache: Send + Sync {
    fn get_many(&self, ids: &[String]) -> HashMap<String, Task>;

    /// Merge each task into the cached entry (or insert it).
    fn put_many(&self, tasks: &HashMap<String, Task>);
}

/// Children waiting for a parent that has not been seen yet.
pub trait OrphanCache: Send + Sync {
    /// Remove and return the waiting children of each given parent.
    fn pull_waiting_children(&self, parent_ids: &[String]) -> HashMap<String, Vec<String>>;

    fn record_orphan(&self, parent_id: &str, child_id: &str);
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub(crate) fn entry_weight<V: Serialize>(key: &str, value: &V) -> u32 {
    let json_len = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    let weight = 2usize.saturating_mul(key.len().saturating_add(json_len));
    u32::try_from(weight).unwrap_or(u32::MAX)
}

/// Build the task and orphan caches for the configured strategy.
pub fn build_caches(
    config: &CacheConfig,
    backend: Arc<dyn PersistenceBackend>,
) -> (Arc<dyn TaskCache>, Arc<dyn OrphanCache>) {
    match config.strategy {
        CacheStrategy::Local => (
            Arc::new(LocalTaskCache::new(config.task_max_weight_bytes, config.ttl())),
            Arc::new(LocalOrphanCache::new(config.orphan_max_weight_bytes, config.ttl())),
        ),
        CacheStrategy::Store => (
            Arc::new(StoreTaskCache::new(backend.clone(), config.ttl())),
            Arc::new(StoreOrphanCache::new(backend, config.ttl())),
        ),
    }
}
