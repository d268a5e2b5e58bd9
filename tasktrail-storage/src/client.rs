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

//! Document store seam.
//!
//! The indexer only needs bulk partial updates, id lookups and a place to
//! put its own metadata records. [`MemoryStorageClient`] implements the
//! same merge rules as the production store and can inject faults.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tasktrail_core::{MetadataEvent, Task, TaskUpdate};

use crate::error::{StorageError, StorageResult};

/// Partial updates for one environment, written together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bulk {
    pub env: String,
    pub updates: Vec<TaskUpdate>,
}

impl Bulk {
    pub fn new(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            updates: Vec::new(),
        }
    }

    pub fn push(&mut self, update: TaskUpdate) {
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Copy of this bulk restricted to the given task ids.
    pub fn subset(&self, task_ids: &HashSet<String>) -> Bulk {
        Bulk {
            env: self.env.clone(),
            updates: self
                .updates
                .iter()
                .filter(|u| task_ids.contains(&u.task_id))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub task_id: String,
    pub reason: String,
    /// Transient rejection (throttling, timeout) as opposed to a bad document
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub failures: Vec<ItemFailure>,
}

impl BulkResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn retryable_ids(&self) -> HashSet<String> {
        self.failures
            .iter()
            .filter(|f| f.retryable)
            .map(|f| f.task_id.clone())
            .collect()
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Apply every update of the bulk. An `Err` means nothing is known to
    /// have been written; item-level rejections come back in the response.
    async fn bulk_write(&self, bulk: &Bulk) -> StorageResult<BulkResponse>;

    /// Previously indexed tasks, by id. Unknown ids are simply absent.
    async fn fetch_by_ids(&self, env: &str, ids: &[String]) -> StorageResult<HashMap<String, Task>>;

    async fn index_metadata(&self, event: MetadataEvent) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// In-process document store.
#[derive(Default)]
pub struct MemoryStorageClient {
    tasks: DashMap<(String, String), Task>,
    metadata: Mutex<Vec<MetadataEvent>>,
    bulk_writes: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_fetches: AtomicBool,
    rejected: Mutex<HashMap<String, bool>>,
    closed: AtomicBool,
}

impl MemoryStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, env: &str, task_id: &str) -> Option<Task> {
        self.tasks
            .get(&(env.to_string(), task_id.to_string()))
            .map(|t| t.value().clone())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn metadata(&self) -> Vec<MetadataEvent> {
        self.metadata.lock().clone()
    }

    /// Number of `bulk_write` calls, failed ones included.
    pub fn bulk_write_calls(&self) -> usize {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` bulk writes as a whole.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_writes(&self) {
        self.fail_next_writes(usize::MAX);
    }

    pub fn fail_fetches(&self, failing: bool) {
        self.failing_fetches.store(failing, Ordering::SeqCst);
    }

    /// Reject every update for `task_id` at item level.
    pub fn reject_task(&self, task_id: impl Into<String>, retryable: bool) {
        self.rejected.lock().insert(task_id.into(), retryable);
    }

    pub fn heal(&self) {
        self.failing_writes.store(0, Ordering::SeqCst);
        self.failing_fetches.store(false, Ordering::SeqCst);
        self.rejected.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Unavailable("storage client closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageClient for MemoryStorageClient {
    async fn bulk_write(&self, bulk: &Bulk) -> StorageResult<BulkResponse> {
        self.ensure_open()?;
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        if self.take_write_failure() {
            return Err(StorageError::Write("injected bulk failure".into()));
        }

        let rejected = self.rejected.lock().clone();
        let mut response = BulkResponse::ok();
        for update in &bulk.updates {
            if let Some(&retryable) = rejected.get(&update.task_id) {
                response.failures.push(ItemFailure {
                    task_id: update.task_id.clone(),
                    reason: "injected item rejection".into(),
                    retryable,
                });
                continue;
            }
            self.tasks
                .entry((bulk.env.clone(), update.task_id.clone()))
                .or_default()
                .apply(update);
        }
        Ok(response)
    }

    async fn fetch_by_ids(&self, env: &str, ids: &[String]) -> StorageResult<HashMap<String, Task>> {
        self.ensure_open()?;
        if self.failing_fetches.load(Ordering::SeqCst) {
            return Err(StorageError::Fetch("injected fetch failure".into()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.task(env, id).map(|task| (id.clone(), task)))
            .collect())
    }

    async fn index_metadata(&self, event: MetadataEvent) -> StorageResult<()> {
        self.ensure_open()?;
        self.metadata.lock().push(event);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
