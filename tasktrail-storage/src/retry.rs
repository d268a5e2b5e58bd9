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

//! Persistent retry store.
//!
//! Two durable queues share one backend:
//! - failed bulks, retried until `max_insert_tries`,
//! - overflowed event lists, re-injected into intake.
//!
//! Both are drained under a per-queue lease so only one pipeline instance
//! retries a given entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tasktrail_core::config::RetryConfig;
use tasktrail_core::Event;

use crate::client::Bulk;
use crate::error::StorageResult;
use crate::persistence::{DurableQueue, PersistenceBackend};

pub const FAILED_BULKS_QUEUE: &str = "failed_bulks_queue";
pub const FAILED_BULKS_PREFIX: &str = "failed_bulk";
pub const FAILED_BULKS_LOCK: &str = "failed_bulks_lock";
pub const OVERFLOW_QUEUE: &str = "overflowed_events_queue";
pub const OVERFLOW_PREFIX: &str = "overflow_events";
pub const OVERFLOW_LOCK: &str = "overflowed_events_lock";

/// A bulk that could not be written, waiting to be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbBulkRequest {
    pub bulk: Bulk,
    /// How many times the entry has been fetched for retry
    pub times_fetched: u32,
    pub insert_time: DateTime<Utc>,
}

impl DbBulkRequest {
    pub fn new(bulk: Bulk) -> Self {
        Self {
            bulk,
            times_fetched: 0,
            insert_time: Utc::now(),
        }
    }
}

pub struct RetryStore {
    backend: Arc<dyn PersistenceBackend>,
    failed_bulks: DurableQueue<DbBulkRequest>,
    overflow: DurableQueue<Vec<Event>>,
}

impl RetryStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: &RetryConfig) -> Self {
        Self::with_lease(backend, config.lock_lease())
    }

    pub fn with_lease(backend: Arc<dyn PersistenceBackend>, lease: Duration) -> Self {
        Self {
            failed_bulks: DurableQueue::new(
                backend.clone(),
                FAILED_BULKS_QUEUE,
                FAILED_BULKS_PREFIX,
                FAILED_BULKS_LOCK,
                lease,
            ),
            overflow: DurableQueue::new(
                backend.clone(),
                OVERFLOW_QUEUE,
                OVERFLOW_PREFIX,
                OVERFLOW_LOCK,
                lease,
            ),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    pub fn persist_bulk(&self, request: &DbBulkRequest) -> StorageResult<()> {
        self.failed_bulks.push(request)?;
        tracing::debug!(
            env = %request.bulk.env,
            updates = request.bulk.len(),
            times_fetched = request.times_fetched,
            "Persisted failed bulk"
        );
        Ok(())
    }

    /// Fetch failed bulks for retry, bumping each entry's fetch counter.
    pub fn fetch_failed_bulks(&self, max: usize, min_dwell: Duration) -> StorageResult<Vec<DbBulkRequest>> {
        let mut requests = self.failed_bulks.fetch(max, min_dwell)?;
        for request in &mut requests {
            request.times_fetched += 1;
        }
        if !requests.is_empty() {
            tracing::info!(count = requests.len(), "Fetched failed bulks");
        }
        Ok(requests)
    }

    pub fn persist_overflow(&self, events: &[Event]) -> StorageResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.overflow.push(&events.to_vec())?;
        tracing::debug!(events = events.len(), "Persisted overflowed events");
        Ok(())
    }

    pub fn fetch_overflow(&self, max: usize, min_dwell: Duration) -> StorageResult<Vec<Vec<Event>>> {
        let lists = self.overflow.fetch(max, min_dwell)?;
        if !lists.is_empty() {
            tracing::info!(lists = lists.len(), "Fetched overflowed event lists");
        }
        Ok(lists)
    }

    pub fn failed_bulks_amount(&self) -> StorageResult<usize> {
        self.failed_bulks.size()
    }

    pub fn overflow_lists_amount(&self) -> StorageResult<usize> {
        self.overflow.size()
    }

    pub fn has_failed_bulks(&self) -> StorageResult<bool> {
        Ok(self.failed_bulks_amount()? > 0)
    }

    /// Empty both queues.
    pub fn reset(&self) -> StorageResult<()> {
        let bulks = self.failed_bulks.reset()?;
        let lists = self.overflow.reset()?;
        tracing::info!(bulks, lists, "Reset retry store");
        Ok(())
    }

    pub fn is_created_successfully(&self) -> bool {
        self.backend.is_created_successfully()
    }

    pub fn close(&self) -> StorageResult<()> {
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{FileBackend, MemoryBackend};
    use tasktrail_core::TaskUpdate;
    use tempfile::TempDir;

    fn sample_bulk(n: usize) -> Bulk {
        let mut bulk = Bulk::new("default");
        for i in 0..n {
            bulk.push(TaskUpdate::from_event(&Event::start(
                format!("t{}", i),
                "job",
                Utc::now(),
                None,
            )));
        }
        bulk
    }

    fn store() -> RetryStore {
        RetryStore::with_lease(Arc::new(MemoryBackend::new()), Duration::from_secs(20))
    }

    #[test]
    fn test_fetch_counts_and_refetch_increments() {
        let store = store();
        store.persist_bulk(&DbBulkRequest::new(sample_bulk(2))).unwrap();

        let fetched = store.fetch_failed_bulks(10, Duration::ZERO).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].times_fetched, 1);
        assert!(!store.has_failed_bulks().unwrap());

        store.persist_bulk(&fetched[0]).unwrap();
        let again = store.fetch_failed_bulks(10, Duration::ZERO).unwrap();
        assert_eq!(again[0].times_fetched, 2);
        assert_eq!(again[0].bulk, fetched[0].bulk);
    }

    #[test]
    fn test_fetch_respects_max() {
        let store = store();
        for _ in 0..5 {
            store.persist_bulk(&DbBulkRequest::new(sample_bulk(1))).unwrap();
        }
        assert_eq!(store.failed_bulks_amount().unwrap(), 5);
        assert_eq!(store.fetch_failed_bulks(3, Duration::ZERO).unwrap().len(), 3);
        assert_eq!(store.failed_bulks_amount().unwrap(), 2);
    }

    #[test]
    fn test_overflow_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let events = vec![
            Event::start("p", "parent", Utc::now(), None).with_context("k", "v"),
            Event::start("c", "child", Utc::now(), Some("p".into())).with_metric("m", 1.5),
        ];
        {
            let store = RetryStore::with_lease(
                Arc::new(FileBackend::open(dir.path()).unwrap()),
                Duration::from_secs(20),
            );
            store.persist_overflow(&events).unwrap();
            assert_eq!(store.overflow_lists_amount().unwrap(), 1);
        }

        let store = RetryStore::with_lease(
            Arc::new(FileBackend::open(dir.path()).unwrap()),
            Duration::from_secs(20),
        );
        let lists = store.fetch_overflow(10, Duration::ZERO).unwrap();
        assert_eq!(lists, vec![events]);
    }

    #[test]
    fn test_reset_clears_both_queues() {
        let store = store();
        store.persist_bulk(&DbBulkRequest::new(sample_bulk(1))).unwrap();
        store
            .persist_overflow(&[Event::info("x", Utc::now())])
            .unwrap();
        store.reset().unwrap();
        assert_eq!(store.failed_bulks_amount().unwrap(), 0);
        assert_eq!(store.overflow_lists_amount().unwrap(), 0);
    }
}
