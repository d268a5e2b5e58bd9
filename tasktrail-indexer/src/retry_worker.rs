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

//! Background re-delivery of failed bulks and overflowed events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::random;
use tokio_util::sync::CancellationToken;

use tasktrail_core::config::RetryConfig;
use tasktrail_core::Event;
use tasktrail_storage::{DbBulkRequest, RetryStore, StorageClient};

use crate::blocking::run_blocking;
use crate::intake::IntakeQueue;

const INTERVAL_JITTER: f64 = 0.1;

#[derive(Debug, Default)]
struct Counters {
    bulks_written: AtomicU64,
    bulks_requeued: AtomicU64,
    bulks_dead_lettered: AtomicU64,
    events_reinjected: AtomicU64,
    events_requeued: AtomicU64,
}

/// Retry counters, cumulative or for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub bulks_written: u64,
    pub bulks_requeued: u64,
    pub bulks_dead_lettered: u64,
    pub events_reinjected: u64,
    pub events_requeued: u64,
}

pub struct RetryWorker {
    storage: Arc<dyn StorageClient>,
    retry_store: Arc<RetryStore>,
    intake: IntakeQueue,
    config: RetryConfig,
    running: AtomicBool,
    counters: Counters,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryWorker {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        retry_store: Arc<RetryStore>,
        intake: IntakeQueue,
        config: RetryConfig,
    ) -> Self {
        Self {
            storage,
            retry_store,
            intake,
            config,
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            bulks_written: self.counters.bulks_written.load(Ordering::Relaxed),
            bulks_requeued: self.counters.bulks_requeued.load(Ordering::Relaxed),
            bulks_dead_lettered: self.counters.bulks_dead_lettered.load(Ordering::Relaxed),
            events_reinjected: self.counters.events_reinjected.load(Ordering::Relaxed),
            events_requeued: self.counters.events_requeued.load(Ordering::Relaxed),
        }
    }

    /// Run until cancelled, one round per (jittered) retry interval.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.config.interval_secs, "Retry worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(jittered(self.config.interval())) => {}
            }
            self.run_once().await;
        }
        tracing::info!("Retry worker stopped");
    }

    /// One retry round. `None` when another round is still in progress.
    pub async fn run_once(&self) -> Option<RetryStats> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Retry round already in progress, skipping");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let mut round = RetryStats::default();
        self.retry_failed_bulks(&mut round).await;
        self.reinject_overflow(&mut round).await;

        self.counters.bulks_written.fetch_add(round.bulks_written, Ordering::Relaxed);
        self.counters.bulks_requeued.fetch_add(round.bulks_requeued, Ordering::Relaxed);
        self.counters
            .bulks_dead_lettered
            .fetch_add(round.bulks_dead_lettered, Ordering::Relaxed);
        self.counters
            .events_reinjected
            .fetch_add(round.events_reinjected, Ordering::Relaxed);
        self.counters.events_requeued.fetch_add(round.events_requeued, Ordering::Relaxed);
        Some(round)
    }

    /// Keeps fetching while every fetched bulk goes through.
    async fn retry_failed_bulks(&self, round: &mut RetryStats) {
        loop {
            let store = self.retry_store.clone();
            let (max, dwell) = (self.config.max_fetched_bulks, self.config.min_dwell());
            let requests = match run_blocking(move || store.fetch_failed_bulks(max, dwell)).await {
                Ok(requests) => requests,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to fetch failed bulks");
                    return;
                }
            };
            if requests.is_empty() {
                return;
            }

            let mut all_written = true;
            for request in requests {
                match self.storage.bulk_write(&request.bulk).await {
                    Ok(response) if response.is_success() => {
                        round.bulks_written += 1;
                    }
                    Ok(response) => {
                        all_written = false;
                        for failure in response.failures.iter().filter(|f| !f.retryable) {
                            tracing::error!(
                                env = %request.bulk.env,
                                task_id = %failure.task_id,
                                reason = %failure.reason,
                                "Update rejected on retry"
                            );
                        }
                        let retryable = response.retryable_ids();
                        if !retryable.is_empty() {
                            let remaining = DbBulkRequest {
                                bulk: request.bulk.subset(&retryable),
                                ..request
                            };
                            self.requeue_or_drop(remaining, round).await;
                        }
                    }
                    Err(e) => {
                        all_written = false;
                        tracing::warn!(
                            env = %request.bulk.env,
                            times_fetched = request.times_fetched,
                            error = %e,
                            "Retried bulk failed"
                        );
                        self.requeue_or_drop(request, round).await;
                    }
                }
            }
            if !all_written {
                return;
            }
        }
    }

    async fn requeue_or_drop(&self, request: DbBulkRequest, round: &mut RetryStats) {
        if request.times_fetched >= self.config.max_insert_tries {
            round.bulks_dead_lettered += 1;
            tracing::error!(
                env = %request.bulk.env,
                updates = request.bulk.len(),
                tries = request.times_fetched,
                inserted_at = %request.insert_time,
                "Giving up on bulk after max insert tries"
            );
            return;
        }
        let env = request.bulk.env.clone();
        let updates = request.bulk.len();
        let store = self.retry_store.clone();
        match run_blocking(move || store.persist_bulk(&request)).await {
            Ok(()) => round.bulks_requeued += 1,
            Err(e) => tracing::error!(
                env = %env,
                updates,
                error = %e,
                "Could not requeue failed bulk, updates lost"
            ),
        }
    }

    async fn reinject_overflow(&self, round: &mut RetryStats) {
        let store = self.retry_store.clone();
        let (max, dwell) = (self.config.max_fetched_overflow, self.config.min_dwell());
        let lists = match run_blocking(move || store.fetch_overflow(max, dwell)).await {
            Ok(lists) => lists,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch overflowed events");
                return;
            }
        };

        for events in lists {
            let mut leftover: Vec<Event> = Vec::new();
            for event in events {
                if !leftover.is_empty() {
                    leftover.push(event);
                    continue;
                }
                match self.intake.try_enqueue(event) {
                    Ok(()) => round.events_reinjected += 1,
                    Err(event) => leftover.push(event),
                }
            }
            if leftover.is_empty() {
                continue;
            }
            let count = leftover.len();
            round.events_requeued += count as u64;
            tracing::warn!(events = count, "Intake full, returning events to overflow queue");
            let store = self.retry_store.clone();
            if let Err(e) = run_blocking(move || store.persist_overflow(&leftover)).await {
                tracing::error!(error = %e, events = count, "Could not requeue overflowed events, events lost");
            }
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    let factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * INTERVAL_JITTER;
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tasktrail_core::config::IntakeConfig;
    use tasktrail_core::{Event, TaskUpdate};
    use tasktrail_storage::{Bulk, MemoryBackend, MemoryStorageClient};

    use crate::intake::{self, IntakeReceiver};

    struct Fixture {
        storage: Arc<MemoryStorageClient>,
        retry_store: Arc<RetryStore>,
        worker: RetryWorker,
        rx: IntakeReceiver,
    }

    fn fixture(intake_capacity: usize, max_insert_tries: u32) -> Fixture {
        let storage = Arc::new(MemoryStorageClient::new());
        let retry_store = Arc::new(RetryStore::with_lease(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(5),
        ));
        let (queue, rx) = intake::channel(&IntakeConfig {
            capacity: intake_capacity,
            overflow_capacity: 1,
        });
        let config = RetryConfig {
            max_insert_tries,
            ..RetryConfig::default()
        };
        let worker = RetryWorker::new(storage.clone(), retry_store.clone(), queue, config);
        Fixture {
            storage,
            retry_store,
            worker,
            rx,
        }
    }

    fn failed_bulk(ids: &[&str]) -> DbBulkRequest {
        let mut bulk = Bulk::new("default");
        for id in ids {
            bulk.push(TaskUpdate::from_event(&Event::start(*id, "job", Utc::now(), None)));
        }
        DbBulkRequest::new(bulk)
    }

    #[tokio::test]
    async fn test_failed_bulk_is_written_on_retry() {
        let f = fixture(10, 3);
        f.retry_store.persist_bulk(&failed_bulk(&["a", "b"])).unwrap();

        let round = f.worker.run_once().await.unwrap();
        assert_eq!(round.bulks_written, 1);
        assert!(f.storage.task("default", "a").is_some());
        assert!(!f.retry_store.has_failed_bulks().unwrap());
    }

    #[tokio::test]
    async fn test_bulk_is_dropped_after_max_insert_tries() {
        let f = fixture(10, 3);
        f.storage.fail_all_writes();
        f.retry_store.persist_bulk(&failed_bulk(&["a"])).unwrap();

        for _ in 0..2 {
            let round = f.worker.run_once().await.unwrap();
            assert_eq!(round.bulks_requeued, 1);
        }
        let round = f.worker.run_once().await.unwrap();
        assert_eq!(round.bulks_dead_lettered, 1);
        assert_eq!(f.storage.bulk_write_calls(), 3);
        assert!(!f.retry_store.has_failed_bulks().unwrap());

        assert_eq!(f.worker.stats().bulks_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_retryable_item_failures_are_requeued_alone() {
        let f = fixture(10, 3);
        f.storage.reject_task("b", true);
        f.retry_store.persist_bulk(&failed_bulk(&["a", "b"])).unwrap();

        let round = f.worker.run_once().await.unwrap();
        assert_eq!(round.bulks_requeued, 1);
        let requeued = f
            .retry_store
            .fetch_failed_bulks(10, Duration::ZERO)
            .unwrap();
        assert_eq!(requeued[0].bulk.updates.len(), 1);
        assert_eq!(requeued[0].bulk.updates[0].task_id, "b");
        assert_eq!(requeued[0].times_fetched, 2);
    }

    #[tokio::test]
    async fn test_overflow_is_reinjected_and_leftovers_requeued() {
        let mut f = fixture(2, 3);
        let events: Vec<Event> = ["a", "b", "c"]
            .iter()
            .map(|id| Event::info(*id, Utc::now()))
            .collect();
        f.retry_store.persist_overflow(&events).unwrap();

        let round = f.worker.run_once().await.unwrap();
        assert_eq!(round.events_reinjected, 2);
        assert_eq!(round.events_requeued, 1);
        assert_eq!(f.rx.drain(10).len(), 2);

        let lists = f.retry_store.fetch_overflow(10, Duration::ZERO).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0][0].task_id, "c");
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_secs(60));
            assert!(delay >= Duration::from_secs(54) && delay <= Duration::from_secs(66));
        }
    }
}
