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

//! End-to-end pipeline tests: background loop, retries, overflow, shutdown

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tasktrail_core::config::{CacheStrategy, PersistenceStrategy};
use tasktrail_core::{Event, IndexStatus, IndexerConfig, MetadataEvent, TaskStatus};
use tasktrail_indexer::{Pipeline, SubmitOutcome};
use tasktrail_storage::{FileBackend, MemoryStorageClient, PersistenceBackend, RetryStore};

fn config() -> IndexerConfig {
    let mut config = IndexerConfig::default();
    config.persistence.strategy = PersistenceStrategy::Memory;
    config.batch.interval_ms = 10;
    config.retry.max_insert_tries = 3;
    config.shutdown.termination_timeout_secs = 5;
    config
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Submitted events are indexed by the background loop
#[tokio::test]
async fn test_submitted_events_are_indexed() {
    let storage = Arc::new(MemoryStorageClient::new());
    let pipeline = Pipeline::start(config(), storage.clone()).await.unwrap();

    let now = Utc::now();
    assert_eq!(pipeline.submit(Event::start("p", "job", now, None)), SubmitOutcome::Queued);
    pipeline.submit(Event::start("c", "step", now, Some("p".into())));
    pipeline.submit(Event::success("c", now));

    eventually("child to complete", || {
        storage
            .task("default", "c")
            .map(|t| t.status() == TaskStatus::Success)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        storage.task("default", "c").unwrap().primary_id.as_deref(),
        Some("p")
    );
    pipeline.shutdown().await.unwrap();
}

/// Shutdown indexes whatever is still buffered before closing the store
#[tokio::test]
async fn test_shutdown_drains_buffered_events() {
    let mut config = config();
    config.batch.interval_ms = 60_000;
    let storage = Arc::new(MemoryStorageClient::new());
    let pipeline = Pipeline::start(config, storage.clone()).await.unwrap();

    let producer = pipeline.intake().clone();
    for i in 0..50 {
        producer.submit(Event::start(format!("t{}", i), "job", Utc::now(), None));
    }
    pipeline.shutdown().await.unwrap();

    assert_eq!(storage.task_count(), 50);
    assert!(storage.is_closed());
    assert_eq!(producer.submit(Event::info("late", Utc::now())), SubmitOutcome::Closed);
}

/// A bulk that keeps failing is attempted `max_insert_tries` more times, then dropped
#[tokio::test]
async fn test_failed_bulk_retry_is_bounded() {
    let storage = Arc::new(MemoryStorageClient::new());
    storage.fail_all_writes();
    let pipeline = Pipeline::start(config(), storage.clone()).await.unwrap();

    pipeline.submit(Event::start("t", "job", Utc::now(), None));
    let store = pipeline.retry_store().clone();
    eventually("bulk to be persisted", || {
        store.has_failed_bulks().unwrap_or(false)
    })
    .await;

    let worker = pipeline.retry_worker().clone();
    for _ in 0..3 {
        worker.run_once().await.unwrap();
    }
    assert_eq!(storage.bulk_write_calls(), 4);
    assert!(!store.has_failed_bulks().unwrap());
    assert_eq!(worker.stats().bulks_dead_lettered, 1);
    assert!(storage.task("default", "t").is_none());
    pipeline.shutdown().await.unwrap();
}

/// A failed bulk is written once the store recovers
#[tokio::test]
async fn test_failed_bulk_recovers() {
    let storage = Arc::new(MemoryStorageClient::new());
    storage.fail_next_writes(1);
    let pipeline = Pipeline::start(config(), storage.clone()).await.unwrap();

    pipeline.submit(Event::start("t", "job", Utc::now(), None));
    let store = pipeline.retry_store().clone();
    eventually("bulk to be persisted", || {
        store.has_failed_bulks().unwrap_or(false)
    })
    .await;

    let round = pipeline.retry_worker().run_once().await.unwrap();
    assert_eq!(round.bulks_written, 1);
    assert!(storage.task("default", "t").is_some());
    pipeline.shutdown().await.unwrap();
}

/// A parent lookup failure parks the batch in the overflow queue until the store heals
#[tokio::test]
async fn test_fetch_failure_spills_and_recovers() {
    let storage = Arc::new(MemoryStorageClient::new());
    storage.fail_fetches(true);
    let pipeline = Pipeline::start(config(), storage.clone()).await.unwrap();

    pipeline.submit(Event::start("c", "step", Utc::now(), Some("elsewhere".into())));
    let store = pipeline.retry_store().clone();
    eventually("batch to reach the overflow queue", || {
        store.overflow_lists_amount().unwrap_or(0) == 1
    })
    .await;
    assert!(storage.metadata().iter().any(|m| matches!(
        m,
        MetadataEvent::Index { status: IndexStatus::Failure, .. }
    )));

    storage.heal();
    let round = pipeline.retry_worker().run_once().await.unwrap();
    assert_eq!(round.events_reinjected, 1);
    eventually("child to be indexed", || storage.task("default", "c").is_some()).await;

    let child = storage.task("default", "c").unwrap();
    assert_eq!(child.orphan, Some(true));
    pipeline.shutdown().await.unwrap();
}

/// Overflowed events persisted by one instance are indexed by the next
#[tokio::test]
async fn test_overflow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let events = vec![
        Event::start("a", "job", Utc::now(), None).with_string("k", "v"),
        Event::success("a", Utc::now()),
    ];
    {
        let backend: Arc<dyn PersistenceBackend> = Arc::new(FileBackend::open(dir.path()).unwrap());
        let store = RetryStore::with_lease(backend, Duration::from_secs(5));
        store.persist_overflow(&events).unwrap();
        store.close().unwrap();
    }

    let mut config = config();
    config.persistence.strategy = PersistenceStrategy::File;
    config.persistence.path = dir.path().to_path_buf();
    config.persistence.fallback_to_memory = false;
    let storage = Arc::new(MemoryStorageClient::new());
    let pipeline = Pipeline::start(config, storage.clone()).await.unwrap();

    let round = pipeline.retry_worker().run_once().await.unwrap();
    assert_eq!(round.events_reinjected, 2);
    pipeline.shutdown().await.unwrap();

    let task = storage.task("default", "a").unwrap();
    assert_eq!(task.status(), TaskStatus::Success);
    assert_eq!(task.strings["k"], "v");
}

/// Store-backed caches resolve a chain split across cycles
#[tokio::test]
async fn test_store_cache_strategy_resolves_across_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.cache.strategy = CacheStrategy::Store;
    config.persistence.strategy = PersistenceStrategy::File;
    config.persistence.path = dir.path().to_path_buf();
    let storage = Arc::new(MemoryStorageClient::new());
    let pipeline = Pipeline::start(config, storage.clone()).await.unwrap();

    pipeline.submit(Event::start("c", "step", Utc::now(), Some("p".into())));
    eventually("orphan to be indexed", || storage.task("default", "c").is_some()).await;

    pipeline.submit(Event::start("p", "job", Utc::now(), None));
    eventually("orphan to be adopted", || {
        storage
            .task("default", "c")
            .map(|t| t.primary_id.as_deref() == Some("p"))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(
        storage.task("default", "c").unwrap().parents_path,
        Some(vec!["job".to_string()])
    );
    pipeline.shutdown().await.unwrap();
}
