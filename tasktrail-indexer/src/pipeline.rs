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

//! Pipeline lifecycle: startup, the indexing loop and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tasktrail_core::config::{PersistenceConfig, PersistenceStrategy};
use tasktrail_core::{Event, IndexerConfig, MetadataEvent, DEFAULT_ENV};
use tasktrail_storage::{
    build_caches, FileBackend, MemoryBackend, PersistenceBackend, RetryStore, StorageClient,
};

use crate::batch::BatchProcessor;
use crate::blocking::run_blocking;
use crate::error::{IndexerError, IndexerResult};
use crate::intake::{self, IntakeQueue, IntakeReceiver, SubmitOutcome};
use crate::retry_worker::RetryWorker;

pub struct Pipeline {
    intake: IntakeQueue,
    retry_worker: Arc<RetryWorker>,
    retry_store: Arc<RetryStore>,
    storage: Arc<dyn StorageClient>,
    cancel: CancellationToken,
    indexer: JoinHandle<()>,
    retrier: JoinHandle<()>,
    termination_timeout: Duration,
}

impl Pipeline {
    /// Start with the persistence backend named by the configuration.
    pub async fn start(config: IndexerConfig, storage: Arc<dyn StorageClient>) -> IndexerResult<Self> {
        config.validate()?;
        let backend = open_backend(&config.persistence)?;
        Self::start_with(config, storage, backend).await
    }

    /// Start with an already opened persistence backend.
    pub async fn start_with(
        config: IndexerConfig,
        storage: Arc<dyn StorageClient>,
        backend: Arc<dyn PersistenceBackend>,
    ) -> IndexerResult<Self> {
        config.validate()?;
        let backend = ensure_healthy(backend, &config.persistence)?;

        let retry_store = Arc::new(RetryStore::new(backend.clone(), &config.retry));
        let (task_cache, orphan_cache) = build_caches(&config.cache, backend);
        let processor = BatchProcessor::new(
            &config,
            storage.clone(),
            task_cache,
            orphan_cache,
            retry_store.clone(),
        )?;

        if let Err(e) = storage
            .index_metadata(MetadataEvent::Startup {
                time: Utc::now(),
                env: DEFAULT_ENV.to_string(),
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to record startup");
        }

        let (intake, receiver) = intake::channel(&config.intake);
        let retry_worker = Arc::new(RetryWorker::new(
            storage.clone(),
            retry_store.clone(),
            intake.clone(),
            config.retry.clone(),
        ));
        let cancel = CancellationToken::new();

        let indexer = tokio::spawn(indexing_loop(
            processor,
            receiver,
            retry_store.clone(),
            LoopSettings {
                interval: config.batch.interval(),
                max_events: config.batch.max_events_per_cycle,
            },
            cancel.clone(),
        ));
        let retrier = tokio::spawn(retry_worker.clone().run(cancel.clone()));

        tracing::info!(
            interval_ms = config.batch.interval_ms,
            capacity = config.intake.capacity,
            cache = ?config.cache.strategy,
            "Pipeline started"
        );

        Ok(Self {
            intake,
            retry_worker,
            retry_store,
            storage,
            cancel,
            indexer,
            retrier,
            termination_timeout: config.shutdown.termination_timeout(),
        })
    }

    /// Producer handle; clone it for each producer.
    pub fn intake(&self) -> &IntakeQueue {
        &self.intake
    }

    pub fn submit(&self, event: Event) -> SubmitOutcome {
        self.intake.submit(event)
    }

    pub fn retry_worker(&self) -> &Arc<RetryWorker> {
        &self.retry_worker
    }

    pub fn retry_store(&self) -> &Arc<RetryStore> {
        &self.retry_store
    }

    /// Stop scheduling, index what is still buffered and close the
    /// storage client and retry store. Waits at most the termination
    /// timeout for background work.
    pub async fn shutdown(self) -> IndexerResult<()> {
        tracing::info!(buffered = self.intake.buffered(), "Shutting down pipeline");
        self.cancel.cancel();

        let deadline = Instant::now() + self.termination_timeout;
        let mut failure = None;
        for (name, mut handle) in [("indexer", self.indexer), ("retry worker", self.retrier)] {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(task = name, error = %e, "Background task failed");
                    failure.get_or_insert_with(|| format!("{}: {}", name, e));
                }
                Err(_) => {
                    tracing::warn!(
                        task = name,
                        buffered = self.intake.buffered(),
                        "Couldn't gracefully shut down, aborting"
                    );
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.storage.close().await {
            tracing::warn!(error = %e, "Failed to close storage client");
        }
        let retry_store = self.retry_store.clone();
        if let Err(e) = run_blocking(move || retry_store.close()).await {
            tracing::warn!(error = %e, "Failed to close retry store");
        }
        tracing::info!("Pipeline stopped");

        match failure {
            Some(message) => Err(IndexerError::Task(message)),
            None => Ok(()),
        }
    }
}

/// Open the configured backend, falling back to memory when allowed.
pub fn open_backend(config: &PersistenceConfig) -> IndexerResult<Arc<dyn PersistenceBackend>> {
    match config.strategy {
        PersistenceStrategy::Memory => Ok(Arc::new(MemoryBackend::new())),
        PersistenceStrategy::File => match FileBackend::open(&config.path) {
            Ok(backend) => Ok(Arc::new(backend)),
            Err(e) => fallback(config, format!("cannot open {}: {}", config.path.display(), e)),
        },
    }
}

fn ensure_healthy(
    backend: Arc<dyn PersistenceBackend>,
    config: &PersistenceConfig,
) -> IndexerResult<Arc<dyn PersistenceBackend>> {
    if backend.is_created_successfully() {
        return Ok(backend);
    }
    fallback(config, "persistence backend is not healthy".to_string())
}

fn fallback(config: &PersistenceConfig, reason: String) -> IndexerResult<Arc<dyn PersistenceBackend>> {
    if config.fallback_to_memory {
        tracing::warn!(reason = %reason, "Falling back to in-memory persistence, retries will not survive restarts");
        Ok(Arc::new(MemoryBackend::new()))
    } else {
        Err(IndexerError::Startup(reason))
    }
}

struct LoopSettings {
    interval: Duration,
    max_events: usize,
}

async fn indexing_loop(
    processor: BatchProcessor,
    mut receiver: IntakeReceiver,
    retry_store: Arc<RetryStore>,
    settings: LoopSettings,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        spill_overflow(&mut receiver, &retry_store).await;
        let events = receiver.drain(settings.max_events);
        if !events.is_empty() {
            processor.process(events).await;
        }
    }

    receiver.close();
    let mut drained = 0;
    loop {
        spill_overflow(&mut receiver, &retry_store).await;
        let events = receiver.drain(settings.max_events);
        if events.is_empty() {
            break;
        }
        drained += events.len();
        processor.process(events).await;
    }
    tracing::info!(drained, "Indexing loop stopped");
}

/// Move whatever sits in the overflow buffer to the durable queue.
async fn spill_overflow(receiver: &mut IntakeReceiver, retry_store: &Arc<RetryStore>) {
    let events = receiver.drain_overflow(usize::MAX);
    if events.is_empty() {
        return;
    }
    let count = events.len();
    let store = retry_store.clone();
    if let Err(e) = run_blocking(move || store.persist_overflow(&events)).await {
        tracing::error!(error = %e, events = count, "Could not persist overflowed events, events lost");
    }
}
