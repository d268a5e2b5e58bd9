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

//! One indexing cycle.
//!
//! A drained batch is split per environment and each part goes through:
//! trimming, heartbeat extraction, plugins, parent lookup, resolution,
//! one bulk write, retry persistence, cache update and an index summary.
//!
//! Cache keys are scoped by environment. Cache and retry store calls run
//! on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use tasktrail_core::{Event, IndexStatus, IndexerConfig, MetadataEvent, Task, TaskUpdate};
use tasktrail_storage::cache::{EnvOrphanCache, EnvTaskCache};
use tasktrail_storage::{Bulk, DbBulkRequest, OrphanCache, RetryStore, StorageClient, TaskCache};

use crate::blocking::run_blocking;
use crate::error::{IndexerError, IndexerResult};
use crate::plugins::PluginChain;
use crate::resolver::ParentResolver;
use crate::trim::FieldTrimmer;

/// What happened to one environment's events in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOutcome {
    pub env: String,
    pub events: usize,
    pub heartbeats: usize,
    /// Parents and waiting children loaded from the document store
    pub fetched: usize,
    pub written: usize,
    pub persisted_for_retry: usize,
    pub adopted: usize,
    pub orphans_recorded: usize,
    pub status: IndexStatus,
    pub error: Option<String>,
}

impl IndexOutcome {
    fn new(env: &str, events: usize) -> Self {
        Self {
            env: env.to_string(),
            events,
            heartbeats: 0,
            fetched: 0,
            written: 0,
            persisted_for_retry: 0,
            adopted: 0,
            orphans_recorded: 0,
            status: IndexStatus::Success,
            error: None,
        }
    }
}

pub struct BatchProcessor {
    storage: Arc<dyn StorageClient>,
    task_cache: Arc<dyn TaskCache>,
    orphan_cache: Arc<dyn OrphanCache>,
    retry_store: Arc<RetryStore>,
    trimmer: FieldTrimmer,
    plugins: PluginChain,
    max_adoption_rounds: usize,
}

impl BatchProcessor {
    /// Plugins come from `batch.plugins_json` when set.
    pub fn new(
        config: &IndexerConfig,
        storage: Arc<dyn StorageClient>,
        task_cache: Arc<dyn TaskCache>,
        orphan_cache: Arc<dyn OrphanCache>,
        retry_store: Arc<RetryStore>,
    ) -> IndexerResult<Self> {
        let plugins = match &config.batch.plugins_json {
            Some(json) => PluginChain::from_json(json)?,
            None => PluginChain::new(),
        };
        Ok(Self {
            storage,
            task_cache,
            orphan_cache,
            retry_store,
            trimmer: FieldTrimmer::new(&config.trim),
            plugins,
            max_adoption_rounds: config.batch.max_adoption_rounds,
        })
    }

    pub fn with_plugins(mut self, plugins: PluginChain) -> Self {
        self.plugins = plugins;
        self
    }

    /// Index a drained batch. Environments are processed in order of
    /// first appearance.
    pub async fn process(&self, events: Vec<Event>) -> Vec<IndexOutcome> {
        if events.is_empty() {
            return Vec::new();
        }
        let mut order: Vec<String> = Vec::new();
        let mut by_env: HashMap<String, Vec<Event>> = HashMap::new();
        for event in events {
            if !by_env.contains_key(&event.env) {
                order.push(event.env.clone());
            }
            by_env.entry(event.env.clone()).or_default().push(event);
        }

        let mut outcomes = Vec::with_capacity(order.len());
        for env in order {
            if let Some(events) = by_env.remove(&env) {
                outcomes.push(self.process_env(&env, events).await);
            }
        }
        outcomes
    }

    async fn process_env(&self, env: &str, mut events: Vec<Event>) -> IndexOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut outcome = IndexOutcome::new(env, events.len());

        let trimmed: usize = events.iter_mut().map(|e| self.trimmer.trim(e)).sum();
        if trimmed > 0 {
            tracing::debug!(env, trimmed, "Trimmed oversized values");
        }

        let (heartbeats, mut events): (Vec<Event>, Vec<Event>) =
            events.into_iter().partition(Event::is_heartbeat);
        outcome.heartbeats = heartbeats.len();
        for heartbeat in &heartbeats {
            self.write_metadata(MetadataEvent::heartbeat(heartbeat)).await;
        }

        let (plugin_records, plugins_duration_ms) = self.plugins.apply_all(&mut events, env);
        for record in plugin_records {
            self.write_metadata(record).await;
        }

        if !events.is_empty() {
            match self.load_parents(env, &events).await {
                Ok((parents, fetched)) => {
                    outcome.fetched = fetched;
                    self.index(env, events, parents, &mut outcome).await;
                }
                Err(e) => {
                    let count = events.len();
                    tracing::error!(env, error = %e, events = count, "Parent lookup failed, moving batch to overflow");
                    let store = self.retry_store.clone();
                    if let Err(persist) = run_blocking(move || store.persist_overflow(&events)).await {
                        tracing::error!(env, error = %persist, events = count, "Could not persist batch, events lost");
                    }
                    outcome.status = IndexStatus::Failure;
                    outcome.error = Some(e.to_string());
                }
            }
        }

        let duration_ms = timer.elapsed().as_millis() as u64;
        self.write_metadata(MetadataEvent::Index {
            env: env.to_string(),
            events_amount: outcome.events,
            fetched_amount: outcome.fetched,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            status: outcome.status,
            error: outcome.error.clone(),
            plugins_duration_ms,
        })
        .await;

        tracing::debug!(
            env,
            events = outcome.events,
            written = outcome.written,
            adopted = outcome.adopted,
            duration_ms,
            "Indexed batch"
        );
        outcome
    }

    /// Parents referenced by the batch but not started in it, from the
    /// cache first and then the store. Returns the parents and how many
    /// came from the store.
    async fn load_parents(
        &self,
        env: &str,
        events: &[Event],
    ) -> IndexerResult<(HashMap<String, Task>, usize)> {
        let opened: HashSet<&str> = events
            .iter()
            .filter(|e| e.opens_task())
            .map(|e| e.task_id.as_str())
            .collect();
        let mut missing: Vec<String> = events
            .iter()
            .filter_map(|e| e.parent_id.as_deref())
            .filter(|p| !opened.contains(p))
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return Ok((HashMap::new(), 0));
        }

        let mut parents = self.cache_get(env, missing.clone()).await?;
        missing.retain(|id| !parents.contains_key(id));
        if missing.is_empty() {
            return Ok((parents, 0));
        }

        let fetched = self.storage.fetch_by_ids(env, &missing).await?;
        let fetched_amount = fetched.len();
        if !fetched.is_empty() {
            self.cache_put(env, fetched.clone()).await;
        }
        parents.extend(fetched);
        Ok((parents, fetched_amount))
    }

    async fn index(
        &self,
        env: &str,
        mut events: Vec<Event>,
        parents: HashMap<String, Task>,
        outcome: &mut IndexOutcome,
    ) {
        let resolved = self
            .with_resolver(env, move |resolver| resolver.resolve(&mut events, &parents))
            .await;
        let mut resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::error!(env, error = %e, "Parent resolution failed, events lost");
                outcome.status = IndexStatus::Failure;
                outcome.error = Some(e.to_string());
                return;
            }
        };

        // Waiting children the cache no longer holds come from the store.
        while !resolution.pending.is_empty() {
            let ids: Vec<String> = resolution.pending.iter().map(|p| p.child_id.clone()).collect();
            let indexed = match self.storage.fetch_by_ids(env, &ids).await {
                Ok(found) => {
                    outcome.fetched += found.len();
                    found
                }
                Err(e) => {
                    tracing::warn!(env, error = %e, children = ids.len(), "Could not load waiting children, recording them as orphans again");
                    HashMap::new()
                }
            };
            let adopted = self
                .with_resolver(env, move |resolver| {
                    resolver.adopt_indexed(&mut resolution, indexed);
                    resolution
                })
                .await;
            resolution = match adopted {
                Ok(resolution) => resolution,
                Err(e) => {
                    tracing::error!(env, error = %e, "Adopting stored children failed, events lost");
                    outcome.status = IndexStatus::Failure;
                    outcome.error = Some(e.to_string());
                    return;
                }
            };
        }
        outcome.orphans_recorded = resolution.orphans_recorded;
        outcome.adopted = resolution.adoptions;

        let mut bulk = Bulk::new(env);
        for (id, task) in &resolution.received {
            bulk.push(TaskUpdate::from_task(id.clone(), task));
        }
        for (id, task) in &resolution.adopted {
            bulk.push(TaskUpdate::adoption(id.clone(), task));
        }

        match self.storage.bulk_write(&bulk).await {
            Ok(response) if response.is_success() => {
                outcome.written = bulk.len();
            }
            Ok(response) => {
                let retryable = response.retryable_ids();
                for failure in response.failures.iter().filter(|f| !f.retryable) {
                    tracing::error!(env, task_id = %failure.task_id, reason = %failure.reason, "Update rejected");
                }
                outcome.written = bulk.len().saturating_sub(response.failures.len());
                outcome.status = IndexStatus::PartialFailure;
                outcome.error = Some(format!("{} updates rejected", response.failures.len()));
                if !retryable.is_empty() {
                    let retry = bulk.subset(&retryable);
                    outcome.persisted_for_retry = retry.len();
                    self.persist_for_retry(retry).await;
                }
            }
            Err(e) => {
                tracing::warn!(env, error = %e, updates = bulk.len(), "Bulk write failed, persisting for retry");
                outcome.status = IndexStatus::Failure;
                outcome.error = Some(e.to_string());
                outcome.persisted_for_retry = bulk.len();
                self.persist_for_retry(bulk).await;
            }
        }

        let mut cached = resolution.received;
        cached.extend(resolution.adopted);
        self.cache_put(env, cached).await;
    }

    async fn persist_for_retry(&self, bulk: Bulk) {
        let updates = bulk.len();
        let env = bulk.env.clone();
        let store = self.retry_store.clone();
        let request = DbBulkRequest::new(bulk);
        if let Err(e) = run_blocking(move || store.persist_bulk(&request)).await {
            tracing::error!(env = %env, error = %e, updates, "Could not persist failed bulk, updates lost");
        }
    }

    /// Run `f` against a resolver over this environment's caches.
    async fn with_resolver<T, F>(&self, env: &str, f: F) -> IndexerResult<T>
    where
        F: FnOnce(&ParentResolver<'_>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let task_cache = self.task_cache.clone();
        let orphan_cache = self.orphan_cache.clone();
        let env = env.to_string();
        let max_rounds = self.max_adoption_rounds;
        run_blocking(move || {
            let tasks = EnvTaskCache::new(&env, task_cache.as_ref());
            let orphans = EnvOrphanCache::new(&env, orphan_cache.as_ref());
            Ok::<_, IndexerError>(f(&ParentResolver::new(&tasks, &orphans, max_rounds)))
        })
        .await
    }

    async fn cache_get(&self, env: &str, ids: Vec<String>) -> IndexerResult<HashMap<String, Task>> {
        let task_cache = self.task_cache.clone();
        let env = env.to_string();
        run_blocking(move || {
            Ok::<_, IndexerError>(EnvTaskCache::new(&env, task_cache.as_ref()).get_many(&ids))
        })
        .await
    }

    async fn cache_put(&self, env: &str, tasks: HashMap<String, Task>) {
        let task_cache = self.task_cache.clone();
        let scope = env.to_string();
        let stored = run_blocking(move || {
            EnvTaskCache::new(&scope, task_cache.as_ref()).put_many(&tasks);
            Ok::<_, IndexerError>(())
        })
        .await;
        if let Err(e) = stored {
            tracing::warn!(env, error = %e, "Failed to update task cache");
        }
    }

    async fn write_metadata(&self, event: MetadataEvent) {
        if let Err(e) = self.storage.index_metadata(event).await {
            tracing::warn!(error = %e, "Failed to write metadata event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tasktrail_core::{TaskStatus, HEARTBEAT_TASK_NAME};
    use tasktrail_storage::cache::{LocalOrphanCache, LocalTaskCache};
    use tasktrail_storage::{MemoryBackend, MemoryStorageClient};

    struct Fixture {
        storage: Arc<MemoryStorageClient>,
        retry_store: Arc<RetryStore>,
        processor: BatchProcessor,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorageClient::new());
        let retry_store = Arc::new(RetryStore::with_lease(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(5),
        ));
        let processor = BatchProcessor::new(
            &IndexerConfig::default(),
            storage.clone(),
            Arc::new(LocalTaskCache::new(1 << 24, None)),
            Arc::new(LocalOrphanCache::new(1 << 24, None)),
            retry_store.clone(),
        )
        .unwrap();
        Fixture {
            storage,
            retry_store,
            processor,
        }
    }

    fn index_records(storage: &MemoryStorageClient) -> Vec<MetadataEvent> {
        storage
            .metadata()
            .into_iter()
            .filter(|m| matches!(m, MetadataEvent::Index { .. }))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_is_written_and_summarised() {
        let f = fixture();
        let now = Utc::now();
        let outcomes = f
            .processor
            .process(vec![
                Event::start("p", "job", now, None),
                Event::start("c", "step", now, Some("p".into())),
                Event::success("c", now),
            ])
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, IndexStatus::Success);
        assert_eq!(outcomes[0].written, 2);

        let child = f.storage.task("default", "c").unwrap();
        assert_eq!(child.status(), TaskStatus::Success);
        assert_eq!(child.primary_id.as_deref(), Some("p"));
        assert_eq!(child.parents_path, Some(vec!["job".to_string()]));
        assert_eq!(index_records(&f.storage).len(), 1);
    }

    #[tokio::test]
    async fn test_environments_are_indexed_separately() {
        let f = fixture();
        let now = Utc::now();
        let outcomes = f
            .processor
            .process(vec![
                Event::start("a", "job", now, None).with_env("prod"),
                Event::start("b", "job", now, None),
            ])
            .await;

        let envs: Vec<_> = outcomes.iter().map(|o| o.env.as_str()).collect();
        assert_eq!(envs, vec!["prod", "default"]);
        assert!(f.storage.task("prod", "a").is_some());
        assert!(f.storage.task("prod", "b").is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_become_metadata() {
        let f = fixture();
        let heartbeat = Event::spot("hb-1", HEARTBEAT_TASK_NAME, Utc::now(), None).with_metric("uptime", 3.0);
        let outcomes = f.processor.process(vec![heartbeat]).await;

        assert_eq!(outcomes[0].heartbeats, 1);
        assert_eq!(f.storage.task_count(), 0);
        assert!(f
            .storage
            .metadata()
            .iter()
            .any(|m| matches!(m, MetadataEvent::Heartbeat { task_id, .. } if task_id == "hb-1")));
    }

    #[tokio::test]
    async fn test_parent_is_fetched_from_store() {
        let f = fixture();
        let now = Utc::now();
        f.processor.process(vec![Event::start("p", "job", now, None)]).await;

        // A fresh cache forces the store lookup.
        let processor = BatchProcessor::new(
            &IndexerConfig::default(),
            f.storage.clone(),
            Arc::new(LocalTaskCache::new(1 << 24, None)),
            Arc::new(LocalOrphanCache::new(1 << 24, None)),
            f.retry_store.clone(),
        )
        .unwrap();
        let outcomes = processor
            .process(vec![Event::start("c", "step", now, Some("p".into()))])
            .await;

        assert_eq!(outcomes[0].fetched, 1);
        let child = f.storage.task("default", "c").unwrap();
        assert_eq!(child.primary_id.as_deref(), Some("p"));
        assert_eq!(child.orphan, Some(false));
    }

    #[tokio::test]
    async fn test_fetch_failure_moves_batch_to_overflow() {
        let f = fixture();
        f.storage.fail_fetches(true);
        let outcomes = f
            .processor
            .process(vec![Event::start("c", "step", Utc::now(), Some("p".into()))])
            .await;

        assert_eq!(outcomes[0].status, IndexStatus::Failure);
        assert_eq!(f.storage.bulk_write_calls(), 0);
        assert_eq!(f.retry_store.overflow_lists_amount().unwrap(), 1);
        assert!(matches!(
            &index_records(&f.storage)[0],
            MetadataEvent::Index { status: IndexStatus::Failure, error: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_write_is_persisted_whole() {
        let f = fixture();
        f.storage.fail_next_writes(1);
        let outcomes = f
            .processor
            .process(vec![
                Event::start("a", "job", Utc::now(), None),
                Event::start("b", "job", Utc::now(), None),
            ])
            .await;

        assert_eq!(outcomes[0].persisted_for_retry, 2);
        let bulks = f
            .retry_store
            .fetch_failed_bulks(10, Duration::ZERO)
            .unwrap();
        assert_eq!(bulks.len(), 1);
        assert_eq!(bulks[0].bulk.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_persists_retryable_updates_only() {
        let f = fixture();
        f.storage.reject_task("b", true);
        f.storage.reject_task("c", false);
        let now = Utc::now();
        let outcomes = f
            .processor
            .process(vec![
                Event::start("a", "job", now, None),
                Event::start("b", "job", now, None),
                Event::start("c", "job", now, None),
            ])
            .await;

        assert_eq!(outcomes[0].status, IndexStatus::PartialFailure);
        assert_eq!(outcomes[0].written, 1);
        let bulks = f
            .retry_store
            .fetch_failed_bulks(10, Duration::ZERO)
            .unwrap();
        let ids: Vec<_> = bulks[0].bulk.updates.iter().map(|u| u.task_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_oversized_values_are_trimmed() {
        let mut config = IndexerConfig::default();
        config.trim.default_max_chars = 3;
        let storage = Arc::new(MemoryStorageClient::new());
        let processor = BatchProcessor::new(
            &config,
            storage.clone(),
            Arc::new(LocalTaskCache::new(1 << 24, None)),
            Arc::new(LocalOrphanCache::new(1 << 24, None)),
            Arc::new(RetryStore::with_lease(Arc::new(MemoryBackend::new()), Duration::from_secs(5))),
        )
        .unwrap();

        processor
            .process(vec![Event::start("a", "job", Utc::now(), None).with_string("q", "abcdef")])
            .await;
        assert_eq!(storage.task("default", "a").unwrap().strings["q"], "abc");
    }

    #[tokio::test]
    async fn test_spot_parent_adopts_earlier_child() {
        let f = fixture();
        let now = Utc::now();
        f.processor
            .process(vec![Event::start("c", "step", now, Some("s".into()))])
            .await;
        f.processor.process(vec![Event::spot("s", "ping", now, None)]).await;
        f.processor.process(vec![Event::start("other", "job", now, None)]).await;

        let child = f.storage.task("default", "c").unwrap();
        assert_eq!(child.primary_id.as_deref(), Some("s"));
        assert_eq!(child.orphan, Some(false));
        assert_eq!(child.parents_path, Some(vec!["ping".to_string()]));
        assert_eq!(
            f.storage.task("default", "s").unwrap().primary_id.as_deref(),
            Some("s")
        );
    }

    #[tokio::test]
    async fn test_waiting_child_missing_from_cache_is_loaded_from_store() {
        let storage = Arc::new(MemoryStorageClient::new());
        let orphans: Arc<dyn OrphanCache> = Arc::new(LocalOrphanCache::new(1 << 24, None));
        let processor = |tasks: LocalTaskCache| {
            BatchProcessor::new(
                &IndexerConfig::default(),
                storage.clone(),
                Arc::new(tasks),
                orphans.clone(),
                Arc::new(RetryStore::with_lease(Arc::new(MemoryBackend::new()), Duration::from_secs(5))),
            )
            .unwrap()
        };
        let now = Utc::now();
        processor(LocalTaskCache::new(1 << 24, None))
            .process(vec![Event::start("c", "step", now, Some("p".into()))])
            .await;

        // Another instance shares the orphan cache but not the task cache.
        let outcomes = processor(LocalTaskCache::new(1 << 24, None))
            .process(vec![Event::start("p", "job", now, None)])
            .await;

        assert_eq!(outcomes[0].fetched, 1);
        assert_eq!(outcomes[0].adopted, 1);
        let child = storage.task("default", "c").unwrap();
        assert_eq!(child.primary_id.as_deref(), Some("p"));
        assert_eq!(child.parents_path, Some(vec!["job".to_string()]));
        assert_eq!(child.orphan, Some(false));
    }

    #[tokio::test]
    async fn test_cached_parent_does_not_leak_across_environments() {
        let f = fixture();
        let now = Utc::now();
        f.processor
            .process(vec![Event::start("p", "job", now, None).with_env("prod")])
            .await;
        f.processor
            .process(vec![Event::start("c", "step", now, Some("p".into())).with_env("staging")])
            .await;

        let child = f.storage.task("staging", "c").unwrap();
        assert!(child.primary_id.is_none());
        assert_eq!(child.orphan, Some(true));
    }
}
