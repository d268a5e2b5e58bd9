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

//! Indexer configuration
//!
//! Loaded from a TOML file, then overridden by `TASKTRAIL_*` environment
//! variables. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub trim: TrimConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Bounded in-memory buffer between producers and the indexing loop
    #[serde(default = "default_intake_capacity")]
    pub capacity: usize,

    /// Second buffer for events that did not fit; drained to disk each cycle
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            capacity: default_intake_capacity(),
            overflow_capacity: default_overflow_capacity(),
        }
    }
}

fn default_intake_capacity() -> usize {
    1_000_000
}

fn default_overflow_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_max_events_per_cycle")]
    pub max_events_per_cycle: usize,

    /// Upper bound on orphan adoption rounds in one batch
    #[serde(default = "default_max_adoption_rounds")]
    pub max_adoption_rounds: usize,

    /// JSON array of plugin definitions
    #[serde(default)]
    pub plugins_json: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_batch_interval_ms(),
            max_events_per_cycle: default_max_events_per_cycle(),
            max_adoption_rounds: default_max_adoption_rounds(),
            plugins_json: None,
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_batch_interval_ms() -> u64 {
    1_000
}

fn default_max_events_per_cycle() -> usize {
    100_000
}

fn default_max_adoption_rounds() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimConfig {
    #[serde(default = "default_max_chars")]
    pub default_max_chars: usize,

    /// Per-field limits keyed `string.<key>`, `text.<key>` or `ctx.<key>`
    #[serde(default)]
    pub overrides: HashMap<String, usize>,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            default_max_chars: default_max_chars(),
            overrides: HashMap::new(),
        }
    }
}

fn default_max_chars() -> usize {
    1_000_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fetches after which a still-failing bulk is dropped
    #[serde(default = "default_max_insert_tries")]
    pub max_insert_tries: u32,

    #[serde(default = "default_max_fetched_bulks")]
    pub max_fetched_bulks: usize,

    #[serde(default = "default_max_fetched_overflow")]
    pub max_fetched_overflow: usize,

    /// Minimum age of the oldest entry before a queue is fetched
    #[serde(default)]
    pub min_dwell_secs: u64,

    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    #[serde(default = "default_retry_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_insert_tries: default_max_insert_tries(),
            max_fetched_bulks: default_max_fetched_bulks(),
            max_fetched_overflow: default_max_fetched_overflow(),
            min_dwell_secs: 0,
            lock_lease_secs: default_lock_lease_secs(),
            interval_secs: default_retry_interval_secs(),
        }
    }
}

impl RetryConfig {
    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs(self.min_dwell_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_max_insert_tries() -> u32 {
    10
}

fn default_max_fetched_bulks() -> usize {
    100
}

fn default_max_fetched_overflow() -> usize {
    20
}

fn default_lock_lease_secs() -> u64 {
    20
}

fn default_retry_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// In-process bounded cache
    Local,
    /// Shared key/value entries in the persistence backend
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_strategy")]
    pub strategy: CacheStrategy,

    #[serde(default = "default_cache_weight")]
    pub task_max_weight_bytes: u64,

    #[serde(default = "default_cache_weight")]
    pub orphan_max_weight_bytes: u64,

    /// 0 disables expiry
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: default_cache_strategy(),
            task_max_weight_bytes: default_cache_weight(),
            orphan_max_weight_bytes: default_cache_weight(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

fn default_cache_strategy() -> CacheStrategy {
    CacheStrategy::Local
}

fn default_cache_weight() -> u64 {
    100 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceStrategy {
    Memory,
    File,
}

impl FromStr for PersistenceStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(PersistenceStrategy::Memory),
            "file" => Ok(PersistenceStrategy::File),
            other => Err(CoreError::Config(format!(
                "unknown persistence strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_strategy")]
    pub strategy: PersistenceStrategy,

    #[serde(default = "default_data_dir")]
    pub path: PathBuf,

    /// Keep running in memory when the durable backend cannot be opened
    #[serde(default = "default_fallback_to_memory")]
    pub fallback_to_memory: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            strategy: default_persistence_strategy(),
            path: default_data_dir(),
            fallback_to_memory: default_fallback_to_memory(),
        }
    }
}

fn default_persistence_strategy() -> PersistenceStrategy {
    PersistenceStrategy::File
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tasktrail-data")
}

fn default_fallback_to_memory() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_termination_timeout_secs")]
    pub termination_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            termination_timeout_secs: default_termination_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }
}

fn default_termination_timeout_secs() -> u64 {
    60
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

impl IndexerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - TASKTRAIL_INTAKE_CAPACITY
    /// - TASKTRAIL_OVERFLOW_CAPACITY
    /// - TASKTRAIL_BATCH_INTERVAL_MS
    /// - TASKTRAIL_MAX_EVENTS_PER_CYCLE
    /// - TASKTRAIL_DEFAULT_MAX_CHARS
    /// - TASKTRAIL_MAX_INSERT_TRIES
    /// - TASKTRAIL_MIN_DWELL_SECS
    /// - TASKTRAIL_RETRY_INTERVAL_SECS
    /// - TASKTRAIL_CACHE_MAX_WEIGHT_BYTES (both caches)
    /// - TASKTRAIL_CACHE_TTL_SECS
    /// - TASKTRAIL_PERSISTENCE_STRATEGY (memory | file)
    /// - TASKTRAIL_DATA_DIR
    /// - TASKTRAIL_TERMINATION_TIMEOUT_SECS
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> CoreResult<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_var("TASKTRAIL_INTAKE_CAPACITY") {
            self.intake.capacity = v;
        }
        if let Some(v) = env_var("TASKTRAIL_OVERFLOW_CAPACITY") {
            self.intake.overflow_capacity = v;
        }
        if let Some(v) = env_var("TASKTRAIL_BATCH_INTERVAL_MS") {
            self.batch.interval_ms = v;
        }
        if let Some(v) = env_var("TASKTRAIL_MAX_EVENTS_PER_CYCLE") {
            self.batch.max_events_per_cycle = v;
        }
        if let Some(v) = env_var("TASKTRAIL_DEFAULT_MAX_CHARS") {
            self.trim.default_max_chars = v;
        }
        if let Some(v) = env_var("TASKTRAIL_MAX_INSERT_TRIES") {
            self.retry.max_insert_tries = v;
        }
        if let Some(v) = env_var("TASKTRAIL_MIN_DWELL_SECS") {
            self.retry.min_dwell_secs = v;
        }
        if let Some(v) = env_var("TASKTRAIL_RETRY_INTERVAL_SECS") {
            self.retry.interval_secs = v;
        }
        if let Some(v) = env_var("TASKTRAIL_CACHE_MAX_WEIGHT_BYTES") {
            self.cache.task_max_weight_bytes = v;
            self.cache.orphan_max_weight_bytes = v;
        }
        if let Some(v) = env_var("TASKTRAIL_CACHE_TTL_SECS") {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = env_var("TASKTRAIL_PERSISTENCE_STRATEGY") {
            self.persistence.strategy = v;
        }
        if let Some(v) = env_var::<PathBuf>("TASKTRAIL_DATA_DIR") {
            self.persistence.path = v;
        }
        if let Some(v) = env_var("TASKTRAIL_TERMINATION_TIMEOUT_SECS") {
            self.shutdown.termination_timeout_secs = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.intake.capacity == 0 {
            return Err(CoreError::Config("intake.capacity must be > 0".into()));
        }
        if self.intake.overflow_capacity == 0 {
            return Err(CoreError::Config(
                "intake.overflow_capacity must be > 0".into(),
            ));
        }
        if self.batch.interval_ms == 0 {
            return Err(CoreError::Config("batch.interval_ms must be > 0".into()));
        }
        if self.batch.max_events_per_cycle == 0 {
            return Err(CoreError::Config(
                "batch.max_events_per_cycle must be > 0".into(),
            ));
        }
        if self.batch.max_adoption_rounds == 0 {
            return Err(CoreError::Config(
                "batch.max_adoption_rounds must be > 0".into(),
            ));
        }
        if self.retry.max_insert_tries == 0 {
            return Err(CoreError::Config("retry.max_insert_tries must be > 0".into()));
        }
        if self.retry.lock_lease_secs == 0 {
            return Err(CoreError::Config("retry.lock_lease_secs must be > 0".into()));
        }
        if self.retry.interval_secs == 0 {
            return Err(CoreError::Config("retry.interval_secs must be > 0".into()));
        }
        if let Some(plugins) = &self.batch.plugins_json {
            serde_json::from_str::<serde_json::Value>(plugins)
                .map_err(|e| CoreError::Config(format!("batch.plugins_json: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = IndexerConfig::default();
        assert_eq!(config.retry.max_insert_tries, 10);
        assert_eq!(config.retry.max_fetched_bulks, 100);
        assert_eq!(config.retry.lock_lease(), Duration::from_secs(20));
        assert_eq!(config.cache.strategy, CacheStrategy::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[batch]
interval_ms = 250

[trim]
default_max_chars = 64
overrides = {{ "text.body" = 8 }}

[persistence]
strategy = "memory"
"#
        )
        .unwrap();

        let config = IndexerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.batch.interval(), Duration::from_millis(250));
        assert_eq!(config.batch.max_events_per_cycle, 100_000);
        assert_eq!(config.trim.overrides.get("text.body"), Some(&8));
        assert_eq!(config.persistence.strategy, PersistenceStrategy::Memory);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("TASKTRAIL_MAX_INSERT_TRIES", "3");
        std::env::set_var("TASKTRAIL_PERSISTENCE_STRATEGY", "memory");

        let config = IndexerConfig::from_env();
        assert_eq!(config.retry.max_insert_tries, 3);
        assert_eq!(config.persistence.strategy, PersistenceStrategy::Memory);

        std::env::remove_var("TASKTRAIL_MAX_INSERT_TRIES");
        std::env::remove_var("TASKTRAIL_PERSISTENCE_STRATEGY");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = IndexerConfig::default();
        config.intake.capacity = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_plugins_json() {
        let mut config = IndexerConfig::default();
        config.batch.plugins_json = Some("[{".into());
        assert!(config.validate().is_err());
    }
}
