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

//! Per-batch enrichment plugins.
//!
//! Plugins run in order over the events of one environment before parent
//! resolution. A failing plugin (error or panic) is logged and skipped;
//! the batch continues with whatever the plugin left behind.
//!
//! ## Configuration
//!
//! ```json
//! [
//!   {
//!     "type": "switch_case",
//!     "name": "error-kind",
//!     "task_name": "http_call",
//!     "search_field": "text.exception",
//!     "output_attribute": "errorType",
//!     "cases": [
//!       { "contains": ["timeout", "timed out"], "output": "timeout" },
//!       { "contains": ["refused"], "output": "connection" }
//!     ],
//!     "default_output": "other"
//!   }
//! ]
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tasktrail_core::{Event, MetadataEvent};

use crate::error::{IndexerError, IndexerResult};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

pub trait TaskLogPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, events: &mut [Event]) -> Result<(), PluginError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub contains: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCaseConfig {
    pub name: String,
    /// Only events of tasks with this name; all events when absent
    #[serde(default)]
    pub task_name: Option<String>,
    /// `string.<key>`, `text.<key>` or `ctx.<key>`
    pub search_field: String,
    /// Key of the string attribute to set
    pub output_attribute: String,
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub default_output: Option<String>,
}

/// Sets a string attribute from the first case whose phrase appears in
/// the searched field.
#[derive(Debug, Clone)]
pub struct SwitchCasePlugin {
    config: SwitchCaseConfig,
}

impl SwitchCasePlugin {
    pub fn new(config: SwitchCaseConfig) -> IndexerResult<Self> {
        if field_source(&config.search_field).is_none() {
            return Err(IndexerError::Plugin {
                name: config.name.clone(),
                message: format!("unsupported search field {:?}", config.search_field),
            });
        }
        Ok(Self { config })
    }
}

fn field_source(field: &str) -> Option<(&str, &str)> {
    let (prefix, key) = field.split_once('.')?;
    matches!(prefix, "string" | "text" | "ctx").then_some((prefix, key))
}

fn field_value<'a>(event: &'a Event, field: &str) -> Option<&'a String> {
    let (prefix, key) = field_source(field)?;
    match prefix {
        "string" => event.strings.get(key),
        "text" => event.texts.get(key),
        _ => event.context.get(key),
    }
}

impl TaskLogPlugin for SwitchCasePlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn apply(&self, events: &mut [Event]) -> Result<(), PluginError> {
        for event in events.iter_mut() {
            if let Some(wanted) = &self.config.task_name {
                if event.name.as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }
            let Some(value) = field_value(event, &self.config.search_field) else {
                continue;
            };
            let output = self
                .config
                .cases
                .iter()
                .find(|case| case.contains.iter().any(|phrase| value.contains(phrase.as_str())))
                .map(|case| case.output.clone())
                .or_else(|| self.config.default_output.clone());
            if let Some(output) = output {
                event
                    .strings
                    .insert(self.config.output_attribute.clone(), output);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PluginDefinition {
    SwitchCase(SwitchCaseConfig),
}

/// Ordered list of plugins applied to each batch.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn TaskLogPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the JSON definition list.
    pub fn from_json(json: &str) -> IndexerResult<Self> {
        let definitions: Vec<PluginDefinition> = serde_json::from_str(json)?;
        let mut chain = Self::new();
        for definition in definitions {
            match definition {
                PluginDefinition::SwitchCase(config) => {
                    chain = chain.with(SwitchCasePlugin::new(config)?);
                }
            }
        }
        Ok(chain)
    }

    pub fn with(mut self, plugin: impl TaskLogPlugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin, returning one metadata record per plugin and the
    /// total time spent, in milliseconds.
    pub fn apply_all(&self, events: &mut [Event], env: &str) -> (Vec<MetadataEvent>, u64) {
        let mut records = Vec::with_capacity(self.plugins.len());
        let mut total_ms = 0;
        for plugin in &self.plugins {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| plugin.apply(events)));
            let duration_ms = started.elapsed().as_millis() as u64;
            total_ms += duration_ms;

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(
                    panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "plugin panicked".to_string()),
                ),
            };
            if let Some(message) = &error {
                tracing::error!(plugin = plugin.name(), env, error = %message, "Plugin failed");
            }
            records.push(MetadataEvent::PluginApplied {
                time: Utc::now(),
                env: env.to_string(),
                plugin: plugin.name().to_string(),
                duration_ms,
                error,
            });
        }
        (records, total_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl TaskLogPlugin for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn apply(&self, _events: &mut [Event]) -> Result<(), PluginError> {
            panic!("boom");
        }
    }

    struct Refusing;

    impl TaskLogPlugin for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn apply(&self, _events: &mut [Event]) -> Result<(), PluginError> {
            Err(PluginError("not today".into()))
        }
    }

    const CONFIG: &str = r#"[{
        "type": "switch_case",
        "name": "error-kind",
        "task_name": "http_call",
        "search_field": "text.exception",
        "output_attribute": "errorType",
        "cases": [
            { "contains": ["timeout", "timed out"], "output": "timeout" },
            { "contains": ["refused"], "output": "connection" }
        ],
        "default_output": "other"
    }]"#;

    fn start(id: &str, name: &str, exception: &str) -> Event {
        Event::start(id, name, Utc::now(), None).with_text("exception", exception)
    }

    #[test]
    fn test_switch_case_from_json() {
        let chain = PluginChain::from_json(CONFIG).unwrap();
        assert_eq!(chain.len(), 1);

        let mut events = vec![
            start("a", "http_call", "read timed out"),
            start("b", "http_call", "connection refused"),
            start("c", "http_call", "disk full"),
            start("d", "db_call", "timeout"),
        ];
        let (records, _) = chain.apply_all(&mut events, "default");

        assert_eq!(events[0].strings["errorType"], "timeout");
        assert_eq!(events[1].strings["errorType"], "connection");
        assert_eq!(events[2].strings["errorType"], "other");
        assert!(!events[3].strings.contains_key("errorType"));
        assert!(matches!(&records[0], MetadataEvent::PluginApplied { error: None, .. }));
    }

    #[test]
    fn test_failures_are_isolated() {
        let chain = PluginChain::from_json(CONFIG)
            .unwrap()
            .with(Exploding)
            .with(Refusing);
        let mut events = vec![start("a", "http_call", "timeout")];

        let (records, _) = chain.apply_all(&mut events, "default");
        assert_eq!(records.len(), 3);
        assert_eq!(events[0].strings["errorType"], "timeout");
        match &records[1] {
            MetadataEvent::PluginApplied { plugin, error, .. } => {
                assert_eq!(plugin, "exploding");
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(matches!(
            &records[2],
            MetadataEvent::PluginApplied { error: Some(_), .. }
        ));
    }

    #[test]
    fn test_unknown_search_field_is_rejected() {
        let json = CONFIG.replace("text.exception", "body");
        assert!(matches!(
            PluginChain::from_json(&json),
            Err(IndexerError::Plugin { .. })
        ));
    }
}
