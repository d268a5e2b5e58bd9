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

//! Task lifecycle events as emitted by instrumented application code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::status::{Closure, Lifecycle};

/// Name reserved for client liveness pings. Heartbeats are routed to
/// metadata and never become tasks.
pub const HEARTBEAT_TASK_NAME: &str = "tasktrail_client_heartbeat";

/// Environment used when the emitter does not set one.
pub const DEFAULT_ENV: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Start,
    Info,
    Success,
    Error,
    /// A task reported in one shot, already finished.
    Spot,
}

/// A single lifecycle event for one task.
///
/// Several events share a `task_id`; the indexer folds them into a
/// [`Task`](crate::task::Task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub task_id: String,
    pub name: Option<String>,
    pub time: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub primary_id: Option<String>,
    pub context: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub strings: HashMap<String, String>,
    pub texts: HashMap<String, String>,
    pub log: Option<String>,
    pub parents_path: Option<Vec<String>>,
    pub env: String,
    pub orphan: Option<bool>,
}

impl Event {
    fn bare(kind: EventKind, task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            name: None,
            time,
            parent_id: None,
            primary_id: None,
            context: HashMap::new(),
            metrics: HashMap::new(),
            strings: HashMap::new(),
            texts: HashMap::new(),
            log: None,
            parents_path: None,
            env: DEFAULT_ENV.to_string(),
            orphan: None,
        }
    }

    /// Start a task. A root task (no parent) is its own primary.
    pub fn start(
        task_id: impl Into<String>,
        name: impl Into<String>,
        time: DateTime<Utc>,
        parent_id: Option<String>,
    ) -> Self {
        let mut event = Self::bare(EventKind::Start, task_id, time);
        event.name = Some(name.into());
        if parent_id.is_none() {
            event.primary_id = Some(event.task_id.clone());
        }
        event.parent_id = parent_id;
        event
    }

    pub fn info(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::bare(EventKind::Info, task_id, time)
    }

    pub fn success(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::bare(EventKind::Success, task_id, time)
    }

    pub fn error(task_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::bare(EventKind::Error, task_id, time)
    }

    /// A finished task in one event. Without a parent it is its own primary.
    pub fn spot(
        task_id: impl Into<String>,
        name: impl Into<String>,
        time: DateTime<Utc>,
        parent_id: Option<String>,
    ) -> Self {
        let mut event = Self::bare(EventKind::Spot, task_id, time);
        event.name = Some(name.into());
        if parent_id.is_none() {
            event.primary_id = Some(event.task_id.clone());
        }
        event.parent_id = parent_id;
        event
    }

    /// Fresh task id of the form `<name>_<uuid>`.
    pub fn new_task_id(name: &str) -> String {
        format!("{}_{}", name, Uuid::new_v4().simple())
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.texts.insert(key.into(), value.into());
        self
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.log = Some(line.into());
        self
    }

    pub fn is_start(&self) -> bool {
        self.kind == EventKind::Start
    }

    /// Start and spot events introduce a task and link it to its parent.
    pub fn opens_task(&self) -> bool {
        matches!(self.kind, EventKind::Start | EventKind::Spot)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.name.as_deref() == Some(HEARTBEAT_TASK_NAME)
    }

    /// The partial lifecycle this event contributes to its task.
    pub fn lifecycle(&self) -> Lifecycle {
        match self.kind {
            EventKind::Start => Lifecycle::started(self.time),
            EventKind::Info => Lifecycle::info_only(),
            EventKind::Success => Lifecycle::closed(Closure::Success, self.time),
            EventKind::Error => Lifecycle::closed(Closure::Error, self.time),
            EventKind::Spot => Lifecycle::spot(self.time),
        }
    }
}
