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

//! Records the pipeline writes about itself, next to the task index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    Success,
    PartialFailure,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataEvent {
    /// Written once when a pipeline instance comes up.
    Startup { time: DateTime<Utc>, env: String },

    /// A client liveness ping.
    Heartbeat {
        time: DateTime<Utc>,
        env: String,
        task_id: String,
        strings: HashMap<String, String>,
        metrics: HashMap<String, f64>,
    },

    PluginApplied {
        time: DateTime<Utc>,
        env: String,
        plugin: String,
        duration_ms: u64,
        error: Option<String>,
    },

    /// Summary of one batch cycle for one environment.
    Index {
        env: String,
        events_amount: usize,
        fetched_amount: usize,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        duration_ms: u64,
        status: IndexStatus,
        error: Option<String>,
        plugins_duration_ms: u64,
    },
}

impl MetadataEvent {
    pub fn heartbeat(event: &Event) -> Self {
        MetadataEvent::Heartbeat {
            time: event.time,
            env: event.env.clone(),
            task_id: event.task_id.clone(),
            strings: event.strings.clone(),
            metrics: event.metrics.clone(),
        }
    }

    pub fn env(&self) -> &str {
        match self {
            MetadataEvent::Startup { env, .. }
            | MetadataEvent::Heartbeat { env, .. }
            | MetadataEvent::PluginApplied { env, .. }
            | MetadataEvent::Index { env, .. } => env,
        }
    }
}
