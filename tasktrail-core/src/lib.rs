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

//! Tasktrail Core
//!
//! Data model shared by the storage layer and the indexer: lifecycle
//! events, merged task records, the status merge state machine, pipeline
//! metadata records and configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod metadata;
pub mod status;
pub mod task;

pub use config::IndexerConfig;
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventKind, DEFAULT_ENV, HEARTBEAT_TASK_NAME};
pub use metadata::{IndexStatus, MetadataEvent};
pub use status::{merge, Closure, CorruptedReason, Lifecycle, TaskStatus};
pub use task::{Task, TaskUpdate};
