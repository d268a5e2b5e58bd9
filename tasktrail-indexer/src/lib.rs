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

//! Tasktrail Indexer
//!
//! Turns a stream of task lifecycle events into merged task documents.
//!
//! ```text
//! producers -> intake -> indexing loop -> BatchProcessor -> StorageClient
//!                |                            |
//!                +-> overflow queue <---------+-> failed bulk queue
//!                          ^                            |
//!                          +------- RetryWorker <-------+
//! ```

pub mod batch;
mod blocking;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod plugins;
pub mod resolver;
pub mod retry_worker;
pub mod telemetry;
pub mod trim;

pub use batch::{BatchProcessor, IndexOutcome};
pub use error::{IndexerError, IndexerResult};
pub use intake::{IntakeQueue, IntakeStats, SubmitOutcome};
pub use pipeline::Pipeline;
pub use plugins::{PluginChain, SwitchCasePlugin, TaskLogPlugin};
pub use resolver::{ParentResolver, PendingAdoption, Resolution};
pub use retry_worker::{RetryStats, RetryWorker};
pub use telemetry::{init_tracing, LogFormat};
