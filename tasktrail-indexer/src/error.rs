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

//! Indexer error types

use thiserror::Error;

use tasktrail_core::CoreError;
use tasktrail_storage::StorageError;

/// Result type for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persistence or cache backend could not be brought up
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Plugin definition could not be loaded
    #[error("Plugin {name}: {message}")]
    Plugin { name: String, message: String },

    /// A background task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        IndexerError::Core(CoreError::from(e))
    }
}
