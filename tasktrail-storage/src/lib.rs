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

//! Tasktrail Storage
//!
//! Everything the indexer keeps outside its own batch cycle:
//! - `persistence`: durable queues, key/value entries and lease locks
//! - `retry`: failed-bulk and overflow queues built on top of it
//! - `cache`: advisory task and orphan caches
//! - `client`: the document store seam

pub mod cache;
pub mod client;
pub mod error;
pub mod persistence;
pub mod retry;

pub use cache::{build_caches, OrphanCache, TaskCache};
pub use client::{Bulk, BulkResponse, ItemFailure, MemoryStorageClient, StorageClient};
pub use error::{StorageError, StorageResult};
pub use persistence::{FileBackend, MemoryBackend, PersistenceBackend};
pub use retry::{DbBulkRequest, RetryStore};
