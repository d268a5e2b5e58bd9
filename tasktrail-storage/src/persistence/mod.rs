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

//! Durable backends for retry queues, shared cache entries and leases.
//!
//! A backend exposes three primitives:
//! - named queues of members ordered by a numeric score (oldest first),
//! - a key/value store with optional TTL,
//! - lease locks that expire if the holder disappears.
//!
//! [`MemoryBackend`] lives in process; [`FileBackend`] survives restarts and
//! is safe to share between processes on the same volume.

mod file;
mod lock;
mod memory;
mod queue;

pub use file::FileBackend;
pub use lock::{LockGuard, LockInfo, LockToken};
pub use memory::MemoryBackend;
pub use queue::DurableQueue;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::error::StorageResult;

/// Score for entries pushed right now: milliseconds since the epoch.
pub fn now_score() -> i64 {
    Utc::now().timestamp_millis()
}

pub trait PersistenceBackend: Send + Sync {
    /// Add `member` to `queue` with the given ordering score.
    fn push_to_queue(&self, queue: &str, member: &str, score: i64) -> StorageResult<()>;

    /// Atomically remove and return up to `count` lowest-score members.
    fn pop_oldest(&self, queue: &str, count: usize) -> StorageResult<Vec<String>>;

    /// Score of the oldest member, if any.
    fn min_score(&self, queue: &str) -> StorageResult<Option<i64>>;

    fn queue_size(&self, queue: &str) -> StorageResult<usize>;

    /// Values for the keys that exist and have not expired.
    fn get_from_store(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>>;

    fn put_to_store(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StorageResult<()>;

    fn delete_from_store(&self, keys: &[String]) -> StorageResult<()>;

    /// Try to take the named lease. `None` if someone else holds it.
    fn lock(&self, name: &str, lease: Duration) -> StorageResult<Option<LockToken>>;

    /// Release a lease taken with [`lock`](Self::lock). Releasing a lease
    /// that has since been taken over is a no-op.
    fn release(&self, token: &LockToken) -> StorageResult<()>;

    /// Whether the backend finished initialisation and is usable.
    fn is_created_successfully(&self) -> bool;

    fn close(&self) -> StorageResult<()>;
}
