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

//! Runs synchronous persistence and cache work off the async workers.
//!
//! The file backend does plain filesystem I/O, so anything that may reach
//! it goes through [`run_blocking`].

use crate::error::{IndexerError, IndexerResult};

pub(crate) async fn run_blocking<F, T, E>(f: F) -> IndexerResult<T>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<IndexerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IndexerError::Task(format!("Blocking task panicked: {}", e)))?
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktrail_storage::StorageError;

    #[tokio::test]
    async fn test_result_and_error_pass_through() {
        let value = run_blocking(|| Ok::<_, StorageError>(21 * 2)).await.unwrap();
        assert_eq!(value, 42);

        let failed = run_blocking(|| Err::<(), _>(StorageError::Unavailable("closed".into()))).await;
        assert!(matches!(failed, Err(IndexerError::Storage(_))));
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let result = run_blocking(|| -> Result<(), StorageError> { panic!("boom") }).await;
        assert!(matches!(result, Err(IndexerError::Task(_))));
    }
}
