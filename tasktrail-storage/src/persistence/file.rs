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

//! Directory-backed persistence.
//!
//! Layout under the root directory:
//!
//! ```text
//! queues/<queue>/<score:020>-<uuid>   file content = member
//! store/<blake3(key)>.bin             bincode StoredEntry
//! locks/<name>.lock                   JSON LockInfo
//! ```
//!
//! Popping a queue entry is a file removal, and only one process can remove
//! a given file, so concurrent poppers never return the same member. Store
//! writes go through a temp file and a rename. Locks are published with
//! `hard_link`, which refuses to overwrite, so one process wins a free lease.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{LockInfo, LockToken, PersistenceBackend};
use crate::error::{StorageError, StorageResult};

const QUEUES_DIR: &str = "queues";
const STORE_DIR: &str = "store";
const LOCKS_DIR: &str = "locks";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    /// Epoch millis; `None` never expires
    expires_at: Option<i64>,
    value: Vec<u8>,
}

pub struct FileBackend {
    root: PathBuf,
    closed: AtomicBool,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [QUEUES_DIR, STORE_DIR, LOCKS_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {:?}: {}", root.join(dir), e))
            })?;
        }
        tracing::info!(path = ?root, "Opened file persistence backend");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(format!(
                "file backend {:?} closed",
                self.root
            )));
        }
        Ok(())
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(QUEUES_DIR).join(sanitize(queue))
    }

    fn store_path(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.root
            .join(STORE_DIR)
            .join(format!("{}.bin", hex::encode(digest.as_bytes())))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", sanitize(name)))
    }

    /// Entry file names of a queue, oldest first.
    fn sorted_entries(&self, queue: &str) -> StorageResult<Vec<String>> {
        let dir = self.queue_dir(queue);
        let reader = match fs::read_dir(&dir) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in reader {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TMP_SUFFIX) {
                names.push(name);
            }
        }
        // Zero-padded scores sort lexicographically in score order.
        names.sort();
        Ok(names)
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let tmp = Self::tmp_path(path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_lock(&self, path: &Path) -> StorageResult<Option<LockInfo>> {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(info) => Ok(Some(info)),
                Err(e) => Err(StorageError::CorruptEntry {
                    key: path.display().to_string(),
                    reason: e.to_string(),
                }),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension(format!("{}{}", Uuid::new_v4().simple(), TMP_SUFFIX))
    }

    /// Publish a lease file with its content in one step: `hard_link` fails
    /// when the target exists, so readers never see a half-written lock.
    fn try_create_lock(&self, path: &Path, name: &str, lease: Duration) -> StorageResult<Option<LockToken>> {
        let info = LockInfo::new(lease);
        let tmp = Self::tmp_path(path);
        fs::write(&tmp, serde_json::to_vec(&info)?)?;
        let linked = fs::hard_link(&tmp, path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(Some(LockToken::new(name, &info))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an expired lease out of the way. Returns false if the file we
    /// moved turned out to be a live lease taken by someone else meanwhile.
    fn evict_stale_lock(&self, path: &Path, stale_holder: Option<&str>) -> StorageResult<bool> {
        let grave = Self::tmp_path(path);
        match fs::rename(path, &grave) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        let moved = self.read_lock(&grave).ok().flatten();
        let displaced_live = moved
            .as_ref()
            .is_some_and(|info| Some(info.holder_id.as_str()) != stale_holder && !info.is_expired());
        if displaced_live {
            let _ = fs::hard_link(&grave, path);
        }
        let _ = fs::remove_file(&grave);
        Ok(!displaced_live)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn parse_score(file_name: &str) -> Option<i64> {
    file_name.split('-').next()?.parse().ok()
}

impl PersistenceBackend for FileBackend {
    fn push_to_queue(&self, queue: &str, member: &str, score: i64) -> StorageResult<()> {
        self.ensure_open()?;
        let dir = self.queue_dir(queue);
        fs::create_dir_all(&dir)?;
        let name = format!("{:020}-{}", score.max(0), Uuid::new_v4().simple());
        self.write_atomically(&dir.join(name), member.as_bytes())
    }

    fn pop_oldest(&self, queue: &str, count: usize) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let dir = self.queue_dir(queue);
        let mut popped = Vec::new();
        for name in self.sorted_entries(queue)? {
            if popped.len() >= count {
                break;
            }
            let path = dir.join(&name);
            let member = match fs::read_to_string(&path) {
                Ok(member) => member,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match fs::remove_file(&path) {
                Ok(()) => popped.push(member),
                // Another process popped it between our read and remove.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(popped)
    }

    fn min_score(&self, queue: &str) -> StorageResult<Option<i64>> {
        self.ensure_open()?;
        Ok(self
            .sorted_entries(queue)?
            .first()
            .and_then(|name| parse_score(name)))
    }

    fn queue_size(&self, queue: &str) -> StorageResult<usize> {
        self.ensure_open()?;
        Ok(self.sorted_entries(queue)?.len())
    }

    fn get_from_store(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>> {
        self.ensure_open()?;
        let now = Utc::now().timestamp_millis();
        let mut found = HashMap::new();
        for key in keys {
            let path = self.store_path(key);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let entry: StoredEntry = match bincode::deserialize(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping unreadable store entry");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            if entry.expires_at.is_some_and(|at| at <= now) {
                let _ = fs::remove_file(&path);
                continue;
            }
            if entry.key == *key {
                found.insert(key.clone(), entry.value);
            }
        }
        Ok(found)
    }

    fn put_to_store(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StorageResult<()> {
        self.ensure_open()?;
        let expires_at = ttl.map(|ttl| {
            Utc::now().timestamp_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
        });
        let entry = StoredEntry {
            key: key.to_string(),
            expires_at,
            value: value.to_vec(),
        };
        self.write_atomically(&self.store_path(key), &bincode::serialize(&entry)?)
    }

    fn delete_from_store(&self, keys: &[String]) -> StorageResult<()> {
        self.ensure_open()?;
        for key in keys {
            match fs::remove_file(self.store_path(key)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn lock(&self, name: &str, lease: Duration) -> StorageResult<Option<LockToken>> {
        self.ensure_open()?;
        let path = self.lock_path(name);
        if let Some(token) = self.try_create_lock(&path, name, lease)? {
            return Ok(Some(token));
        }

        let stale_holder = match self.read_lock(&path) {
            Ok(Some(info)) if info.is_expired() => Some(info.holder_id),
            Ok(Some(_)) => return Ok(None),
            // Released between our create attempt and the read.
            Ok(None) => None,
            Err(StorageError::CorruptEntry { key, reason }) => {
                tracing::warn!(lock = %key, %reason, "Replacing unreadable lock file");
                None
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(lock = name, "Taking over expired lock");
        if !self.evict_stale_lock(&path, stale_holder.as_deref())? {
            return Ok(None);
        }
        // Lost the race to another process if this fails.
        self.try_create_lock(&path, name, lease)
    }

    fn release(&self, token: &LockToken) -> StorageResult<()> {
        let path = self.lock_path(&token.name);
        match self.read_lock(&path)? {
            Some(info) if info.holder_id == token.holder_id => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Some(_) => {
                tracing::warn!(lock = %token.name, "Lock was taken over before release");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_created_successfully(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && [QUEUES_DIR, STORE_DIR, LOCKS_DIR]
                .iter()
                .all(|dir| self.root.join(dir).is_dir())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
