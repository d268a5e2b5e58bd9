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

//! Task status merge state machine.
//!
//! A task becomes `SUCCESS`/`ERROR` once its start and exactly one matching
//! close have been seen. `PARTIAL_*` states hold whichever half arrived first.
//! Transitions that cannot both be true (two start times, two close times,
//! two close statuses) land in `CORRUPTED` with a reason code instead of
//! overwriting what is already stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unterminated,
    Success,
    Error,
    PartialSuccess,
    PartialError,
    PartialInfoOnly,
    Corrupted,
}

/// How a task was closed, independent of whether its start was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    Success,
    Error,
}

impl TaskStatus {
    pub fn closure(self) -> Option<Closure> {
        match self {
            TaskStatus::Success | TaskStatus::PartialSuccess => Some(Closure::Success),
            TaskStatus::Error | TaskStatus::PartialError => Some(Closure::Error),
            _ => None,
        }
    }

    /// Whether the status records a start timestamp.
    pub fn has_start(self) -> bool {
        matches!(
            self,
            TaskStatus::Unterminated | TaskStatus::Success | TaskStatus::Error
        )
    }

    pub fn is_complete(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Unterminated => "UNTERMINATED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Error => "ERROR",
            TaskStatus::PartialSuccess => "PARTIAL_SUCCESS",
            TaskStatus::PartialError => "PARTIAL_ERROR",
            TaskStatus::PartialInfoOnly => "PARTIAL_INFO_ONLY",
            TaskStatus::Corrupted => "CORRUPTED",
        }
    }

    fn from_parts(started: bool, closure: Option<Closure>) -> TaskStatus {
        match (started, closure) {
            (true, Some(Closure::Success)) => TaskStatus::Success,
            (true, Some(Closure::Error)) => TaskStatus::Error,
            (false, Some(Closure::Success)) => TaskStatus::PartialSuccess,
            (false, Some(Closure::Error)) => TaskStatus::PartialError,
            (true, None) => TaskStatus::Unterminated,
            (false, None) => TaskStatus::PartialInfoOnly,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to a `CORRUPTED` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorruptedReason {
    AlreadyStartedDifferentStartTime,
    AlreadyClosedDifferentCloseStatus,
    AlreadyClosedDifferentCloseTime,
}

impl CorruptedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptedReason::AlreadyStartedDifferentStartTime => {
                "ALREADY_STARTED_DIFFERENT_START_TIME"
            }
            CorruptedReason::AlreadyClosedDifferentCloseStatus => {
                "ALREADY_CLOSED_DIFFERENT_CLOSE_STATUS"
            }
            CorruptedReason::AlreadyClosedDifferentCloseTime => "ALREADY_CLOSED_DIFFERENT_CLOSE_TIME",
        }
    }
}

impl fmt::Display for CorruptedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the timing fields the state machine reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: TaskStatus,
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub corrupted_reason: Option<CorruptedReason>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::info_only()
    }
}

impl Lifecycle {
    /// Nothing known about start or close yet.
    pub fn info_only() -> Self {
        Self {
            status: TaskStatus::PartialInfoOnly,
            begin: None,
            end: None,
            duration_ms: None,
            corrupted_reason: None,
        }
    }

    pub fn started(begin: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Unterminated,
            begin: Some(begin),
            ..Self::info_only()
        }
    }

    /// A close event whose start has not been seen.
    pub fn closed(closure: Closure, end: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::from_parts(false, Some(closure)),
            end: Some(end),
            ..Self::info_only()
        }
    }

    /// A task that starts and finishes at the same instant.
    pub fn spot(time: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Success,
            begin: Some(time),
            end: Some(time),
            duration_ms: Some(0),
            corrupted_reason: None,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.status == TaskStatus::Corrupted
    }

    fn corrupted(current: &Lifecycle, incoming: &Lifecycle, reason: CorruptedReason) -> Self {
        Self {
            status: TaskStatus::Corrupted,
            begin: current.begin.or(incoming.begin),
            end: current.end.or(incoming.end),
            duration_ms: None,
            corrupted_reason: Some(reason),
        }
    }

    /// Corrupted lifecycles still pick up missing timing for diagnostics.
    fn record_timing(&self, other: &Lifecycle) -> Self {
        Self {
            begin: self.begin.or(other.begin),
            end: self.end.or(other.end),
            ..self.clone()
        }
    }
}

/// Merge an incoming partial lifecycle into the stored one.
///
/// Pure and deterministic: the same pair always yields the same result, and
/// re-applying an already merged update is a no-op.
pub fn merge(current: &Lifecycle, incoming: &Lifecycle) -> Lifecycle {
    use TaskStatus::*;

    match (current.status, incoming.status) {
        (_, PartialInfoOnly) => current.clone(),
        (Corrupted, _) => current.record_timing(incoming),
        (PartialInfoOnly, _) => incoming.clone(),
        (_, Corrupted) => incoming.record_timing(current),
        _ => merge_consistent(current, incoming),
    }
}

fn merge_consistent(current: &Lifecycle, incoming: &Lifecycle) -> Lifecycle {
    if let (Some(a), Some(b)) = (current.begin, incoming.begin) {
        if a != b {
            return Lifecycle::corrupted(
                current,
                incoming,
                CorruptedReason::AlreadyStartedDifferentStartTime,
            );
        }
    }

    let current_closure = current.status.closure();
    let incoming_closure = incoming.status.closure();
    if let (Some(a), Some(b)) = (current_closure, incoming_closure) {
        if a != b {
            return Lifecycle::corrupted(
                current,
                incoming,
                CorruptedReason::AlreadyClosedDifferentCloseStatus,
            );
        }
        if let (Some(x), Some(y)) = (current.end, incoming.end) {
            if x != y {
                return Lifecycle::corrupted(
                    current,
                    incoming,
                    CorruptedReason::AlreadyClosedDifferentCloseTime,
                );
            }
        }
    }

    let begin = current.begin.or(incoming.begin);
    let end = current.end.or(incoming.end);
    let closure = current_closure.or(incoming_closure);
    let status = TaskStatus::from_parts(begin.is_some(), closure);
    let duration_ms = match (status.is_complete(), begin, end) {
        (true, Some(b), Some(e)) => Some((e - b).num_milliseconds()),
        _ => None,
    };

    Lifecycle {
        status,
        begin,
        end,
        duration_ms,
        corrupted_reason: None,
    }
}
