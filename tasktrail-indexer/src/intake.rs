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

//! Event intake.
//!
//! Producers hand events to an [`IntakeQueue`] without blocking. Events go
//! to a bounded main channel; when it is full they spill into a smaller
//! overflow channel that the indexing loop moves to durable storage each
//! cycle. When both are full the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use tasktrail_core::config::IntakeConfig;
use tasktrail_core::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Main buffer full; kept in the overflow buffer
    Spilled,
    /// Both buffers full
    Dropped,
    /// The pipeline no longer accepts events
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    spilled: AtomicU64,
    dropped: AtomicU64,
}

/// Intake counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub queued: u64,
    pub spilled: u64,
    pub dropped: u64,
    /// Events currently held in memory
    pub buffered: usize,
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct IntakeQueue {
    main: mpsc::Sender<Event>,
    overflow: mpsc::Sender<Event>,
    counters: Arc<Counters>,
}

/// Consumer side, owned by the indexing loop.
pub struct IntakeReceiver {
    main: mpsc::Receiver<Event>,
    overflow: mpsc::Receiver<Event>,
}

pub fn channel(config: &IntakeConfig) -> (IntakeQueue, IntakeReceiver) {
    let (main_tx, main_rx) = mpsc::channel(config.capacity.max(1));
    let (overflow_tx, overflow_rx) = mpsc::channel(config.overflow_capacity.max(1));
    (
        IntakeQueue {
            main: main_tx,
            overflow: overflow_tx,
            counters: Arc::new(Counters::default()),
        },
        IntakeReceiver {
            main: main_rx,
            overflow: overflow_rx,
        },
    )
}

impl IntakeQueue {
    /// Never blocks.
    pub fn submit(&self, event: Event) -> SubmitOutcome {
        let event = match self.main.try_send(event) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                return SubmitOutcome::Queued;
            }
            Err(TrySendError::Closed(_)) => return SubmitOutcome::Closed,
            Err(TrySendError::Full(event)) => event,
        };

        let task_id = event.task_id.clone();
        match self.overflow.try_send(event) {
            Ok(()) => {
                self.counters.spilled.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task_id = %task_id, "Intake queue full, spilling event to overflow");
                SubmitOutcome::Spilled
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(task_id = %task_id, dropped, "Intake and overflow queues full, dropping event");
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SubmitOutcome::Closed,
        }
    }

    pub fn submit_batch(&self, events: impl IntoIterator<Item = Event>) -> Vec<SubmitOutcome> {
        events.into_iter().map(|e| self.submit(e)).collect()
    }

    /// Wait for room in the main buffer instead of spilling.
    pub async fn submit_wait(&self, event: Event) -> SubmitOutcome {
        match self.main.send(event).await {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Queued
            }
            Err(_) => SubmitOutcome::Closed,
        }
    }

    /// Main buffer only; hands the event back when there is no room.
    pub fn try_enqueue(&self, event: Event) -> Result<(), Event> {
        match self.main.try_send(event) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => Err(event),
        }
    }

    pub fn buffered(&self) -> usize {
        in_flight(&self.main) + in_flight(&self.overflow)
    }

    pub fn is_closed(&self) -> bool {
        self.main.is_closed()
    }

    pub fn stats(&self) -> IntakeStats {
        IntakeStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            spilled: self.counters.spilled.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            buffered: self.buffered(),
        }
    }
}

fn in_flight<T>(sender: &mpsc::Sender<T>) -> usize {
    sender.max_capacity() - sender.capacity()
}

impl IntakeReceiver {
    /// Up to `max` events from the main buffer, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<Event> {
        drain_channel(&mut self.main, max)
    }

    pub fn drain_overflow(&mut self, max: usize) -> Vec<Event> {
        drain_channel(&mut self.overflow, max)
    }

    /// Stop accepting new events; buffered ones can still be drained.
    pub fn close(&mut self) {
        self.main.close();
        self.overflow.close();
    }
}

fn drain_channel(rx: &mut mpsc::Receiver<Event>, max: usize) -> Vec<Event> {
    let mut events = Vec::new();
    while events.len() < max {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    events
}
