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

//! Merged task records and the partial updates applied to them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event::Event;
use crate::status::{self, Lifecycle, TaskStatus};

/// The merged, persisted view of one task id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub lifecycle: Lifecycle,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub primary_id: Option<String>,
    pub parents_path: Option<Vec<String>>,
    pub orphan: Option<bool>,
    pub context: HashMap<String, String>,
    pub strings: HashMap<String, String>,
    pub texts: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub log: Option<String>,
    pub env: Option<String>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.lifecycle.status
    }

    /// Fold a sequence of events for the same task, in arrival order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Task {
        let mut task = Task::default();
        for event in events {
            task.apply(&TaskUpdate::from_event(event));
        }
        task
    }

    /// Apply a partial update the same way the document store does.
    pub fn apply(&mut self, update: &TaskUpdate) {
        if update.orphan == Some(false) {
            self.orphan = Some(false);
        }
        if let Some(lifecycle) = &update.lifecycle {
            self.lifecycle = status::merge(&self.lifecycle, lifecycle);
        }
        if update.name.is_some() {
            self.name = update.name.clone();
        }
        if update.parent_id.is_some() {
            self.parent_id = update.parent_id.clone();
        }
        if update.primary_id.is_some() {
            self.primary_id = update.primary_id.clone();
        }
        if update.parents_path.is_some() {
            self.parents_path = update.parents_path.clone();
        }
        if update.env.is_some() {
            self.env = update.env.clone();
        }

        extend(&mut self.context, &update.context);
        extend(&mut self.strings, &update.strings);
        extend(&mut self.texts, &update.texts);
        self.metrics
            .extend(update.metrics.iter().map(|(k, v)| (k.clone(), *v)));

        // A re-delivered update ends the log already; skip it.
        if let Some(line) = &update.log {
            self.log = Some(match self.log.take() {
                Some(existing) if ends_with_entry(&existing, line) => existing,
                Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
                _ => line.clone(),
            });
        }

        // An adopted task never falls back to orphan.
        if update.orphan == Some(true) && self.orphan != Some(false) {
            self.orphan = Some(true);
        }
    }

    /// Whether this task can hand its primary id and ancestry to children.
    pub fn can_adopt(&self) -> bool {
        matches!(
            self.status(),
            TaskStatus::Unterminated | TaskStatus::Success | TaskStatus::Error
        ) && self.orphan != Some(true)
    }

    pub fn is_orphan(&self) -> bool {
        self.orphan == Some(true)
    }

    /// Ancestry handed down to a child: own path plus own name.
    pub fn path_for_children(&self) -> Option<Vec<String>> {
        child_path(self.parents_path.as_deref(), self.name.as_deref())
    }

    /// Only the fields needed to resolve parents, for caching.
    pub fn cache_projection(&self) -> Task {
        Task {
            lifecycle: self.lifecycle.clone(),
            name: self.name.clone(),
            parent_id: self.parent_id.clone(),
            primary_id: self.primary_id.clone(),
            parents_path: self.parents_path.clone(),
            orphan: self.orphan,
            context: self.context.clone(),
            env: self.env.clone(),
            ..Task::default()
        }
    }
}

/// `parent_path + [parent_name]`, with an empty name left out.
pub fn child_path(parent_path: Option<&[String]>, parent_name: Option<&str>) -> Option<Vec<String>> {
    let mut path: Vec<String> = parent_path.map(|p| p.to_vec()).unwrap_or_default();
    if let Some(name) = parent_name.filter(|n| !n.is_empty()) {
        path.push(name.to_string());
    }
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn ends_with_entry(log: &str, entry: &str) -> bool {
    log == entry
        || log
            .strip_suffix(entry)
            .map_or(false, |head| head.ends_with('\n'))
}

fn extend(target: &mut HashMap<String, String>, source: &HashMap<String, String>) {
    target.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// A partial document written for one task id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: String,
    pub lifecycle: Option<Lifecycle>,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub primary_id: Option<String>,
    pub parents_path: Option<Vec<String>>,
    pub orphan: Option<bool>,
    pub context: HashMap<String, String>,
    pub strings: HashMap<String, String>,
    pub texts: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub log: Option<String>,
    pub env: Option<String>,
}

impl TaskUpdate {
    pub fn from_event(event: &Event) -> Self {
        Self {
            task_id: event.task_id.clone(),
            lifecycle: Some(event.lifecycle()),
            name: event.name.clone(),
            parent_id: event.parent_id.clone(),
            primary_id: event.primary_id.clone(),
            parents_path: event.parents_path.clone(),
            orphan: event.orphan,
            context: event.context.clone(),
            strings: event.strings.clone(),
            texts: event.texts.clone(),
            metrics: event.metrics.clone(),
            log: event.log.clone(),
            env: Some(event.env.clone()),
        }
    }

    /// Everything a batch learned about a task.
    pub fn from_task(task_id: impl Into<String>, task: &Task) -> Self {
        Self {
            task_id: task_id.into(),
            lifecycle: Some(task.lifecycle.clone()),
            name: task.name.clone(),
            parent_id: task.parent_id.clone(),
            primary_id: task.primary_id.clone(),
            parents_path: task.parents_path.clone(),
            orphan: task.orphan,
            context: task.context.clone(),
            strings: task.strings.clone(),
            texts: task.texts.clone(),
            metrics: task.metrics.clone(),
            log: task.log.clone(),
            env: task.env.clone(),
        }
    }

    /// Ancestry fields for a task adopted after it was already indexed.
    pub fn adoption(task_id: impl Into<String>, task: &Task) -> Self {
        Self {
            task_id: task_id.into(),
            primary_id: task.primary_id.clone(),
            parents_path: task.parents_path.clone(),
            context: task.context.clone(),
            orphan: Some(false),
            ..Self::default()
        }
    }
}
