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

//! Parent/orphan resolution.
//!
//! Two passes over one environment's batch:
//!
//! 1. **Enrichment.** Every start or spot event with a parent inherits the
//!    parent's primary id and missing context keys; start events also take
//!    the ancestry path. Parents opened in the same batch are enriched
//!    first, so a chain that arrives in any order resolves in one pass. A
//!    parent that cannot be found leaves the child orphaned and recorded
//!    in the orphan cache.
//!
//! 2. **Adoption.** Tasks that can hand down ancestry pull their waiting
//!    children from the orphan cache (and from orphans in the batch), the
//!    children are populated and in turn become the next round's
//!    adopters. The loop stops when a round adopts nobody, when it meets
//!    only visited tasks, or at `max_rounds`. Waiting children missing
//!    from the task cache are returned as [`PendingAdoption`]s for the
//!    caller to load from the document store.

use std::collections::{HashMap, HashSet};

use tasktrail_core::task::child_path;
use tasktrail_core::{Event, Task, TaskUpdate};
use tasktrail_storage::{OrphanCache, TaskCache};

/// What a child inherits from its parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParentProperties {
    pub primary_id: Option<String>,
    pub context: HashMap<String, String>,
    pub parents_path: Option<Vec<String>>,
    pub name: Option<String>,
}

impl ParentProperties {
    fn from_task(task: &Task) -> Self {
        Self {
            primary_id: task.primary_id.clone(),
            context: task.context.clone(),
            parents_path: task.parents_path.clone(),
            name: task.name.clone(),
        }
    }

    /// Overlay fields carried by an in-batch event of the parent.
    fn overlay(&mut self, event: &Event) {
        if event.primary_id.is_some() {
            self.primary_id = event.primary_id.clone();
        }
        if event.parents_path.is_some() {
            self.parents_path = event.parents_path.clone();
        }
        if event.name.is_some() {
            self.name = event.name.clone();
        }
        self.context
            .extend(event.context.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn child_path(&self) -> Option<Vec<String>> {
        child_path(self.parents_path.as_deref(), self.name.as_deref())
    }
}

/// A waiting child the task cache did not know. It has already left the
/// orphan cache, so it must be adopted or recorded again.
#[derive(Debug, Clone)]
pub struct PendingAdoption {
    pub child_id: String,
    pub parent_id: String,
    pub parent: Task,
}

/// Outcome of resolving one batch.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Tasks folded from the batch's events, enriched and possibly adopted
    pub received: HashMap<String, Task>,
    /// Previously indexed tasks adopted by this batch
    pub adopted: HashMap<String, Task>,
    /// Children recorded as waiting for an unknown parent
    pub orphans_recorded: usize,
    /// Children adopted, received and cached alike
    pub adoptions: usize,
    pub rounds: usize,
    pub pending: Vec<PendingAdoption>,
}

struct Adoption {
    adoptions: usize,
    rounds: usize,
    pending: Vec<PendingAdoption>,
}

pub struct ParentResolver<'a> {
    task_cache: &'a dyn TaskCache,
    orphan_cache: &'a dyn OrphanCache,
    max_rounds: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    InProgress,
    Done,
}

impl<'a> ParentResolver<'a> {
    pub fn new(task_cache: &'a dyn TaskCache, orphan_cache: &'a dyn OrphanCache, max_rounds: usize) -> Self {
        Self {
            task_cache,
            orphan_cache,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Enrich `events` in place, fold them into tasks and adopt any orphans
    /// that became resolvable. `indexed_parents` holds parents known from
    /// the cache or the store, keyed by id.
    pub fn resolve(&self, events: &mut [Event], indexed_parents: &HashMap<String, Task>) -> Resolution {
        let orphans_recorded = self.enrich_opening_events(events, indexed_parents);

        let mut received: HashMap<String, Task> = HashMap::new();
        for event in events.iter() {
            received
                .entry(event.task_id.clone())
                .or_default()
                .apply(&TaskUpdate::from_event(event));
        }

        let frontier: HashMap<String, Task> = received
            .iter()
            .filter(|(_, task)| task.can_adopt())
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect();
        let mut adopted = HashMap::new();
        let adoption = self.adopt_orphans(&mut received, &mut adopted, frontier, self.max_rounds);
        Resolution {
            received,
            adopted,
            orphans_recorded,
            adoptions: adoption.adoptions,
            rounds: adoption.rounds,
            pending: adoption.pending,
        }
    }

    /// Adopt pending children loaded from the document store, then carry
    /// on adopting their own waiting children within the remaining rounds.
    /// Children the store did not return are recorded as orphans again.
    pub fn adopt_indexed(&self, resolution: &mut Resolution, mut indexed: HashMap<String, Task>) {
        let mut frontier = HashMap::new();
        for pending in std::mem::take(&mut resolution.pending) {
            match indexed.remove(&pending.child_id) {
                Some(mut child) => {
                    populate(&mut child, &pending.parent);
                    resolution.adoptions += 1;
                    frontier.insert(pending.child_id.clone(), child.clone());
                    resolution.adopted.insert(pending.child_id, child);
                }
                None => self.orphan_cache.record_orphan(&pending.parent_id, &pending.child_id),
            }
        }

        let budget = self.max_rounds.saturating_sub(resolution.rounds);
        let adoption = self.adopt_orphans(
            &mut resolution.received,
            &mut resolution.adopted,
            frontier,
            budget,
        );
        resolution.adoptions += adoption.adoptions;
        resolution.rounds += adoption.rounds;
        resolution.pending = adoption.pending;
    }

    /// Returns the number of opening events left orphaned.
    fn enrich_opening_events(&self, events: &mut [Event], indexed_parents: &HashMap<String, Task>) -> usize {
        let mut by_task: HashMap<String, Vec<usize>> = HashMap::new();
        let mut opener_of: HashMap<String, usize> = HashMap::new();
        for (idx, event) in events.iter().enumerate() {
            by_task.entry(event.task_id.clone()).or_default().push(idx);
            if event.opens_task() {
                opener_of.entry(event.task_id.clone()).or_insert(idx);
            }
        }

        let mut orphaned = 0;
        for idx in enrichment_order(events, &opener_of) {
            let Some(parent_id) = events[idx].parent_id.clone() else {
                continue;
            };
            let props = parent_properties(&parent_id, events, &by_task, indexed_parents);
            let event = &mut events[idx];
            match props {
                Some(props) if props.primary_id.is_some() => {
                    event.primary_id = props.primary_id.clone();
                    for (key, value) in &props.context {
                        event.context.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    if event.is_start() {
                        event.parents_path = props.child_path();
                    }
                    event.orphan = Some(false);
                }
                _ => {
                    event.primary_id = None;
                    event.orphan = Some(true);
                    self.orphan_cache.record_orphan(&parent_id, &event.task_id);
                    orphaned += 1;
                }
            }
        }
        orphaned
    }

    fn adopt_orphans(
        &self,
        received: &mut HashMap<String, Task>,
        adopted: &mut HashMap<String, Task>,
        mut frontier: HashMap<String, Task>,
        max_rounds: usize,
    ) -> Adoption {
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending = Vec::new();
        let mut adoptions = 0;
        let mut rounds = 0;

        loop {
            // Without a primary id there is nothing to hand down, and pulling
            // would lose the waiting children.
            frontier.retain(|_, parent| parent.primary_id.is_some());
            if frontier.is_empty() {
                break;
            }
            if rounds >= max_rounds {
                tracing::warn!(
                    rounds,
                    pending = frontier.len(),
                    "Orphan adoption stopped at round limit"
                );
                break;
            }
            rounds += 1;
            visited.extend(frontier.keys().cloned());

            let parent_ids: Vec<String> = frontier.keys().cloned().collect();
            let mut waiting: HashMap<String, String> = HashMap::new();
            for (parent, children) in self.orphan_cache.pull_waiting_children(&parent_ids) {
                for child in children {
                    waiting.insert(child, parent.clone());
                }
            }
            for (id, task) in received.iter() {
                if let Some(parent) = task.parent_id.as_ref().filter(|_| task.is_orphan()) {
                    if frontier.contains_key(parent) {
                        waiting.insert(id.clone(), parent.clone());
                    }
                }
            }
            waiting.retain(|child, _| !visited.contains(child));
            if waiting.is_empty() {
                break;
            }

            let unknown: Vec<String> = waiting
                .keys()
                .filter(|id| !received.contains_key(*id) && !adopted.contains_key(*id))
                .cloned()
                .collect();
            let mut cached = if unknown.is_empty() {
                HashMap::new()
            } else {
                self.task_cache.get_many(&unknown)
            };

            let mut next = HashMap::new();
            for (child_id, parent_id) in waiting {
                let Some(parent) = frontier.get(&parent_id) else {
                    continue;
                };
                let child = if let Some(task) = received.get_mut(&child_id) {
                    task
                } else if let Some(task) = cached.remove(&child_id) {
                    adopted.entry(child_id.clone()).or_insert(task)
                } else if let Some(task) = adopted.get_mut(&child_id) {
                    task
                } else {
                    tracing::debug!(child_id = %child_id, parent_id = %parent_id, "Waiting child not cached, deferring to store");
                    pending.push(PendingAdoption {
                        child_id,
                        parent_id,
                        parent: parent.clone(),
                    });
                    continue;
                };
                populate(child, parent);
                adoptions += 1;
                // Adopted children hand down ancestry whatever their status.
                next.insert(child_id, child.clone());
            }
            frontier = next;
        }

        if adoptions > 0 {
            tracing::debug!(adoptions, rounds, "Adopted orphans");
        }
        Adoption {
            adoptions,
            rounds,
            pending,
        }
    }
}

/// Opening events in an order where in-batch parents come before children.
/// Iterative, and tolerant of parent cycles.
fn enrichment_order(events: &[Event], opener_of: &HashMap<String, usize>) -> Vec<usize> {
    let mut state = vec![Visit::Pending; events.len()];
    let mut order = Vec::with_capacity(opener_of.len());
    let mut roots: Vec<usize> = opener_of.values().copied().collect();
    roots.sort_unstable();

    for root in roots {
        let mut stack = vec![root];
        while let Some(&idx) = stack.last() {
            match state[idx] {
                Visit::Done => {
                    stack.pop();
                }
                Visit::InProgress => {
                    state[idx] = Visit::Done;
                    order.push(idx);
                    stack.pop();
                }
                Visit::Pending => {
                    state[idx] = Visit::InProgress;
                    let parent = events[idx]
                        .parent_id
                        .as_ref()
                        .and_then(|p| opener_of.get(p))
                        .copied();
                    if let Some(parent) = parent.filter(|p| state[*p] == Visit::Pending) {
                        stack.push(parent);
                    }
                }
            }
        }
    }
    order
}

/// Indexed parent overlaid by the parent's events in this batch.
fn parent_properties(
    parent_id: &str,
    events: &[Event],
    by_task: &HashMap<String, Vec<usize>>,
    indexed_parents: &HashMap<String, Task>,
) -> Option<ParentProperties> {
    let indexed = indexed_parents.get(parent_id);
    let in_batch = by_task.get(parent_id);
    if indexed.is_none() && in_batch.is_none() {
        return None;
    }
    let mut props = indexed.map(ParentProperties::from_task).unwrap_or_default();
    for &idx in in_batch.into_iter().flatten() {
        props.overlay(&events[idx]);
    }
    Some(props)
}

fn populate(child: &mut Task, parent: &Task) {
    child.primary_id = parent.primary_id.clone();
    for (key, value) in &parent.context {
        child.context.entry(key.clone()).or_insert_with(|| value.clone());
    }
    child.parents_path = parent.path_for_children();
    child.orphan = Some(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tasktrail_core::TaskStatus;
    use tasktrail_storage::cache::{LocalOrphanCache, LocalTaskCache};

    struct Caches {
        tasks: LocalTaskCache,
        orphans: LocalOrphanCache,
    }

    impl Caches {
        fn new() -> Self {
            Self {
                tasks: LocalTaskCache::new(1 << 24, None),
                orphans: LocalOrphanCache::new(1 << 24, None),
            }
        }

        fn resolver(&self) -> ParentResolver<'_> {
            ParentResolver::new(&self.tasks, &self.orphans, 16)
        }
    }

    fn root(id: &str, name: &str) -> Event {
        Event::start(id, name, Utc::now(), None)
    }

    fn child(id: &str, name: &str, parent: &str) -> Event {
        Event::start(id, name, Utc::now(), Some(parent.to_string()))
    }

    #[test]
    fn test_in_batch_chain_resolves_in_any_order() {
        let caches = Caches::new();
        let mut events = vec![
            child("gc", "leaf", "c"),
            child("c", "mid", "p").with_context("stage", "mid"),
            root("p", "top").with_context("stage", "top").with_context("user", "ann"),
        ];

        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        let gc = &resolution.received["gc"];
        assert_eq!(gc.primary_id.as_deref(), Some("p"));
        assert_eq!(gc.parents_path, Some(vec!["top".to_string(), "mid".to_string()]));
        // First-wins: the child's own value beats the ancestor's.
        assert_eq!(gc.context["stage"], "mid");
        assert_eq!(gc.context["user"], "ann");
        assert_eq!(resolution.orphans_recorded, 0);
    }

    #[test]
    fn test_unknown_parent_is_recorded_as_orphan() {
        let caches = Caches::new();
        let mut events = vec![child("c", "mid", "ghost")];

        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        let c = &resolution.received["c"];
        assert!(c.primary_id.is_none());
        assert_eq!(c.orphan, Some(true));
        assert_eq!(resolution.orphans_recorded, 1);
        assert_eq!(
            caches.orphans.pull_waiting_children(&["ghost".to_string()])["ghost"],
            vec!["c"]
        );
    }

    #[test]
    fn test_indexed_parent_is_used_and_batch_overrides_it() {
        let caches = Caches::new();
        let indexed = Task::from_events(&[root("p", "top").with_context("user", "old")]);
        let mut events = vec![
            Event::info("p", Utc::now()).with_context("user", "new"),
            child("c", "mid", "p"),
        ];

        let resolution = caches
            .resolver()
            .resolve(&mut events, &HashMap::from([("p".to_string(), indexed)]));
        let c = &resolution.received["c"];
        assert_eq!(c.primary_id.as_deref(), Some("p"));
        assert_eq!(c.context["user"], "new");
        assert_eq!(c.parents_path, Some(vec!["top".to_string()]));
    }

    #[test]
    fn test_cached_orphan_chain_is_adopted_across_batches() {
        let caches = Caches::new();

        let mut first = vec![child("gc", "leaf", "c")];
        let r1 = caches.resolver().resolve(&mut first, &HashMap::new());
        caches.tasks.put_many(&r1.received);

        let mut second = vec![child("c", "mid", "p")];
        let r2 = caches.resolver().resolve(&mut second, &HashMap::new());
        caches.tasks.put_many(&r2.received);
        assert!(r2.adopted.is_empty());

        let mut third = vec![root("p", "top")];
        let r3 = caches.resolver().resolve(&mut third, &HashMap::new());
        assert_eq!(r3.adoptions, 2);
        assert_eq!(r3.rounds, 3);

        let gc = &r3.adopted["gc"];
        assert_eq!(gc.primary_id.as_deref(), Some("p"));
        assert_eq!(gc.parents_path, Some(vec!["top".to_string(), "mid".to_string()]));
        assert_eq!(gc.orphan, Some(false));
    }

    #[test]
    fn test_orphan_in_batch_adopted_by_later_parent_in_batch() {
        let caches = Caches::new();
        let mut first = vec![child("c", "mid", "p")];
        let r1 = caches.resolver().resolve(&mut first, &HashMap::new());
        caches.tasks.put_many(&r1.received);

        let mut second = vec![
            root("p", "top"),
            Event::success("c", Utc::now() + Duration::seconds(1)),
        ];
        let r2 = caches.resolver().resolve(&mut second, &HashMap::new());
        let c = &r2.received["c"];
        assert_eq!(c.primary_id.as_deref(), Some("p"));
        assert_eq!(c.status(), TaskStatus::PartialSuccess);
        assert!(r2.adopted.is_empty());
    }

    #[test]
    fn test_parent_cycle_terminates() {
        let caches = Caches::new();
        let mut events = vec![child("a", "a", "b"), child("b", "b", "a")];
        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        assert_eq!(resolution.received.len(), 2);
        assert!(resolution.received.values().all(Task::is_orphan));
    }

    #[test]
    fn test_round_cap_bounds_adoption() {
        let caches = Caches::new();
        for i in 1..6 {
            let mut events = vec![child(&format!("n{}", i), "n", &format!("n{}", i - 1))];
            let r = caches.resolver().resolve(&mut events, &HashMap::new());
            caches.tasks.put_many(&r.received);
        }

        let resolver = ParentResolver::new(&caches.tasks, &caches.orphans, 2);
        let mut events = vec![root("n0", "n")];
        let resolution = resolver.resolve(&mut events, &HashMap::new());
        assert_eq!(resolution.rounds, 2);
        assert_eq!(resolution.adoptions, 2);
    }

    fn spot(id: &str, name: &str, parent: Option<&str>) -> Event {
        Event::spot(id, name, Utc::now(), parent.map(str::to_string))
    }

    #[test]
    fn test_spot_resolves_its_children_in_batch() {
        let caches = Caches::new();
        let mut events = vec![child("c", "step", "s"), spot("s", "ping", None).with_context("user", "ann")];

        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        assert_eq!(resolution.received["s"].primary_id.as_deref(), Some("s"));
        let c = &resolution.received["c"];
        assert_eq!(c.primary_id.as_deref(), Some("s"));
        assert_eq!(c.parents_path, Some(vec!["ping".to_string()]));
        assert_eq!(c.context["user"], "ann");
        assert_eq!(c.orphan, Some(false));
        assert_eq!(resolution.orphans_recorded, 0);
    }

    #[test]
    fn test_spot_with_parent_inherits_primary_but_not_ancestry() {
        let caches = Caches::new();
        let mut events = vec![
            root("p", "top").with_context("user", "ann"),
            spot("s", "ping", Some("p")),
        ];

        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        let s = &resolution.received["s"];
        assert_eq!(s.primary_id.as_deref(), Some("p"));
        assert_eq!(s.context["user"], "ann");
        assert!(s.parents_path.is_none());
        assert_eq!(s.status(), TaskStatus::Success);
    }

    #[test]
    fn test_late_spot_adopts_cached_orphan() {
        let caches = Caches::new();
        let mut first = vec![child("c", "step", "s")];
        let r1 = caches.resolver().resolve(&mut first, &HashMap::new());
        caches.tasks.put_many(&r1.received);

        let mut second = vec![spot("s", "ping", None)];
        let r2 = caches.resolver().resolve(&mut second, &HashMap::new());
        assert_eq!(r2.adoptions, 1);
        assert_eq!(r2.adopted["c"].primary_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_parent_without_primary_keeps_waiting_children() {
        let caches = Caches::new();
        caches.orphans.record_orphan("p", "c");

        // A decoded start event that lost its primary id has nothing to hand down.
        let mut start = root("p", "top");
        start.primary_id = None;
        let mut events = vec![start];
        let resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        assert_eq!(resolution.adoptions, 0);
        assert_eq!(
            caches.orphans.pull_waiting_children(&["p".to_string()])["p"],
            vec!["c"]
        );
    }

    #[test]
    fn test_uncached_child_is_pending_then_adopted_from_store() {
        let caches = Caches::new();
        caches.orphans.record_orphan("p", "c");
        caches.orphans.record_orphan("c", "gc");

        let mut events = vec![root("p", "top")];
        let mut resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        assert_eq!(resolution.adoptions, 0);
        assert_eq!(resolution.pending.len(), 1);
        assert_eq!(resolution.pending[0].child_id, "c");

        let stored_child = Task::from_events(&[child("c", "mid", "p")]);
        let stored_grandchild = Task::from_events(&[child("gc", "leaf", "c")]);
        caches.tasks.put_many(&HashMap::from([("gc".to_string(), stored_grandchild)]));
        caches
            .resolver()
            .adopt_indexed(&mut resolution, HashMap::from([("c".to_string(), stored_child)]));

        assert!(resolution.pending.is_empty());
        assert_eq!(resolution.adoptions, 2);
        assert_eq!(resolution.adopted["c"].primary_id.as_deref(), Some("p"));
        assert_eq!(
            resolution.adopted["gc"].parents_path,
            Some(vec!["top".to_string(), "mid".to_string()])
        );
    }

    #[test]
    fn test_child_missing_from_store_waits_again() {
        let caches = Caches::new();
        caches.orphans.record_orphan("p", "c");

        let mut events = vec![root("p", "top")];
        let mut resolution = caches.resolver().resolve(&mut events, &HashMap::new());
        caches.resolver().adopt_indexed(&mut resolution, HashMap::new());

        assert!(resolution.pending.is_empty());
        assert_eq!(
            caches.orphans.pull_waiting_children(&["p".to_string()])["p"],
            vec!["c"]
        );
    }
}
