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

//! Per-environment views over the shared caches.
//!
//! Task ids are only unique within an environment, so every key is stored
//! as `<env>/<id>`.

use std::collections::HashMap;

use tasktrail_core::Task;

use super::{OrphanCache, TaskCache};

fn scoped_key(env: &str, id: &str) -> String {
    format!("{}/{}", env, id)
}

fn scoped_keys(env: &str, ids: &[String]) -> Vec<String> {
    ids.iter().map(|id| scoped_key(env, id)).collect()
}

fn unscoped(prefix_len: usize, key: String) -> String {
    key.get(prefix_len..).map(str::to_string).unwrap_or(key)
}

pub struct EnvTaskCache<'a> {
    env: &'a str,
    inner: &'a dyn TaskCache,
}

impl<'a> EnvTaskCache<'a> {
    pub fn new(env: &'a str, inner: &'a dyn TaskCache) -> Self {
        Self { env, inner }
    }
}

impl TaskCache for EnvTaskCache<'_> {
    fn get_many(&self, ids: &[String]) -> HashMap<String, Task> {
        let prefix_len = self.env.len() + 1;
        self.inner
            .get_many(&scoped_keys(self.env, ids))
            .into_iter()
            .map(|(key, task)| (unscoped(prefix_len, key), task))
            .collect()
    }

    fn put_many(&self, tasks: &HashMap<String, Task>) {
        let scoped: HashMap<String, Task> = tasks
            .iter()
            .map(|(id, task)| (scoped_key(self.env, id), task.clone()))
            .collect();
        self.inner.put_many(&scoped);
    }
}

pub struct EnvOrphanCache<'a> {
    env: &'a str,
    inner: &'a dyn OrphanCache,
}

impl<'a> EnvOrphanCache<'a> {
    pub fn new(env: &'a str, inner: &'a dyn OrphanCache) -> Self {
        Self { env, inner }
    }
}

impl OrphanCache for EnvOrphanCache<'_> {
    fn pull_waiting_children(&self, parent_ids: &[String]) -> HashMap<String, Vec<String>> {
        let prefix_len = self.env.len() + 1;
        self.inner
            .pull_waiting_children(&scoped_keys(self.env, parent_ids))
            .into_iter()
            .map(|(parent, children)| {
                let children = children
                    .into_iter()
                    .map(|child| unscoped(prefix_len, child))
                    .collect();
                (unscoped(prefix_len, parent), children)
            })
            .collect()
    }

    fn record_orphan(&self, parent_id: &str, child_id: &str) {
        self.inner
            .record_orphan(&scoped_key(self.env, parent_id), &scoped_key(self.env, child_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalOrphanCache, LocalTaskCache};
    use chrono::Utc;
    use tasktrail_core::Event;

    #[test]
    fn test_same_id_in_two_environments() {
        let shared = LocalTaskCache::new(1 << 20, None);
        let prod = EnvTaskCache::new("prod", &shared);
        let staging = EnvTaskCache::new("staging", &shared);

        let task = Task::from_events(&[Event::start("p", "prod-job", Utc::now(), None)]);
        prod.put_many(&HashMap::from([("p".to_string(), task)]));

        let ids = vec!["p".to_string()];
        assert_eq!(prod.get_many(&ids)["p"].name.as_deref(), Some("prod-job"));
        assert!(staging.get_many(&ids).is_empty());
    }

    #[test]
    fn test_orphans_are_scoped_and_unscoped() {
        let shared = LocalOrphanCache::new(1 << 20, None);
        let prod = EnvOrphanCache::new("prod", &shared);
        let staging = EnvOrphanCache::new("staging", &shared);

        prod.record_orphan("p", "c");
        let parents = vec!["p".to_string()];
        assert!(staging.pull_waiting_children(&parents).is_empty());
        assert_eq!(prod.pull_waiting_children(&parents)["p"], vec!["c"]);
    }
}
