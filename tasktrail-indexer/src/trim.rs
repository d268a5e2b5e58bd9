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

//! Caps oversized attribute values before they reach the store.

use std::collections::HashMap;

use tasktrail_core::config::TrimConfig;
use tasktrail_core::Event;

#[derive(Debug, Clone)]
pub struct FieldTrimmer {
    default_max_chars: usize,
    overrides: HashMap<String, usize>,
}

impl FieldTrimmer {
    pub fn new(config: &TrimConfig) -> Self {
        Self {
            default_max_chars: config.default_max_chars,
            overrides: config.overrides.clone(),
        }
    }

    /// Trim `strings`, `texts` and `context` in place. Returns how many
    /// values were cut.
    pub fn trim(&self, event: &mut Event) -> usize {
        self.trim_map("string", &mut event.strings)
            + self.trim_map("text", &mut event.texts)
            + self.trim_map("ctx", &mut event.context)
    }

    fn trim_map(&self, prefix: &str, map: &mut HashMap<String, String>) -> usize {
        let mut trimmed = 0;
        for (key, value) in map.iter_mut() {
            let limit = self
                .overrides
                .get(&format!("{}.{}", prefix, key))
                .copied()
                .unwrap_or(self.default_max_chars);
            if let Some((cut, _)) = value.char_indices().nth(limit) {
                tracing::debug!(field = %format!("{}.{}", prefix, key), limit, "Trimming oversized value");
                value.truncate(cut);
                trimmed += 1;
            }
        }
        trimmed
    }
}
