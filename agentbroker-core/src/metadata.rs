// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Durable session record and the agent configuration snapshot it carries

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Current time truncated to microseconds.
///
/// Every backend stores microsecond precision, so records compare equal
/// after a round trip.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// True when `ttl_secs > 0` and `now` lies strictly after `last_active + ttl`.
pub fn is_expired(last_active: DateTime<Utc>, ttl_secs: u64, now: DateTime<Utc>) -> bool {
    let Some(ttl) = ttl_duration(ttl_secs) else {
        return false;
    };
    match last_active.checked_add_signed(ttl) {
        Some(deadline) => now > deadline,
        None => false,
    }
}

/// Earliest `last_active_at` that is still live at `now`.
pub fn expiry_cutoff(ttl_secs: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(ttl_duration(ttl_secs)?)
}

/// `None` for zero and for TTLs too large to represent; both never expire
fn ttl_duration(ttl_secs: u64) -> Option<ChronoDuration> {
    if ttl_secs == 0 {
        return None;
    }
    ChronoDuration::try_seconds(i64::try_from(ttl_secs).ok()?)
}

/// Agent configuration captured at creation and reused verbatim on resume
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub permission_mode: Option<String>,

    #[serde(default)]
    pub allowed_tools: Vec<String>,

    #[serde(default)]
    pub disallowed_tools: Vec<String>,

    /// External tool-server set, keyed by server name
    #[serde(default)]
    pub mcp_servers: Map<String, Value>,

    #[serde(default)]
    pub plugins: Vec<Value>,

    #[serde(default)]
    pub setting_sources: Vec<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub max_turns: Option<u32>,

    #[serde(default)]
    pub max_budget_usd: Option<f64>,

    /// Extra directories, relative to the owner root
    #[serde(default)]
    pub add_dirs: Vec<String>,
}

/// Durable metadata for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub subdir: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub options: AgentOptions,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionMetadata {
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        subdir: Option<String>,
        cwd: PathBuf,
        options: AgentOptions,
    ) -> Self {
        let ts = now();
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            subdir,
            cwd,
            options,
            created_at: ts,
            last_active_at: ts,
            message_count: 0,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_expired(&self, ttl_secs: u64, now: DateTime<Utc>) -> bool {
        is_expired(self.last_active_at, ttl_secs, now)
    }

    /// Record one completed exchange
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_active_at {
            self.last_active_at = at;
        }
        self.message_count += 1;
    }
}
