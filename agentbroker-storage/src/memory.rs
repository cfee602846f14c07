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

//! In-process store for development and tests. Nothing survives a restart.

use crate::SessionStore;
use agentbroker_core::metadata::now;
use agentbroker_core::{SessionMetadata, StorageResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    ttl_secs: u64,
    sessions: Mutex<HashMap<String, SessionMetadata>>,
}

impl InMemoryStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    async fn save(&self, metadata: &SessionMetadata) -> StorageResult<()> {
        self.sessions
            .lock()
            .insert(metadata.session_id.clone(), metadata.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>> {
        let mut sessions = self.sessions.lock();
        let Some(meta) = sessions.get(session_id).cloned() else {
            return Ok(None);
        };
        if meta.is_expired(self.ttl_secs, now()) {
            sessions.remove(session_id);
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        Ok(self.sessions.lock().remove(session_id).is_some())
    }

    async fn touch(&self, session_id: &str) -> StorageResult<bool> {
        let ts = now();
        let mut sessions = self.sessions.lock();
        let Some(meta) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if !meta.is_expired(self.ttl_secs, ts) {
            meta.touch(ts);
            return Ok(true);
        }
        sessions.remove(session_id);
        Ok(false)
    }

    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>> {
        let ts = now();
        let sessions = self.sessions.lock();
        let mut live: Vec<&SessionMetadata> = sessions
            .values()
            .filter(|m| owner_id.map_or(true, |owner| m.owner_id == owner))
            .filter(|m| !m.is_expired(self.ttl_secs, ts))
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        Ok(live.into_iter().map(|m| m.session_id.clone()).collect())
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        let ts = now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, m| !m.is_expired(self.ttl_secs, ts));
        Ok(before - sessions.len())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
