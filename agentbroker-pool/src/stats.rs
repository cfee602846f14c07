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

//! Broker counters

use crate::admission::AdmissionSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub sessions_created: AtomicU64,
    pub sessions_resumed: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub exchanges_completed: AtomicU64,
    pub exchanges_failed: AtomicU64,
    pub busy_rejections: AtomicU64,
    pub idle_evictions: AtomicU64,
    pub memory_evictions: AtomicU64,
    pub expired_sessions: AtomicU64,
    pub recoveries: AtomicU64,
}

impl BrokerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub backend: &'static str,
    pub pooled_connections: usize,
    pub admission: AdmissionSnapshot,
    pub sessions_created: u64,
    pub sessions_resumed: u64,
    pub sessions_closed: u64,
    pub exchanges_completed: u64,
    pub exchanges_failed: u64,
    pub busy_rejections: u64,
    pub idle_evictions: u64,
    pub memory_evictions: u64,
    pub expired_sessions: u64,
    pub recoveries: u64,
}

impl StatsSnapshot {
    pub(crate) fn collect(
        stats: &BrokerStats,
        backend: &'static str,
        pooled_connections: usize,
        admission: AdmissionSnapshot,
    ) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Self {
            backend,
            pooled_connections,
            admission,
            sessions_created: load(&stats.sessions_created),
            sessions_resumed: load(&stats.sessions_resumed),
            sessions_closed: load(&stats.sessions_closed),
            exchanges_completed: load(&stats.exchanges_completed),
            exchanges_failed: load(&stats.exchanges_failed),
            busy_rejections: load(&stats.busy_rejections),
            idle_evictions: load(&stats.idle_evictions),
            memory_evictions: load(&stats.memory_evictions),
            expired_sessions: load(&stats.expired_sessions),
            recoveries: load(&stats.recoveries),
        }
    }
}
