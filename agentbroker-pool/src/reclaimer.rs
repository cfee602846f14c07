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

//! Background reclaimer for idle, expired and memory-pressured sessions
//!
//! A sweep never touches a session that is serving a request. Idle and
//! memory evictions close the connection handle only; the stored record
//! stays so the next send resumes the session.

use crate::broker::SessionBroker;
use crate::stats::BrokerStats;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle_evicted: usize,
    pub memory_evicted: usize,
    pub expired: usize,
    pub recovered: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SessionBroker {
    /// Spawn the periodic sweep. Calling it again while running is a no-op.
    pub fn start_reclaimer(&self) {
        let mut slot = self.inner.reclaimer.lock();
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.pool.cleanup_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let report = SessionBroker { inner }.sweep().await;
                        if !report.is_empty() {
                            info!(
                                idle_evicted = report.idle_evicted,
                                memory_evicted = report.memory_evicted,
                                expired = report.expired,
                                recovered = report.recovered,
                                "Reclaimer sweep finished"
                            );
                        }
                    }
                }
            }
            debug!("Reclaimer stopped");
        }));
        info!(interval_secs = period.as_secs(), "Reclaimer started");
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Run one sweep, measuring idleness against `now`
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_records(now, &mut report).await;
        self.relieve_memory_pressure(&mut report).await;
        report
    }

    async fn sweep_records(&self, now: Instant, report: &mut SweepReport) {
        let inner = &self.inner;
        let idle_timeout = inner.config.pool.idle_timeout();

        for session_id in inner.pool.ids() {
            let Some(_guard) = inner.pool.try_acquire(&session_id) else {
                continue;
            };

            match inner.store.get(&session_id).await {
                Err(e) => {
                    warn!(session_id = %session_id, "Skipping session, record lookup failed: {}", e);
                }
                Ok(Some(_)) => {
                    let (Some(limit), Some(handle)) = (idle_timeout, inner.pool.get(&session_id)) else {
                        continue;
                    };
                    let idle = handle.idle_for(now);
                    if idle > limit {
                        info!(session_id = %session_id, idle_secs = idle.as_secs(), "Evicting idle connection");
                        inner.pool.evict(&handle).await;
                        inner.pool.remove_lock(&session_id);
                        BrokerStats::incr(&inner.stats.idle_evictions);
                        report.idle_evicted += 1;
                    }
                }
                Ok(None) => match inner.resolver.recover(&session_id, inner.store.as_ref()).await {
                    Ok(Some(_)) => {
                        BrokerStats::incr(&inner.stats.recoveries);
                        report.recovered += 1;
                    }
                    Ok(None) => {
                        info!(session_id = %session_id, "Session expired, closing");
                        inner.pool.remove(&session_id).await;
                        inner.pool.remove_lock(&session_id);
                        if let Err(e) = inner.store.delete(&session_id).await {
                            warn!(session_id = %session_id, "Failed to delete expired record: {}", e);
                        }
                        BrokerStats::incr(&inner.stats.expired_sessions);
                        report.expired += 1;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, "Recovery attempt failed: {}", e);
                    }
                },
            }
        }
    }

    /// Evict least recently active handles until usage is back under the threshold
    async fn relieve_memory_pressure(&self, report: &mut SweepReport) {
        let inner = &self.inner;
        let Some(usage) = self.memory_pressure().await else {
            return;
        };
        warn!(
            usage_mb = usage,
            threshold_mb = inner.config.pool.memory_threshold_mb,
            "Memory pressure, evicting oldest connections"
        );

        for (session_id, _) in inner.pool.by_activity() {
            let Some(_guard) = inner.pool.try_acquire(&session_id) else {
                continue;
            };
            let Some(handle) = inner.pool.get(&session_id) else {
                continue;
            };
            inner.pool.evict(&handle).await;
            inner.pool.remove_lock(&session_id);
            BrokerStats::incr(&inner.stats.memory_evictions);
            report.memory_evicted += 1;
            info!(session_id = %session_id, "Evicted connection under memory pressure");

            if self.memory_pressure().await.is_none() {
                break;
            }
        }
    }
}
