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

//! Admission control for in-flight agent calls
//!
//! A bounded counting semaphore caps simultaneous exchanges across all
//! sessions. Callers take a slot only after the per-session lock, so a
//! request about to be rejected as busy never holds a scarce global slot.

use agentbroker_core::{BrokerError, BrokerResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Statistics for admission control
#[derive(Debug, Default)]
pub struct AdmissionStats {
    pub admitted: AtomicU64,
    pub waited: AtomicU64,
    pub timed_out: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub capacity: usize,
    pub available: usize,
    pub in_flight: usize,
    pub admitted: u64,
    pub waited: u64,
    pub timed_out: u64,
}

#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    timeout: Option<Duration>,
    stats: AdmissionStats,
}

impl AdmissionController {
    /// `timeout = None` waits until a slot frees
    pub fn new(capacity: usize, timeout: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
            stats: AdmissionStats::default(),
        }
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> BrokerResult<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(permit);
        }
        self.stats.waited.fetch_add(1, Ordering::Relaxed);

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(capacity = self.capacity, "No admission slot freed within {:?}", limit);
                    return Err(BrokerError::AdmissionTimeout(limit));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| BrokerError::SendFailed("broker is shutting down".into()))?;

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(permit)
    }

    /// Reject every pending and future acquire
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            capacity: self.capacity,
            available: self.available(),
            in_flight: self.in_flight(),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            waited: self.stats.waited.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_bounds_in_flight() {
        let admission = AdmissionController::new(2, None);
        let a = admission.acquire().await.unwrap();
        let _b = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.available(), 0);
        drop(a);
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_when_slot_frees() {
        let admission = Arc::new(AdmissionController::new(1, None));
        let held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(admission.snapshot().waited, 1);
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let admission = AdmissionController::new(1, Some(Duration::from_millis(20)));
        let _held = admission.acquire().await.unwrap();
        let err = admission.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "admission_timeout");
        assert_eq!(admission.snapshot().timed_out, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let admission = AdmissionController::new(1, None);
        let _held = admission.acquire().await.unwrap();
        admission.close();
        assert!(admission.acquire().await.is_err());
    }
}
