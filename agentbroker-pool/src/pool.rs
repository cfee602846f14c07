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

//! Connection pool and per-session lock registry
//!
//! One registry-wide mutex guards both maps. Handles are removed from the map
//! under that mutex and closed after it is released, so tearing down one
//! connection never blocks lookups for unrelated sessions.

use agentbroker_core::AgentConnection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OwnedMutexGuard};
use tracing::{debug, warn};

/// Guard proving exclusive use of one session
pub type SessionGuard = OwnedMutexGuard<()>;

/// A live connection to the agent runtime for one session
pub struct PooledHandle {
    session_id: String,
    connection: AsyncMutex<Box<dyn AgentConnection>>,
    opened_at: Instant,
    last_active: Mutex<Instant>,
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("session_id", &self.session_id)
            .field("opened_at", &self.opened_at)
            .field("last_active", &*self.last_active.lock())
            .finish()
    }
}

impl PooledHandle {
    pub fn new(session_id: impl Into<String>, connection: Box<dyn AgentConnection>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            session_id: session_id.into(),
            connection: AsyncMutex::new(connection),
            opened_at: now,
            last_active: Mutex::new(now),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn mark_active(&self) {
        let mut last = self.last_active.lock();
        let now = Instant::now();
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub async fn connection(&self) -> AsyncMutexGuard<'_, Box<dyn AgentConnection>> {
        self.connection.lock().await
    }

    /// Best-effort teardown; failures are logged, never returned
    pub async fn close(&self) {
        let mut conn = self.connection.lock().await;
        if let Err(e) = conn.close().await {
            warn!(session_id = %self.session_id, "Failed to close agent connection: {}", e);
        }
    }
}

#[derive(Default)]
struct PoolState {
    handles: HashMap<String, Arc<PooledHandle>>,
    locks: HashMap<String, Arc<AsyncMutex<()>>>,
}

/// Session id → live handle, plus the per-session lock registry
#[derive(Default)]
pub struct ConnectionPool {
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock object for `session_id`, created on first reference
    pub fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut state = self.state.lock();
        Arc::clone(
            state
                .locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Take the session lock without waiting. `None` means another request holds it.
    ///
    /// The guard is only returned if its lock is still the registered one, so a
    /// lock removed concurrently can never admit a second holder.
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionGuard> {
        loop {
            let lock = self.session_lock(session_id);
            let guard = Arc::clone(&lock).try_lock_owned().ok()?;
            let still_registered = self
                .state
                .lock()
                .locks
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &lock));
            if still_registered {
                return Some(guard);
            }
        }
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        let state = self.state.lock();
        state
            .locks
            .get(session_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    pub fn remove_lock(&self, session_id: &str) {
        self.state.lock().locks.remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<PooledHandle>> {
        self.state.lock().handles.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.state.lock().handles.contains_key(session_id)
    }

    /// Register `handle` unless one is already pooled for its id.
    ///
    /// Returns the handle now in the pool and, if `handle` lost, `handle` itself
    /// so the caller can close it.
    pub fn insert_if_absent(&self, handle: Arc<PooledHandle>) -> (Arc<PooledHandle>, Option<Arc<PooledHandle>>) {
        let mut state = self.state.lock();
        if let Some(existing) = state.handles.get(handle.session_id()) {
            return (Arc::clone(existing), Some(handle));
        }
        state
            .handles
            .insert(handle.session_id().to_string(), Arc::clone(&handle));
        (handle, None)
    }

    /// Register `handle`, returning any handle it displaced
    pub fn put(&self, handle: Arc<PooledHandle>) -> Option<Arc<PooledHandle>> {
        self.state
            .lock()
            .handles
            .insert(handle.session_id().to_string(), handle)
    }

    /// Unregister without closing
    pub fn take(&self, session_id: &str) -> Option<Arc<PooledHandle>> {
        self.state.lock().handles.remove(session_id)
    }

    /// Unregister and close. Returns whether a handle was pooled.
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some(handle) = self.take(session_id) else {
            return false;
        };
        handle.close().await;
        debug!(session_id, "Connection handle closed");
        true
    }

    /// Unregister `handle` without closing it, only if it is still the pooled one for its id
    pub fn detach(&self, handle: &Arc<PooledHandle>) -> bool {
        let mut state = self.state.lock();
        let pooled = state
            .handles
            .get(handle.session_id())
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if pooled {
            state.handles.remove(handle.session_id());
        }
        pooled
    }

    /// Unregister `handle` if it is still the pooled one for its id, then close it
    pub async fn evict(&self, handle: &Arc<PooledHandle>) -> bool {
        let removed = self.detach(handle);
        handle.close().await;
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pooled ids ordered by last activity, least recent first
    pub fn by_activity(&self) -> Vec<(String, Instant)> {
        let mut entries: Vec<(String, Instant)> = self
            .state
            .lock()
            .handles
            .values()
            .map(|h| (h.session_id().to_string(), h.last_active()))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Close every handle and forget every lock
    pub async fn drain(&self) -> usize {
        let handles: Vec<Arc<PooledHandle>> = {
            let mut state = self.state.lock();
            state.locks.clear();
            state.handles.drain().map(|(_, h)| h).collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.close().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbroker_core::{RuntimeError, RuntimeMessage};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentConnection for CountingConnection {
        async fn send(&mut self, _prompt: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn receive(&mut self) -> BoxStream<'_, Result<RuntimeMessage, RuntimeError>> {
            Box::pin(stream::empty())
        }

        async fn close(&mut self) -> Result<(), RuntimeError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Closed)
        }
    }

    fn handle(id: &str, closes: &Arc<AtomicUsize>) -> Arc<PooledHandle> {
        PooledHandle::new(
            id,
            Box::new(CountingConnection {
                closes: Arc::clone(closes),
            }),
        )
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let pool = ConnectionPool::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let first = handle("s1", &closes);
        let (winner, rejected) = pool.insert_if_absent(Arc::clone(&first));
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(rejected.is_none());

        let (winner, rejected) = pool.insert_if_absent(handle("s1", &closes));
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(rejected.is_some());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_and_swallows_errors() {
        let pool = ConnectionPool::new();
        let closes = Arc::new(AtomicUsize::new(0));
        pool.put(handle("s1", &closes));

        assert!(pool.remove("s1").await);
        assert!(!pool.remove("s1").await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_try_acquire_is_exclusive() {
        let pool = ConnectionPool::new();
        let guard = pool.try_acquire("s1").unwrap();
        assert!(pool.is_busy("s1"));
        assert!(pool.try_acquire("s1").is_none());
        drop(guard);
        assert!(!pool.is_busy("s1"));
        assert!(pool.try_acquire("s1").is_some());
    }

    #[tokio::test]
    async fn test_removed_lock_is_replaced() {
        let pool = ConnectionPool::new();
        let guard = pool.try_acquire("s1").unwrap();
        pool.remove_lock("s1");
        // a fresh lock is created; the old holder keeps its guard
        let second = pool.try_acquire("s1");
        assert!(second.is_some());
        drop(guard);
    }

    #[tokio::test]
    async fn test_evict_ignores_replaced_handle() {
        let pool = ConnectionPool::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let stale = handle("s1", &closes);
        pool.put(Arc::clone(&stale));
        let fresh = handle("s1", &closes);
        pool.put(Arc::clone(&fresh));

        assert!(!pool.evict(&stale).await);
        assert!(Arc::ptr_eq(&pool.get("s1").unwrap(), &fresh));
        assert!(pool.evict(&fresh).await);
        assert!(pool.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_detach_leaves_connection_open() {
        let pool = ConnectionPool::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let h = handle("s1", &closes);
        pool.put(Arc::clone(&h));

        assert!(pool.detach(&h));
        assert!(!pool.detach(&h));
        assert!(!pool.contains("s1"));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_by_activity_orders_oldest_first() {
        let pool = ConnectionPool::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let a = handle("a", &closes);
        let b = handle("b", &closes);
        pool.put(Arc::clone(&b));
        pool.put(Arc::clone(&a));
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.mark_active();

        let order: Vec<String> = pool.by_activity().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec!["a", "b"]);

        assert_eq!(pool.drain().await, 2);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
