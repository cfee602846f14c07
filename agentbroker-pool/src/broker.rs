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

//! Session broker: create, resume, send, stream and close on top of the
//! connection pool, admission controller and storage backend

use crate::admission::AdmissionController;
use crate::memory_probe::{MemoryProbe, ProcessMemoryProbe};
use crate::pool::{ConnectionPool, PooledHandle, SessionGuard};
use crate::recovery::RecoveryResolver;
use crate::stats::{BrokerStats, StatsSnapshot};
use agentbroker_core::config::{AgentDefaults, BrokerConfig};
use agentbroker_core::stream::{translate_message, MessageOutcome};
use agentbroker_core::{
    AgentConnection, AgentOptions, AgentRuntime, BrokerError, BrokerResult, ConnectOptions, DeltaTracker,
    ExchangeResponse, PathSandbox, RuntimeMessage, SessionMetadata, StreamEvent, ToolCall,
};
use agentbroker_storage::SessionStore;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STREAM_BUFFER: usize = 64;

/// Parameters for a new session. Unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    pub owner_id: String,
    pub subdir: Option<String>,
    pub system_prompt: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub mcp_servers: Option<Map<String, Value>>,
    pub plugins: Option<Vec<Value>>,
    pub setting_sources: Option<Vec<String>>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    /// Extra directories relative to the owner root
    pub add_dirs: Vec<String>,
    /// Overrides the configured initialization prompt
    pub init_message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl CreateSessionRequest {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    pub fn subdir(mut self, subdir: impl Into<String>) -> Self {
        self.subdir = Some(subdir.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    fn validate(&self, max_metadata_bytes: usize) -> BrokerResult<()> {
        if let Some(turns) = self.max_turns {
            if !(1..=1000).contains(&turns) {
                return Err(BrokerError::InvalidRequest(format!(
                    "max_turns must be between 1 and 1000, got {}",
                    turns
                )));
            }
        }
        if let Some(budget) = self.max_budget_usd {
            if !budget.is_finite() || !(0.0..=100.0).contains(&budget) {
                return Err(BrokerError::InvalidRequest(format!(
                    "max_budget_usd must be between 0 and 100, got {}",
                    budget
                )));
            }
        }
        if matches!(&self.init_message, Some(m) if m.trim().is_empty()) {
            return Err(BrokerError::InvalidRequest("init_message must not be empty".into()));
        }
        let size = serde_json::to_vec(&self.metadata)
            .map_err(|e| BrokerError::InvalidRequest(format!("metadata is not serializable: {}", e)))?
            .len();
        if size > max_metadata_bytes {
            return Err(BrokerError::InvalidRequest(format!(
                "metadata is {} bytes, limit is {}",
                size, max_metadata_bytes
            )));
        }
        Ok(())
    }

    fn options(&self, defaults: &AgentDefaults) -> AgentOptions {
        let mut options = defaults.to_options();
        if self.system_prompt.is_some() {
            options.system_prompt = self.system_prompt.clone();
        }
        if self.permission_mode.is_some() {
            options.permission_mode = self.permission_mode.clone();
        }
        if let Some(tools) = &self.allowed_tools {
            options.allowed_tools = tools.clone();
        }
        if let Some(tools) = &self.disallowed_tools {
            options.disallowed_tools = tools.clone();
        }
        if let Some(servers) = &self.mcp_servers {
            options.mcp_servers = servers.clone();
        }
        if let Some(plugins) = &self.plugins {
            options.plugins = plugins.clone();
        }
        if let Some(sources) = &self.setting_sources {
            options.setting_sources = sources.clone();
        }
        if self.model.is_some() {
            options.model = self.model.clone();
        }
        if self.max_turns.is_some() {
            options.max_turns = self.max_turns;
        }
        if self.max_budget_usd.is_some() {
            options.max_budget_usd = self.max_budget_usd;
        }
        options.add_dirs = self.add_dirs.clone();
        options
    }
}

/// Events of one streamed exchange. Ends after `Done` or `Error`.
///
/// Dropping the stream early abandons the exchange: the connection handle is
/// evicted and the session lock released, while the stored record survives.
pub struct MessageStream {
    session_id: String,
    inner: ReceiverStream<StreamEvent>,
}

impl MessageStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl futures::Stream for MessageStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// How an exchange ended
enum Exchange {
    Completed,
    Failed(String),
    /// Transport broke; the connection cannot be reused
    Broken(String),
    Abandoned,
}

/// Evicts the handle when an exchange is dropped before it reaches an outcome.
///
/// The rest of the interrupted response is still queued on the connection and
/// would otherwise be read as the reply to the next message. The session lock
/// is released only after the handle has left the pool.
struct PendingExchange {
    inner: Arc<Inner>,
    handle: Arc<PooledHandle>,
    _session: SessionGuard,
    armed: bool,
}

impl PendingExchange {
    fn new(inner: &Arc<Inner>, handle: &Arc<PooledHandle>, session: SessionGuard) -> Self {
        Self {
            inner: Arc::clone(inner),
            handle: Arc::clone(handle),
            _session: session,
            armed: true,
        }
    }

    /// The response was read to its end; the connection may be reused
    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.inner.pool.detach(&self.handle) {
            warn!(session_id = %self.handle.session_id(), "Exchange interrupted mid-response, evicting connection");
        }
        let handle = Arc::clone(&self.handle);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { handle.close().await });
        }
    }
}

/// Creates that passed the quota check but are not yet saved and pooled
#[derive(Default)]
struct PendingCreates {
    total: usize,
    per_owner: HashMap<String, usize>,
}

/// Quota slot held by one create in flight
struct CreateReservation<'a> {
    pending: &'a Mutex<PendingCreates>,
    owner_id: String,
    owner_counted: bool,
}

impl CreateReservation<'_> {
    /// The record is saved, so the store now counts it for the owner
    fn record_saved(&mut self) {
        if std::mem::replace(&mut self.owner_counted, false) {
            release_owner(&mut self.pending.lock(), &self.owner_id);
        }
    }
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        pending.total = pending.total.saturating_sub(1);
        if self.owner_counted {
            release_owner(&mut pending, &self.owner_id);
        }
    }
}

fn release_owner(pending: &mut PendingCreates, owner_id: &str) {
    if let Some(count) = pending.per_owner.get_mut(owner_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            pending.per_owner.remove(owner_id);
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: BrokerConfig,
    pub(crate) runtime: Arc<dyn AgentRuntime>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) pool: ConnectionPool,
    pub(crate) admission: AdmissionController,
    pub(crate) sandbox: PathSandbox,
    pub(crate) resolver: RecoveryResolver,
    pub(crate) memory: Option<Arc<dyn MemoryProbe>>,
    pub(crate) stats: BrokerStats,
    pub(crate) shutdown: CancellationToken,
    pub(crate) reclaimer: Mutex<Option<JoinHandle<()>>>,
    create_gate: AsyncMutex<()>,
    pending_creates: Mutex<PendingCreates>,
}

/// Cheap to clone; every clone drives the same pool
#[derive(Clone)]
pub struct SessionBroker {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBroker")
            .field("backend", &self.inner.store.backend_name())
            .field("pooled", &self.inner.pool.len())
            .finish()
    }
}

impl SessionBroker {
    /// Broker with the process memory probe when a threshold is configured
    pub fn new(config: BrokerConfig, runtime: Arc<dyn AgentRuntime>, store: Arc<dyn SessionStore>) -> BrokerResult<Self> {
        let probe: Option<Arc<dyn MemoryProbe>> = (config.pool.memory_threshold_mb > 0)
            .then(|| Arc::new(ProcessMemoryProbe::new()) as Arc<dyn MemoryProbe>);
        Self::with_memory_probe(config, runtime, store, probe)
    }

    pub fn with_memory_probe(
        config: BrokerConfig,
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<dyn SessionStore>,
        memory: Option<Arc<dyn MemoryProbe>>,
    ) -> BrokerResult<Self> {
        config.validate()?;
        let sandbox = PathSandbox::new(&config.sandbox.base_dir, config.sandbox.auto_create_dir);
        let resolver = RecoveryResolver::new(
            &config.runtime.log_root,
            config.runtime.log_extension.clone(),
            sandbox.base_dir(),
            config.defaults.clone(),
        );
        let admission = AdmissionController::new(config.pool.max_concurrent_requests, config.pool.admission_timeout());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                store,
                pool: ConnectionPool::new(),
                admission,
                sandbox,
                resolver,
                memory,
                stats: BrokerStats::default(),
                shutdown: CancellationToken::new(),
                reclaimer: Mutex::new(None),
                create_gate: AsyncMutex::new(()),
                pending_creates: Mutex::new(PendingCreates::default()),
            }),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    // ============ Lifecycle ============

    /// Open a connection, learn the runtime-assigned id, persist and pool it
    pub async fn create_session(&self, request: CreateSessionRequest) -> BrokerResult<SessionMetadata> {
        let inner = &self.inner;
        request.validate(inner.config.limits.max_metadata_bytes)?;
        agentbroker_core::sandbox::validate_owner_id(&request.owner_id)?;
        let mut reservation = self.reserve_create(&request.owner_id).await?;

        let subdir = agentbroker_core::sandbox::validate_subdir(request.subdir.as_deref())?;
        let cwd = inner.sandbox.build_working_dir(&request.owner_id, subdir.as_deref())?;
        let options = request.options(&inner.config.defaults);
        let add_dirs = inner.sandbox.build_add_dirs(&request.owner_id, &options.add_dirs)?;
        self.ensure_working_dir(&cwd).await?;

        let _permit = inner.admission.acquire().await?;
        let mut conn = inner
            .runtime
            .open(ConnectOptions {
                cwd: cwd.clone(),
                options: options.clone(),
                add_dirs,
                resume: None,
            })
            .await
            .map_err(|e| BrokerError::CreationFailed(format!("failed to open agent connection: {}", e)))?;

        let init_message = request
            .init_message
            .as_deref()
            .unwrap_or(&inner.config.runtime.init_message);
        let session_id = match initialize(conn.as_mut(), init_message).await {
            Ok(id) => id,
            Err(e) => {
                close_quietly(conn.as_mut(), None).await;
                return Err(e);
            }
        };

        let metadata = SessionMetadata::new(&session_id, &request.owner_id, subdir, cwd, options)
            .with_metadata(request.metadata);
        if let Err(e) = inner.store.save(&metadata).await {
            close_quietly(conn.as_mut(), Some(session_id.as_str())).await;
            return Err(e.into());
        }
        reservation.record_saved();

        let (_, rejected) = inner.pool.insert_if_absent(PooledHandle::new(&session_id, conn));
        drop(reservation);
        if let Some(rejected) = rejected {
            warn!(session_id = %session_id, "Runtime reused a pooled session id, closing duplicate connection");
            rejected.close().await;
        }
        BrokerStats::incr(&inner.stats.sessions_created);
        info!(
            session_id = %session_id,
            owner_id = %metadata.owner_id,
            cwd = %metadata.cwd.display(),
            "Session created"
        );
        Ok(metadata)
    }

    /// Make sure a connection is pooled for `session_id`
    pub async fn resume_session(&self, session_id: &str) -> BrokerResult<()> {
        self.get_or_resume(session_id).await.map(|_| ())
    }

    /// Close the connection, drop the lock and delete the record.
    ///
    /// Returns `false` when there was nothing to close.
    pub async fn close_session(&self, session_id: &str) -> BrokerResult<bool> {
        let inner = &self.inner;
        let had_handle = inner.pool.remove(session_id).await;
        inner.pool.remove_lock(session_id);
        let had_record = inner.store.delete(session_id).await?;
        if had_handle || had_record {
            BrokerStats::incr(&inner.stats.sessions_closed);
            info!(session_id, "Session closed");
        }
        Ok(had_handle || had_record)
    }

    pub async fn get_session(&self, session_id: &str) -> BrokerResult<SessionMetadata> {
        self.inner
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self, owner_id: Option<&str>) -> BrokerResult<Vec<String>> {
        Ok(self.inner.store.list(owner_id).await?)
    }

    /// Stored metadata, falling back to the conversation logs
    pub async fn recover_session(&self, session_id: &str) -> BrokerResult<SessionMetadata> {
        self.load_metadata(session_id).await
    }

    pub async fn purge_expired(&self) -> BrokerResult<usize> {
        let purged = self.inner.store.purge_expired().await?;
        if purged > 0 {
            info!(purged, "Purged expired session records");
        }
        Ok(purged)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot::collect(
            &inner.stats,
            inner.store.backend_name(),
            inner.pool.len(),
            inner.admission.snapshot(),
        )
    }

    /// Stop the reclaimer, close every connection and release the store
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let reclaimer = inner.reclaimer.lock().take();
        if let Some(task) = reclaimer {
            if let Err(e) = task.await {
                warn!("Reclaimer task ended abnormally: {}", e);
            }
        }
        inner.admission.close();
        let closed = inner.pool.drain().await;
        if let Err(e) = inner.store.close().await {
            warn!(backend = inner.store.backend_name(), "Failed to close session store: {}", e);
        }
        info!(closed, "Session broker shut down");
    }

    // ============ Messaging ============

    /// Send a message and wait for the complete response.
    ///
    /// Fails with `Busy` at once if the session is serving another request.
    /// With a `timeout`, the whole exchange is bounded; on expiry the
    /// connection is evicted and `Timeout` returned. A caller that drops the
    /// returned future mid-exchange gets the same eviction.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        timeout: Option<Duration>,
    ) -> BrokerResult<ExchangeResponse> {
        validate_message(message)?;
        let guard = self.lock_session(session_id)?;
        let _permit = self.inner.admission.acquire().await?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(guard, session_id, message)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(session_id, "Exchange exceeded {:?}", limit);
                    BrokerStats::incr(&self.inner.stats.exchanges_failed);
                    Err(BrokerError::Timeout(limit))
                }
            },
            None => self.exchange(guard, session_id, message).await,
        }
    }

    /// Send a message and stream the response as typed events.
    ///
    /// `Busy`, `NotFound` and admission failures are returned before any
    /// event is produced; failures during the exchange arrive as a terminal
    /// `StreamEvent::Error`.
    pub async fn send_message_stream(&self, session_id: &str, message: &str) -> BrokerResult<MessageStream> {
        validate_message(message)?;
        let guard = self.lock_session(session_id)?;
        let permit = self.inner.admission.acquire().await?;
        let handle = self.get_or_resume(session_id).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let broker = self.clone();
        let id = session_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move {
            broker.produce(guard, permit, handle, id, message, tx).await;
        });

        Ok(MessageStream {
            session_id: session_id.to_string(),
            inner: ReceiverStream::new(rx),
        })
    }

    fn lock_session(&self, session_id: &str) -> BrokerResult<SessionGuard> {
        self.inner.pool.try_acquire(session_id).ok_or_else(|| {
            BrokerStats::incr(&self.inner.stats.busy_rejections);
            debug!(session_id, "Rejecting request for busy session");
            BrokerError::Busy(session_id.to_string())
        })
    }

    async fn exchange(&self, guard: SessionGuard, session_id: &str, message: &str) -> BrokerResult<ExchangeResponse> {
        let handle = self.get_or_resume(session_id).await?;
        let mut pending = PendingExchange::new(&self.inner, &handle, guard);
        let mut tracker = DeltaTracker::new();
        let mut tool_calls = Vec::new();

        let outcome = {
            let mut conn = handle.connection().await;
            match conn.send(message).await {
                Err(e) => Exchange::Broken(e.to_string()),
                Ok(()) => {
                    let mut responses = conn.receive();
                    loop {
                        let Some(item) = responses.next().await else {
                            break Exchange::Completed;
                        };
                        let msg = match item {
                            Ok(msg) => msg,
                            Err(e) => break Exchange::Broken(e.to_string()),
                        };
                        match translate_message(&mut tracker, msg) {
                            MessageOutcome::Events(events) => {
                                for event in events {
                                    if let StreamEvent::ToolUse { name, input } = event {
                                        tool_calls.push(ToolCall { name, input });
                                    }
                                }
                            }
                            MessageOutcome::Failed(reason) => break Exchange::Failed(reason),
                            MessageOutcome::Finished => break Exchange::Completed,
                        }
                    }
                }
            }
        };

        match outcome {
            Exchange::Completed => {
                pending.settle();
                self.complete_exchange(&handle).await?;
                Ok(ExchangeResponse {
                    session_id: session_id.to_string(),
                    text: tracker.into_text(),
                    tool_calls,
                })
            }
            Exchange::Failed(reason) => {
                pending.settle();
                BrokerStats::incr(&self.inner.stats.exchanges_failed);
                Err(BrokerError::SendFailed(format!("Error in response: {}", reason)))
            }
            Exchange::Broken(reason) => {
                BrokerStats::incr(&self.inner.stats.exchanges_failed);
                self.evict_handle(&handle, &reason).await;
                pending.settle();
                Err(BrokerError::SendFailed(format!("Failed to send message: {}", reason)))
            }
            Exchange::Abandoned => {
                self.evict_handle(&handle, "exchange abandoned").await;
                pending.settle();
                Err(BrokerError::SendFailed("exchange abandoned".into()))
            }
        }
    }

    /// Body of a streamed exchange. Owns both guards until it returns.
    async fn produce(
        self,
        guard: SessionGuard,
        permit: OwnedSemaphorePermit,
        handle: Arc<PooledHandle>,
        session_id: String,
        message: String,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let _permit = permit;
        let mut pending = PendingExchange::new(&self.inner, &handle, guard);
        let mut tracker = DeltaTracker::new();

        let outcome = {
            let mut conn = handle.connection().await;
            match conn.send(&message).await {
                Err(e) => Exchange::Broken(e.to_string()),
                Ok(()) => {
                    let mut responses = conn.receive();
                    'exchange: loop {
                        let item = tokio::select! {
                            biased;
                            _ = tx.closed() => break 'exchange Exchange::Abandoned,
                            item = responses.next() => item,
                        };
                        let Some(item) = item else {
                            break Exchange::Completed;
                        };
                        let msg = match item {
                            Ok(msg) => msg,
                            Err(e) => break Exchange::Broken(e.to_string()),
                        };
                        match translate_message(&mut tracker, msg) {
                            MessageOutcome::Events(events) => {
                                for event in events {
                                    if tx.send(event).await.is_err() {
                                        break 'exchange Exchange::Abandoned;
                                    }
                                }
                            }
                            MessageOutcome::Failed(reason) => break Exchange::Failed(reason),
                            MessageOutcome::Finished => break Exchange::Completed,
                        }
                    }
                }
            }
        };

        let terminal = match outcome {
            Exchange::Completed => {
                pending.settle();
                match self.complete_exchange(&handle).await {
                    Ok(()) => StreamEvent::Done,
                    Err(e) => StreamEvent::Error { message: e.to_string() },
                }
            }
            Exchange::Failed(reason) => {
                pending.settle();
                BrokerStats::incr(&self.inner.stats.exchanges_failed);
                StreamEvent::Error { message: reason }
            }
            Exchange::Broken(reason) => {
                BrokerStats::incr(&self.inner.stats.exchanges_failed);
                self.evict_handle(&handle, &reason).await;
                pending.settle();
                StreamEvent::Error {
                    message: format!("Failed to send message: {}", reason),
                }
            }
            Exchange::Abandoned => {
                debug!(session_id = %session_id, "Stream consumer went away mid-exchange");
                self.evict_handle(&handle, "stream abandoned").await;
                pending.settle();
                return;
            }
        };
        // a consumer that left after the last delta is not an error
        let _ = tx.send(terminal).await;
    }

    async fn complete_exchange(&self, handle: &Arc<PooledHandle>) -> BrokerResult<()> {
        let session_id = handle.session_id();
        handle.mark_active();
        let touched = self.inner.store.touch(session_id).await?;
        BrokerStats::incr(&self.inner.stats.exchanges_completed);
        if !touched {
            warn!(session_id, "Session record vanished during exchange");
            self.evict_handle(handle, "record expired").await;
        }
        debug!(session_id, "Exchange completed");
        Ok(())
    }

    async fn evict_handle(&self, handle: &Arc<PooledHandle>, reason: &str) {
        info!(session_id = %handle.session_id(), reason, "Evicting connection handle");
        self.inner.pool.evict(handle).await;
    }

    // ============ Resolution ============

    pub(crate) async fn get_or_resume(&self, session_id: &str) -> BrokerResult<Arc<PooledHandle>> {
        let inner = &self.inner;
        if let Some(handle) = inner.pool.get(session_id) {
            return Ok(handle);
        }

        let metadata = self.load_metadata(session_id).await?;
        let cwd = inner
            .sandbox
            .build_working_dir(&metadata.owner_id, metadata.subdir.as_deref())?;
        self.ensure_working_dir(&cwd).await?;
        let add_dirs = inner
            .sandbox
            .build_add_dirs(&metadata.owner_id, &metadata.options.add_dirs)?;

        let conn = inner
            .runtime
            .open(ConnectOptions {
                cwd,
                options: metadata.options.clone(),
                add_dirs,
                resume: Some(session_id.to_string()),
            })
            .await
            .map_err(|e| BrokerError::CreationFailed(format!("failed to resume session {}: {}", session_id, e)))?;

        let (winner, rejected) = inner.pool.insert_if_absent(PooledHandle::new(session_id, conn));
        match rejected {
            Some(redundant) => {
                debug!(session_id, "Concurrent resume won the race, discarding connection");
                redundant.close().await;
            }
            None => {
                BrokerStats::incr(&inner.stats.sessions_resumed);
                info!(session_id, owner_id = %metadata.owner_id, "Session resumed");
            }
        }
        Ok(winner)
    }

    async fn load_metadata(&self, session_id: &str) -> BrokerResult<SessionMetadata> {
        let inner = &self.inner;
        if let Some(metadata) = inner.store.get(session_id).await? {
            return Ok(metadata);
        }
        match inner.resolver.recover(session_id, inner.store.as_ref()).await? {
            Some(metadata) => {
                BrokerStats::incr(&inner.stats.recoveries);
                Ok(metadata)
            }
            None => Err(BrokerError::NotFound(session_id.to_string())),
        }
    }

    /// Check the session quotas and hold a slot until the create finishes.
    ///
    /// Checks run one at a time and count creates already in flight, so two
    /// concurrent creates cannot both take the last slot.
    async fn reserve_create(&self, owner_id: &str) -> BrokerResult<CreateReservation<'_>> {
        let inner = &self.inner;
        let limits = &inner.config.pool;
        let _gate = inner.create_gate.lock().await;
        let (in_flight, owner_in_flight) = {
            let pending = inner.pending_creates.lock();
            (pending.total, pending.per_owner.get(owner_id).copied().unwrap_or(0))
        };

        if limits.max_sessions > 0 && inner.pool.len() + in_flight >= limits.max_sessions {
            return Err(BrokerError::CreationFailed(format!(
                "Maximum sessions ({}) reached",
                limits.max_sessions
            )));
        }
        if limits.max_sessions_per_owner > 0 {
            let owned = inner.store.list(Some(owner_id)).await?.len();
            if owned + owner_in_flight >= limits.max_sessions_per_owner {
                return Err(BrokerError::CreationFailed(format!(
                    "Owner {} has reached the limit of {} sessions",
                    owner_id, limits.max_sessions_per_owner
                )));
            }
        }
        if let Some(usage) = self.memory_pressure().await {
            return Err(BrokerError::CreationFailed(format!(
                "Memory usage {} MB exceeds threshold {} MB",
                usage, limits.memory_threshold_mb
            )));
        }

        let mut pending = inner.pending_creates.lock();
        pending.total += 1;
        *pending.per_owner.entry(owner_id.to_string()).or_default() += 1;
        Ok(CreateReservation {
            pending: &inner.pending_creates,
            owner_id: owner_id.to_string(),
            owner_counted: true,
        })
    }

    /// Current usage in MB when it is above the configured threshold.
    ///
    /// The reading refreshes process tables, so it runs on the blocking pool.
    pub(crate) async fn memory_pressure(&self) -> Option<u64> {
        let threshold = self.inner.config.pool.memory_threshold_mb;
        if threshold == 0 {
            return None;
        }
        let memory = Arc::clone(self.inner.memory.as_ref()?);
        let usage = match tokio::task::spawn_blocking(move || memory.usage_mb()).await {
            Ok(usage) => usage?,
            Err(e) => {
                warn!("Memory reading task failed: {}", e);
                return None;
            }
        };
        (usage > threshold).then_some(usage)
    }

    async fn ensure_working_dir(&self, cwd: &std::path::Path) -> BrokerResult<()> {
        if self.inner.sandbox.ensure_directory(cwd).await? {
            Ok(())
        } else {
            Err(BrokerError::PathSecurity(format!(
                "working directory does not exist: {}",
                cwd.display()
            )))
        }
    }
}

/// Send the init prompt and drain the full response, returning the session id
async fn initialize(conn: &mut dyn AgentConnection, init_message: &str) -> BrokerResult<String> {
    conn.send(init_message)
        .await
        .map_err(|e| BrokerError::CreationFailed(format!("failed to send init message: {}", e)))?;

    let mut session_id = None;
    let mut failure = None;
    let mut responses = conn.receive();
    while let Some(item) = responses.next().await {
        let msg = item.map_err(|e| BrokerError::CreationFailed(format!("init exchange failed: {}", e)))?;
        match msg {
            RuntimeMessage::Init { session_id: id } => session_id = Some(id),
            RuntimeMessage::Result { is_error: true, message } => {
                failure = Some(message.unwrap_or_else(|| "Unknown error".to_string()));
            }
            _ => {}
        }
    }

    if let Some(reason) = failure {
        return Err(BrokerError::CreationFailed(format!("runtime rejected init message: {}", reason)));
    }
    session_id.ok_or_else(|| BrokerError::CreationFailed("Failed to get session_id from agent runtime".into()))
}

async fn close_quietly(conn: &mut dyn AgentConnection, session_id: Option<&str>) {
    if let Err(e) = conn.close().await {
        warn!(session_id = session_id.unwrap_or("-"), "Failed to close agent connection: {}", e);
    }
}

fn validate_message(message: &str) -> BrokerResult<()> {
    if message.trim().is_empty() {
        return Err(BrokerError::InvalidRequest("message must not be empty".into()));
    }
    Ok(())
}
