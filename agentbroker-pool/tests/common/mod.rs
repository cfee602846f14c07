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

//! Scripted in-process agent runtime shared by the broker tests

#![allow(dead_code)]

use agentbroker_core::config::BrokerConfig;
use agentbroker_core::{
    AgentConnection, AgentRuntime, ConnectOptions, ContentBlock, RuntimeError, RuntimeMessage,
};
use agentbroker_pool::{MemoryProbe, SessionBroker};
use agentbroker_storage::{InMemoryStore, SessionStore};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct FakeState {
    pub opens: AtomicUsize,
    pub resumes: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_init: AtomicBool,
    pub break_transport: AtomicBool,
    pub gated: AtomicBool,
    pub gate: Semaphore,
    pub reply: Mutex<Vec<RuntimeMessage>>,
    pub prompts: Mutex<Vec<String>>,
    pub last_open: Mutex<Option<ConnectOptions>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_init: AtomicBool::new(false),
            break_transport: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            reply: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            last_open: Mutex::new(None),
        }
    }
}

/// Runtime that answers every prompt with a fixed script
#[derive(Clone)]
pub struct FakeRuntime {
    pub state: Arc<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self {
            state: Arc::new(FakeState::default()),
        };
        runtime.set_reply(vec![
            assistant_text("Hello"),
            assistant_text("Hello, world"),
            result_ok(),
        ]);
        runtime
    }

    pub fn set_reply(&self, reply: Vec<RuntimeMessage>) {
        *self.state.reply.lock() = reply;
    }

    /// Hold every exchange until `release` is called
    pub fn hold(&self) {
        self.state.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.state.gated.store(false, Ordering::SeqCst);
        self.state.gate.add_permits(1024);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.state.resumes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn open(&self, options: ConnectOptions) -> Result<Box<dyn AgentConnection>, RuntimeError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let session_id = match &options.resume {
            Some(id) => {
                self.state.resumes.fetch_add(1, Ordering::SeqCst);
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let fresh = options.resume.is_none();
        *self.state.last_open.lock() = Some(options);
        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
            session_id,
            needs_init: fresh,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            closed: false,
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
    session_id: String,
    needs_init: bool,
    /// Replies not yet read; an interrupted read leaves the rest here
    queue: Arc<Mutex<VecDeque<RuntimeMessage>>>,
    closed: bool,
}

#[async_trait]
impl AgentConnection for FakeConnection {
    async fn send(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        if self.closed {
            return Err(RuntimeError::Closed);
        }
        self.state.prompts.lock().push(prompt.to_string());
        let reply = if self.needs_init {
            self.needs_init = false;
            if self.state.fail_init.load(Ordering::SeqCst) {
                vec![RuntimeMessage::Result {
                    is_error: true,
                    message: Some("init refused".into()),
                }]
            } else {
                vec![
                    RuntimeMessage::Init {
                        session_id: self.session_id.clone(),
                    },
                    result_ok(),
                ]
            }
        } else {
            self.state.reply.lock().clone()
        };
        self.queue.lock().extend(reply);
        Ok(())
    }

    fn receive(&mut self) -> BoxStream<'_, Result<RuntimeMessage, RuntimeError>> {
        let queue = Arc::clone(&self.queue);
        let state = Arc::clone(&self.state);
        Box::pin(async_stream::stream! {
            if state.gated.load(Ordering::SeqCst) {
                if let Ok(permit) = state.gate.acquire().await {
                    permit.forget();
                }
            }
            if state.break_transport.load(Ordering::SeqCst) {
                yield Err(RuntimeError::Protocol("pipe closed".into()));
                return;
            }
            loop {
                let next = queue.lock().pop_front();
                let Some(message) = next else {
                    break;
                };
                let last = matches!(message, RuntimeMessage::Result { .. });
                yield Ok(message);
                if last {
                    break;
                }
            }
        })
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn assistant_text(text: &str) -> RuntimeMessage {
    RuntimeMessage::Assistant {
        blocks: vec![ContentBlock::Text(text.to_string())],
    }
}

pub fn result_ok() -> RuntimeMessage {
    RuntimeMessage::Result {
        is_error: false,
        message: None,
    }
}

/// Memory probe returning queued readings, then a fixed fallback
pub struct FakeProbe {
    readings: Mutex<VecDeque<u64>>,
    fallback: u64,
}

impl FakeProbe {
    pub fn new(readings: impl IntoIterator<Item = u64>, fallback: u64) -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(readings.into_iter().collect()),
            fallback,
        })
    }
}

impl MemoryProbe for FakeProbe {
    fn usage_mb(&self) -> Option<u64> {
        Some(self.readings.lock().pop_front().unwrap_or(self.fallback))
    }
}

pub fn test_config(base: &Path, logs: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.sandbox.base_dir = base.to_path_buf();
    config.runtime.log_root = logs.to_path_buf();
    config.storage.ttl_secs = 3600;
    config.pool.idle_timeout_secs = 60;
    config
}

pub struct Harness {
    pub broker: SessionBroker,
    pub runtime: FakeRuntime,
    pub store: Arc<dyn SessionStore>,
    pub root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {}, None)
    }

    pub fn with(configure: impl FnOnce(&mut BrokerConfig), probe: Option<Arc<dyn MemoryProbe>>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(&root.path().join("base"), &root.path().join("logs"));
        configure(&mut config);
        let runtime = FakeRuntime::new();
        let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new(config.storage.ttl_secs));
        let broker = SessionBroker::with_memory_probe(
            config,
            Arc::new(runtime.clone()),
            Arc::clone(&store),
            probe,
        )
        .unwrap();
        Self {
            broker,
            runtime,
            store,
            root,
        }
    }

    pub fn base(&self) -> std::path::PathBuf {
        self.root.path().join("base")
    }

    pub fn logs(&self) -> std::path::PathBuf {
        self.root.path().join("logs")
    }
}
