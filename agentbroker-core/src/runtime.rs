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

//! Agent runtime collaborator
//!
//! A runtime opens connections; a connection accepts one prompt at a time and
//! yields the response as a sequence of messages that must be drained before
//! the next `send`.

use crate::error::RuntimeError;
use crate::metadata::AgentOptions;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::path::PathBuf;

/// One content block inside an assistant message
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse { name: String, input: Value },
}

/// Messages yielded by a connection while a response is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeMessage {
    /// First message of a fresh connection's first exchange
    Init { session_id: String },
    Assistant { blocks: Vec<ContentBlock> },
    /// Terminal marker of an exchange
    Result {
        is_error: bool,
        message: Option<String>,
    },
}

impl RuntimeMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeMessage::Result { .. })
    }
}

/// Everything a runtime needs to open a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub cwd: PathBuf,
    pub options: AgentOptions,
    /// Absolute, sandbox-validated extra directories
    pub add_dirs: Vec<PathBuf>,
    /// Session id to resume; `None` starts a new conversation
    pub resume: Option<String>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn open(&self, options: ConnectOptions) -> Result<Box<dyn AgentConnection>, RuntimeError>;
}

#[async_trait]
pub trait AgentConnection: Send {
    async fn send(&mut self, prompt: &str) -> Result<(), RuntimeError>;

    /// Response messages for the last `send`, ending after the terminal result
    fn receive(&mut self) -> BoxStream<'_, Result<RuntimeMessage, RuntimeError>>;

    /// Tear down the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<(), RuntimeError>;
}
