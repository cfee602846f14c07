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

//! Agentbroker Core
//!
//! Shared vocabulary for the session broker:
//! - **Metadata**: the durable per-session record and its agent configuration snapshot
//! - **Sandbox**: owner working directories confined to `<base_dir>/<owner_id>`
//! - **Runtime**: the agent runtime collaborator and a child-process implementation
//! - **Stream**: typed response events and snapshot/delta reconciliation
//! - **Recovery**: decoding runtime log directories back to session ownership
//!
//! # Architecture
//!
//! ```text
//!   agentbroker-cli
//!         │
//!   agentbroker-pool ── SessionBroker, ConnectionPool, Admission, Reclaimer
//!         │
//!   agentbroker-storage ── memory │ file │ sqlite │ postgres
//!         │
//!   agentbroker-core ── types, errors, config, sandbox, runtime traits
//! ```

pub mod config;
pub mod error;
pub mod metadata;
pub mod process;
pub mod recovery;
pub mod runtime;
pub mod sandbox;
pub mod stream;

pub use config::{BrokerConfig, StorageBackendKind};
pub use error::{BrokerError, BrokerResult, RuntimeError, StorageError, StorageResult};
pub use metadata::{AgentOptions, SessionMetadata};
pub use process::ProcessRuntime;
pub use runtime::{AgentConnection, AgentRuntime, ConnectOptions, ContentBlock, RuntimeMessage};
pub use sandbox::PathSandbox;
pub use stream::{DeltaTracker, ExchangeResponse, StreamEvent, ToolCall};
