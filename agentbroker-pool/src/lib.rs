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

//! Agentbroker Pool
//!
//! Runtime side of the broker: live connections, admission and lifecycle.
//!
//! - [`ConnectionPool`]: session id → live handle, plus per-session locks
//! - [`AdmissionController`]: bounded number of in-flight exchanges
//! - [`SessionBroker`]: create / resume / send / stream / close
//! - [`RecoveryResolver`]: rebuilds lost records from runtime conversation logs
//! - reclaimer: periodic idle, expiry and memory-pressure sweeps
//!
//! ```text
//!   send ─▶ try_acquire(lock) ─▶ admission ─▶ get_or_resume ─▶ exchange ─▶ touch
//!              │ busy                           │ missing
//!              ▼                                ▼
//!            Busy                     store.get ─▶ recovery ─▶ NotFound
//! ```

pub mod admission;
pub mod broker;
pub mod memory_probe;
pub mod pool;
pub mod reclaimer;
pub mod recovery;
pub mod stats;

pub use admission::{AdmissionController, AdmissionSnapshot};
pub use broker::{CreateSessionRequest, MessageStream, SessionBroker};
pub use memory_probe::{MemoryProbe, ProcessMemoryProbe};
pub use pool::{ConnectionPool, PooledHandle, SessionGuard};
pub use reclaimer::SweepReport;
pub use recovery::RecoveryResolver;
pub use stats::{BrokerStats, StatsSnapshot};
