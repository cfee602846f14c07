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

//! Error taxonomy shared by every broker crate

use std::time::Duration;
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for storage backend operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the session broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Session absent or expired; safe to retry after recreate/resume
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session is serving another request; never queued
    #[error("Session is busy: {0}")]
    Busy(String),

    /// Quota exceeded, memory pressure, or the runtime yielded no session id
    #[error("Session creation failed: {0}")]
    CreationFailed(String),

    /// The runtime reported an error mid-exchange
    #[error("Message send failed: {0}")]
    SendFailed(String),

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Traversal or sandbox escape attempt
    #[error("Path security violation: {0}")]
    PathSecurity(String),

    /// Misconfigured backend, credentials or paths
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller input rejected before any work started
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The exchange did not finish within the caller's deadline
    #[error("Exchange timed out after {0:?}")]
    Timeout(Duration),

    /// No admission slot freed up in time
    #[error("No admission slot available after {0:?}")]
    AdmissionTimeout(Duration),
}

impl BrokerError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::NotFound(_) => "not_found",
            BrokerError::Busy(_) => "busy",
            BrokerError::CreationFailed(_) => "creation_failed",
            BrokerError::SendFailed(_) => "send_failed",
            BrokerError::Storage(_) => "storage_failure",
            BrokerError::PathSecurity(_) => "path_security_violation",
            BrokerError::Configuration(_) => "configuration_error",
            BrokerError::InvalidRequest(_) => "invalid_request",
            BrokerError::Timeout(_) => "timeout",
            BrokerError::AdmissionTimeout(_) => "admission_timeout",
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::NotFound(_) | BrokerError::Busy(_) | BrokerError::AdmissionTimeout(_)
        )
    }
}

/// Errors from a storage backend, wrapped uniformly regardless of backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend-native failure (database driver, pool, query)
    #[error("{backend} storage error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend cannot be constructed from the given settings
    #[error("Storage configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    pub fn backend(backend: &'static str, err: impl std::fmt::Display) -> Self {
        StorageError::Backend {
            backend,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors from the agent runtime collaborator
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime process could not be started
    #[error("Failed to start runtime: {0}")]
    Spawn(String),

    /// Transport failure while talking to the runtime
    #[error("Runtime IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime emitted something we could not interpret
    #[error("Runtime protocol error: {0}")]
    Protocol(String),

    /// The connection is already closed
    #[error("Runtime connection closed")]
    Closed,
}
