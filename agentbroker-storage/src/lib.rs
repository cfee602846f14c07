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

//! Agentbroker Storage
//!
//! Durable session metadata behind one [`SessionStore`] trait:
//! - **memory**: in-process map, lost on restart (development)
//! - **file**: one JSON document per session
//! - **sqlite**: embedded single-file database, tuned for hot `touch`
//! - **postgres**: shared relational store for multi-instance deployments
//! - **redis**: shared key-value store with native per-key expiry
//!
//! Every backend applies the same TTL rule: a record whose `last_active_at`
//! is more than `ttl_secs` in the past is never returned by `get`, `touch`
//! or `list`, and is deleted lazily on first read.

use agentbroker_core::config::{StorageBackendKind, StorageConfig};
use agentbroker_core::{SessionMetadata, StorageError, StorageResult};
use async_trait::async_trait;
use std::sync::Arc;

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod sqlite;

mod codec;

pub use file::FileStore;
pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use sqlite::SqliteStore;

/// Pluggable durable store for session metadata.
///
/// Concurrent `save`/`touch`/`get` calls against one id are linearizable.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// TTL applied by this store (0 = never expire)
    fn ttl_secs(&self) -> u64;

    /// Insert or replace the record keyed by `metadata.session_id`
    async fn save(&self, metadata: &SessionMetadata) -> StorageResult<()>;

    /// Live record, deleting it first if it has expired
    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>>;

    /// Returns `false` when there was nothing to delete
    async fn delete(&self, session_id: &str) -> StorageResult<bool>;

    /// Set `last_active_at = now` and increment `message_count`.
    ///
    /// Returns `false` when the record is absent or expired.
    async fn touch(&self, session_id: &str) -> StorageResult<bool>;

    /// Ids of live records, optionally for one owner, oldest first
    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>>;

    /// Delete every expired record, returning how many went
    async fn purge_expired(&self) -> StorageResult<usize>;

    /// Release backend resources. Safe to call more than once.
    async fn close(&self) -> StorageResult<()>;
}

/// Build the backend selected by `config`
pub async fn create_store(config: &StorageConfig) -> StorageResult<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.backend {
        StorageBackendKind::Memory => Arc::new(InMemoryStore::new(config.ttl_secs)),
        StorageBackendKind::File => Arc::new(FileStore::open(&config.file_dir, config.ttl_secs).await?),
        StorageBackendKind::Sqlite => Arc::new(SqliteStore::open(&config.sqlite_path, config.ttl_secs).await?),
        #[cfg(feature = "postgres")]
        StorageBackendKind::Postgres => {
            Arc::new(PostgresStore::connect(&config.postgres, config.ttl_secs).await?)
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackendKind::Postgres => {
            return Err(StorageError::Configuration(
                "postgres backend not compiled in (enable the `postgres` feature)".into(),
            ))
        }
        #[cfg(feature = "redis")]
        StorageBackendKind::Redis => Arc::new(RedisStore::connect(&config.redis, config.ttl_secs).await?),
        #[cfg(not(feature = "redis"))]
        StorageBackendKind::Redis => {
            return Err(StorageError::Configuration(
                "redis backend not compiled in (enable the `redis` feature)".into(),
            ))
        }
    };
    tracing::info!(backend = store.backend_name(), ttl_secs = config.ttl_secs, "Session store ready");
    Ok(store)
}

/// Ids that can double as file names and log names
pub(crate) fn is_safe_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 256
        && !session_id.starts_with('.')
        && !session_id.contains(['/', '\\', '\0'])
}

pub(crate) fn invalid_id(session_id: &str) -> StorageError {
    StorageError::Serialization(format!("invalid session id: {:?}", session_id))
}
