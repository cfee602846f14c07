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

//! Embedded SQLite store for single-instance deployments
//!
//! `touch` runs once per message, so the store keeps one persistent
//! connection in WAL mode with relaxed fsync and a large page cache.
//! Blocking SQLite calls run on the blocking pool.

use crate::codec::{from_json_text, from_micros, to_json_text, to_micros};
use crate::SessionStore;
use agentbroker_core::metadata::{expiry_cutoff, now};
use agentbroker_core::{AgentOptions, SessionMetadata, StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const BACKEND: &str = "sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id       TEXT PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    subdir           TEXT,
    cwd              TEXT NOT NULL,
    system_prompt    TEXT,
    mcp_servers      TEXT NOT NULL DEFAULT '{}',
    plugins          TEXT NOT NULL DEFAULT '[]',
    model            TEXT,
    permission_mode  TEXT,
    allowed_tools    TEXT NOT NULL DEFAULT '[]',
    disallowed_tools TEXT NOT NULL DEFAULT '[]',
    setting_sources  TEXT NOT NULL DEFAULT '[]',
    add_dirs         TEXT NOT NULL DEFAULT '[]',
    max_turns        INTEGER,
    max_budget_usd   REAL,
    created_at       INTEGER NOT NULL,
    last_active_at   INTEGER NOT NULL,
    message_count    INTEGER NOT NULL DEFAULT 0,
    metadata         TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id);
CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active_at);
";

const COLUMNS: &str = "session_id, owner_id, subdir, cwd, system_prompt, mcp_servers, plugins, model, \
     permission_mode, allowed_tools, disallowed_tools, setting_sources, add_dirs, max_turns, \
     max_budget_usd, created_at, last_active_at, message_count, metadata";

pub struct SqliteStore {
    path: PathBuf,
    ttl_secs: u64,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>, ttl_secs: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&open_path)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA cache_size=-40000;
                 PRAGMA temp_store=MEMORY;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?
        .map_err(|e| StorageError::backend(BACKEND, e))?;

        info!(path = %path.display(), "SQLite session store opened");
        Ok(Self {
            path,
            ttl_secs,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| StorageError::backend(BACKEND, "store is closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::backend(BACKEND, e))?
    }

    fn cutoff_micros(&self) -> Option<i64> {
        expiry_cutoff(self.ttl_secs, now()).map(to_micros)
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::backend(BACKEND, e)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        session_id: row.get(0)?,
        owner_id: row.get(1)?,
        subdir: row.get(2)?,
        cwd: row.get(3)?,
        system_prompt: row.get(4)?,
        mcp_servers: row.get(5)?,
        plugins: row.get(6)?,
        model: row.get(7)?,
        permission_mode: row.get(8)?,
        allowed_tools: row.get(9)?,
        disallowed_tools: row.get(10)?,
        setting_sources: row.get(11)?,
        add_dirs: row.get(12)?,
        max_turns: row.get(13)?,
        max_budget_usd: row.get(14)?,
        created_at: row.get(15)?,
        last_active_at: row.get(16)?,
        message_count: row.get(17)?,
        metadata: row.get(18)?,
    })
}

/// Row as SQLite hands it back, before JSON columns are decoded
struct RawRow {
    session_id: String,
    owner_id: String,
    subdir: Option<String>,
    cwd: String,
    system_prompt: Option<String>,
    mcp_servers: Option<String>,
    plugins: Option<String>,
    model: Option<String>,
    permission_mode: Option<String>,
    allowed_tools: Option<String>,
    disallowed_tools: Option<String>,
    setting_sources: Option<String>,
    add_dirs: Option<String>,
    max_turns: Option<i64>,
    max_budget_usd: Option<f64>,
    created_at: i64,
    last_active_at: i64,
    message_count: i64,
    metadata: Option<String>,
}

impl RawRow {
    fn decode(self) -> StorageResult<SessionMetadata> {
        Ok(SessionMetadata {
            session_id: self.session_id,
            owner_id: self.owner_id,
            subdir: self.subdir,
            cwd: PathBuf::from(self.cwd),
            options: AgentOptions {
                system_prompt: self.system_prompt,
                permission_mode: self.permission_mode,
                allowed_tools: from_json_text(self.allowed_tools)?,
                disallowed_tools: from_json_text(self.disallowed_tools)?,
                mcp_servers: from_json_text(self.mcp_servers)?,
                plugins: from_json_text(self.plugins)?,
                setting_sources: from_json_text(self.setting_sources)?,
                model: self.model,
                max_turns: self.max_turns.and_then(|t| u32::try_from(t).ok()),
                max_budget_usd: self.max_budget_usd,
                add_dirs: from_json_text(self.add_dirs)?,
            },
            created_at: from_micros(self.created_at)?,
            last_active_at: from_micros(self.last_active_at)?,
            message_count: u64::try_from(self.message_count).unwrap_or(0),
            metadata: from_json_text(self.metadata)?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    async fn save(&self, metadata: &SessionMetadata) -> StorageResult<()> {
        let m = metadata.clone();
        let o = &m.options;
        let mcp_servers = to_json_text(&o.mcp_servers)?;
        let plugins = to_json_text(&o.plugins)?;
        let allowed = to_json_text(&o.allowed_tools)?;
        let disallowed = to_json_text(&o.disallowed_tools)?;
        let sources = to_json_text(&o.setting_sources)?;
        let add_dirs = to_json_text(&o.add_dirs)?;
        let blob = to_json_text(&m.metadata)?;

        self.with_conn(move |conn| {
            let o = &m.options;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO sessions ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                    COLUMNS
                ),
                params![
                    m.session_id,
                    m.owner_id,
                    m.subdir,
                    m.cwd.to_string_lossy().into_owned(),
                    o.system_prompt,
                    mcp_servers,
                    plugins,
                    o.model,
                    o.permission_mode,
                    allowed,
                    disallowed,
                    sources,
                    add_dirs,
                    o.max_turns.map(i64::from),
                    o.max_budget_usd,
                    to_micros(m.created_at),
                    to_micros(m.last_active_at),
                    i64::try_from(m.message_count).unwrap_or(i64::MAX),
                    blob,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>> {
        let id = session_id.to_string();
        let cutoff = self.cutoff_micros();
        let row = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {} FROM sessions WHERE session_id = ?1", COLUMNS),
                        params![id],
                        read_row,
                    )
                    .optional()
                    .map_err(sql_err)?;
                match (row, cutoff) {
                    (Some(row), Some(cutoff)) if row.last_active_at < cutoff => {
                        conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![id])
                            .map_err(sql_err)?;
                        Ok(None)
                    }
                    (row, _) => Ok(row),
                }
            })
            .await?;
        row.map(RawRow::decode).transpose()
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM sessions WHERE session_id = ?1", params![id])
                .map_err(sql_err)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn touch(&self, session_id: &str) -> StorageResult<bool> {
        let id = session_id.to_string();
        let ts = to_micros(now());
        let cutoff = self.cutoff_micros();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions
                     SET last_active_at = MAX(last_active_at, ?2), message_count = message_count + 1
                     WHERE session_id = ?1 AND (?3 IS NULL OR last_active_at >= ?3)",
                    params![id, ts, cutoff],
                )
                .map_err(sql_err)?;
            if updated == 0 && cutoff.is_some() {
                conn.execute(
                    "DELETE FROM sessions WHERE session_id = ?1 AND last_active_at < ?2",
                    params![id, cutoff],
                )
                .map_err(sql_err)?;
            }
            Ok(updated > 0)
        })
        .await
    }

    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>> {
        let owner = owner_id.map(str::to_string);
        let cutoff = self.cutoff_micros();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT session_id FROM sessions
                     WHERE (?1 IS NULL OR owner_id = ?1) AND (?2 IS NULL OR last_active_at >= ?2)
                     ORDER BY created_at, session_id",
                )
                .map_err(sql_err)?;
            let ids = stmt
                .query_map(params![owner, cutoff], |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(sql_err)?;
            Ok(ids)
        })
        .await
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        let Some(cutoff) = self.cutoff_micros() else {
            return Ok(0);
        };
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE last_active_at < ?1", params![cutoff])
                .map_err(sql_err)
        })
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        let conn = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || conn.lock().take())
            .await
            .map_err(|e| StorageError::backend(BACKEND, e))?;
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| sql_err(e))?;
            info!(path = %self.path.display(), "SQLite session store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("s.db"), 0).await.unwrap();
        let mode: String = store
            .with_conn(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(sql_err)
            })
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("s.db"), 0).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.get("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("s.db");
        let meta = SessionMetadata::new("abc-1", "alice", None, PathBuf::from("/base/alice"), AgentOptions::default());
        {
            let store = SqliteStore::open(&path, 0).await.unwrap();
            store.save(&meta).await.unwrap();
            store.touch("abc-1").await.unwrap();
            store.close().await.unwrap();
        }
        let store = SqliteStore::open(&path, 0).await.unwrap();
        let loaded = store.get("abc-1").await.unwrap().unwrap();
        assert_eq!(loaded.message_count, 1);
        assert_eq!(loaded.created_at, meta.created_at);
    }
}
