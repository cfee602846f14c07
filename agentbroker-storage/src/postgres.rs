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

//! PostgreSQL store for multi-instance deployments
//!
//! Saves are upserts; `touch` and `delete` report success from the affected
//! row count, so concurrent writers across instances stay linearizable per id.

use crate::SessionStore;
use agentbroker_core::config::PostgresConfig;
use agentbroker_core::metadata::{expiry_cutoff, now};
use agentbroker_core::{AgentOptions, SessionMetadata, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Object, Pool, PoolConfig, Runtime};
use serde_json::Value;
use std::path::PathBuf;
use tokio_postgres::{NoTls, Row};
use tracing::info;

const BACKEND: &str = "postgres";

const COLUMNS: &str = "session_id, owner_id, subdir, cwd, system_prompt, mcp_servers, plugins, model, \
     permission_mode, allowed_tools, disallowed_tools, setting_sources, add_dirs, max_turns, \
     max_budget_usd, created_at, last_active_at, message_count, metadata";

pub struct PostgresStore {
    pool: Pool,
    table: String,
    ttl_secs: u64,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("table", &self.table)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

fn pg_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::backend(BACKEND, e)
}

impl PostgresStore {
    pub async fn connect(config: &PostgresConfig, ttl_secs: u64) -> StorageResult<Self> {
        if !config.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || config.table.is_empty() {
            return Err(StorageError::Configuration(format!(
                "invalid postgres table name '{}'",
                config.table
            )));
        }

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        if !config.password.is_empty() {
            cfg.password = Some(config.password.clone());
        }
        cfg.pool = Some(PoolConfig::new(config.pool_size.max(1)));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Configuration(format!("postgres pool: {}", e)))?;

        let store = Self {
            pool,
            table: config.table.clone(),
            ttl_secs,
        };
        store.init_schema().await?;
        info!(host = %config.host, database = %config.database, table = %store.table, "PostgreSQL session store ready");
        Ok(store)
    }

    async fn client(&self) -> StorageResult<Object> {
        self.pool.get().await.map_err(pg_err)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let client = self.client().await?;
        let t = &self.table;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    session_id       TEXT PRIMARY KEY,
                    owner_id         TEXT NOT NULL,
                    subdir           TEXT,
                    cwd              TEXT NOT NULL,
                    system_prompt    TEXT,
                    mcp_servers      JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    plugins          JSONB NOT NULL DEFAULT '[]'::jsonb,
                    model            TEXT,
                    permission_mode  TEXT,
                    allowed_tools    JSONB NOT NULL DEFAULT '[]'::jsonb,
                    disallowed_tools JSONB NOT NULL DEFAULT '[]'::jsonb,
                    setting_sources  JSONB NOT NULL DEFAULT '[]'::jsonb,
                    add_dirs         JSONB NOT NULL DEFAULT '[]'::jsonb,
                    max_turns        INTEGER,
                    max_budget_usd   DOUBLE PRECISION,
                    created_at       TIMESTAMPTZ NOT NULL,
                    last_active_at   TIMESTAMPTZ NOT NULL,
                    message_count    BIGINT NOT NULL DEFAULT 0,
                    metadata         JSONB NOT NULL DEFAULT '{{}}'::jsonb
                );
                CREATE INDEX IF NOT EXISTS idx_{t}_owner ON {t}(owner_id);
                CREATE INDEX IF NOT EXISTS idx_{t}_last_active ON {t}(last_active_at);"
            ))
            .await
            .map_err(pg_err)
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        expiry_cutoff(self.ttl_secs, now())
    }

    /// Remove the row only if it is still past the TTL when the delete runs,
    /// so a save that refreshed it after it was read survives
    async fn delete_if_stale(&self, client: &Object, session_id: &str) -> StorageResult<bool> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(false);
        };
        let removed = client
            .execute(&stale_delete_sql(&self.table), &[&session_id, &cutoff])
            .await
            .map_err(pg_err)?;
        Ok(removed > 0)
    }
}

fn stale_delete_sql(table: &str) -> String {
    format!("DELETE FROM {} WHERE session_id = $1 AND last_active_at < $2", table)
}

fn to_value<T: serde::Serialize>(value: &T) -> StorageResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_value<T: serde::de::DeserializeOwned + Default>(value: Option<Value>) -> StorageResult<T> {
    match value {
        Some(Value::Null) | None => Ok(T::default()),
        Some(v) => Ok(serde_json::from_value(v)?),
    }
}

fn decode_row(row: &Row) -> StorageResult<SessionMetadata> {
    let cwd: String = row.try_get("cwd").map_err(pg_err)?;
    let max_turns: Option<i32> = row.try_get("max_turns").map_err(pg_err)?;
    let message_count: i64 = row.try_get("message_count").map_err(pg_err)?;
    Ok(SessionMetadata {
        session_id: row.try_get("session_id").map_err(pg_err)?,
        owner_id: row.try_get("owner_id").map_err(pg_err)?,
        subdir: row.try_get("subdir").map_err(pg_err)?,
        cwd: PathBuf::from(cwd),
        options: AgentOptions {
            system_prompt: row.try_get("system_prompt").map_err(pg_err)?,
            permission_mode: row.try_get("permission_mode").map_err(pg_err)?,
            allowed_tools: from_value(row.try_get("allowed_tools").map_err(pg_err)?)?,
            disallowed_tools: from_value(row.try_get("disallowed_tools").map_err(pg_err)?)?,
            mcp_servers: from_value(row.try_get("mcp_servers").map_err(pg_err)?)?,
            plugins: from_value(row.try_get("plugins").map_err(pg_err)?)?,
            setting_sources: from_value(row.try_get("setting_sources").map_err(pg_err)?)?,
            model: row.try_get("model").map_err(pg_err)?,
            max_turns: max_turns.and_then(|t| u32::try_from(t).ok()),
            max_budget_usd: row.try_get("max_budget_usd").map_err(pg_err)?,
            add_dirs: from_value(row.try_get("add_dirs").map_err(pg_err)?)?,
        },
        created_at: row.try_get("created_at").map_err(pg_err)?,
        last_active_at: row.try_get("last_active_at").map_err(pg_err)?,
        message_count: u64::try_from(message_count).unwrap_or(0),
        metadata: from_value(row.try_get("metadata").map_err(pg_err)?)?,
    })
}

#[async_trait]
impl SessionStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    async fn save(&self, m: &SessionMetadata) -> StorageResult<()> {
        let o = &m.options;
        let cwd = m.cwd.to_string_lossy().into_owned();
        let mcp_servers = to_value(&o.mcp_servers)?;
        let plugins = to_value(&o.plugins)?;
        let allowed = to_value(&o.allowed_tools)?;
        let disallowed = to_value(&o.disallowed_tools)?;
        let sources = to_value(&o.setting_sources)?;
        let add_dirs = to_value(&o.add_dirs)?;
        let blob = to_value(&m.metadata)?;
        let max_turns = o.max_turns.and_then(|t| i32::try_from(t).ok());
        let message_count = i64::try_from(m.message_count).unwrap_or(i64::MAX);

        let client = self.client().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO {t} ({cols}) VALUES
                     ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                     ON CONFLICT (session_id) DO UPDATE SET
                        owner_id = EXCLUDED.owner_id,
                        subdir = EXCLUDED.subdir,
                        cwd = EXCLUDED.cwd,
                        system_prompt = EXCLUDED.system_prompt,
                        mcp_servers = EXCLUDED.mcp_servers,
                        plugins = EXCLUDED.plugins,
                        model = EXCLUDED.model,
                        permission_mode = EXCLUDED.permission_mode,
                        allowed_tools = EXCLUDED.allowed_tools,
                        disallowed_tools = EXCLUDED.disallowed_tools,
                        setting_sources = EXCLUDED.setting_sources,
                        add_dirs = EXCLUDED.add_dirs,
                        max_turns = EXCLUDED.max_turns,
                        max_budget_usd = EXCLUDED.max_budget_usd,
                        created_at = EXCLUDED.created_at,
                        last_active_at = EXCLUDED.last_active_at,
                        message_count = EXCLUDED.message_count,
                        metadata = EXCLUDED.metadata",
                    t = self.table,
                    cols = COLUMNS
                ),
                &[
                    &m.session_id,
                    &m.owner_id,
                    &m.subdir,
                    &cwd,
                    &o.system_prompt,
                    &mcp_servers,
                    &plugins,
                    &o.model,
                    &o.permission_mode,
                    &allowed,
                    &disallowed,
                    &sources,
                    &add_dirs,
                    &max_turns,
                    &o.max_budget_usd,
                    &m.created_at,
                    &m.last_active_at,
                    &message_count,
                    &blob,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM {} WHERE session_id = $1", COLUMNS, self.table),
                &[&session_id],
            )
            .await
            .map_err(pg_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let meta = decode_row(&row)?;
        if meta.is_expired(self.ttl_secs, now()) {
            self.delete_if_stale(&client, session_id).await?;
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        let client = self.client().await?;
        let removed = client
            .execute(
                &format!("DELETE FROM {} WHERE session_id = $1", self.table),
                &[&session_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(removed > 0)
    }

    async fn touch(&self, session_id: &str) -> StorageResult<bool> {
        let client = self.client().await?;
        let ts = now();
        let cutoff = self.cutoff();
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET last_active_at = GREATEST(last_active_at, $2),
                                   message_count = message_count + 1
                     WHERE session_id = $1 AND ($3::timestamptz IS NULL OR last_active_at >= $3)",
                    self.table
                ),
                &[&session_id, &ts, &cutoff],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            self.delete_if_stale(&client, session_id).await?;
        }
        Ok(updated > 0)
    }

    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>> {
        let client = self.client().await?;
        let cutoff = self.cutoff();
        let rows = client
            .query(
                &format!(
                    "SELECT session_id FROM {} \
                     WHERE ($1::text IS NULL OR owner_id = $1) \
                       AND ($2::timestamptz IS NULL OR last_active_at >= $2) \
                     ORDER BY created_at, session_id",
                    self.table
                ),
                &[&owner_id, &cutoff],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(pg_err))
            .collect()
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        let Some(cutoff) = self.cutoff() else {
            return Ok(0);
        };
        let client = self.client().await?;
        let removed = client
            .execute(
                &format!("DELETE FROM {} WHERE last_active_at < $1", self.table),
                &[&cutoff],
            )
            .await
            .map_err(pg_err)?;
        Ok(removed as usize)
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.pool.is_closed() {
            self.pool.close();
            info!(table = %self.table, "PostgreSQL session store closed");
        }
        Ok(())
    }
}
