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

//! Redis store for horizontally scaled deployments
//!
//! One JSON value per session under `key_prefix + session_id`. Every write
//! sets native key expiry of `ttl_secs`, and reads still apply the TTL rule
//! against `last_active_at`. Read-modify-write paths swap values with a
//! compare-and-set script, so concurrent touches from any instance are never
//! lost and a lazy expiry delete never removes a record saved after it was read.

use crate::{invalid_id, is_safe_session_id, SessionStore};
use agentbroker_core::config::RedisConfig;
use agentbroker_core::metadata::now;
use agentbroker_core::{SessionMetadata, StorageError, StorageResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::{info, warn};

const BACKEND: &str = "redis";

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Compare-and-set attempts before `touch` gives up under contention
const TOUCH_ATTEMPTS: usize = 32;

/// KEYS[1] = key, ARGV = expected, replacement, ttl secs (0 = no expiry)
const SWAP_SOURCE: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
";

/// KEYS[1] = key, ARGV[1] = expected
const DELETE_SOURCE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

fn swap_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(SWAP_SOURCE))
}

fn delete_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(DELETE_SOURCE))
}

pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl_secs: u64,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

fn redis_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::backend(BACKEND, e)
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig, ttl_secs: u64) -> StorageResult<Self> {
        if config.key_prefix.is_empty() {
            return Err(StorageError::Configuration("redis key prefix must not be empty".into()));
        }
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StorageError::Configuration(format!("invalid redis url: {}", e)))?;
        let mut conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(redis_err)?;
        if pong != "PONG" {
            return Err(redis_err(format!("unexpected PING reply {:?}", pong)));
        }
        info!(key_prefix = %config.key_prefix, "Redis session store connected");
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            ttl_secs,
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }

    fn connection(&self) -> StorageResult<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(redis_err("store is closed"));
        }
        Ok(self.conn.clone())
    }

    async fn read(&self, conn: &mut ConnectionManager, key: &str) -> StorageResult<Option<String>> {
        redis::cmd("GET").arg(key).query_async(conn).await.map_err(redis_err)
    }

    async fn delete_if_unchanged(&self, conn: &mut ConnectionManager, key: &str, expected: &str) -> StorageResult<bool> {
        let removed: i64 = delete_script()
            .key(key)
            .arg(expected)
            .invoke_async(conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    /// Every `(key, raw value)` under the prefix; keys that vanish mid-scan are skipped
    async fn scan(&self, conn: &mut ConnectionManager) -> StorageResult<Vec<(String, String)>> {
        let pattern = format!("{}*", escape_glob(&self.key_prefix));
        let mut cursor: u64 = 0;
        let mut records = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(redis_err)?;
            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(conn)
                    .await
                    .map_err(redis_err)?;
                records.extend(
                    keys.into_iter()
                        .zip(values)
                        .filter_map(|(key, value)| value.map(|v| (key, v))),
                );
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records.dedup_by(|a, b| a.0 == b.0);
        Ok(records)
    }
}

fn encode(metadata: &SessionMetadata) -> StorageResult<String> {
    Ok(serde_json::to_string(metadata)?)
}

fn decode(raw: &str) -> StorageResult<SessionMetadata> {
    Ok(serde_json::from_str(raw)?)
}

/// Escape glob metacharacters so the prefix matches literally in SCAN MATCH
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl SessionStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    async fn save(&self, metadata: &SessionMetadata) -> StorageResult<()> {
        if !is_safe_session_id(&metadata.session_id) {
            return Err(invalid_id(&metadata.session_id));
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(&metadata.session_id)).arg(encode(metadata)?);
        if self.ttl_secs > 0 {
            cmd.arg("EX").arg(self.ttl_secs);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>> {
        let mut conn = self.connection()?;
        let key = self.key(session_id);
        let Some(raw) = self.read(&mut conn, &key).await? else {
            return Ok(None);
        };
        let meta = decode(&raw)?;
        if meta.is_expired(self.ttl_secs, now()) {
            self.delete_if_unchanged(&mut conn, &key, &raw).await?;
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn touch(&self, session_id: &str) -> StorageResult<bool> {
        let mut conn = self.connection()?;
        let key = self.key(session_id);
        for _ in 0..TOUCH_ATTEMPTS {
            let Some(raw) = self.read(&mut conn, &key).await? else {
                return Ok(false);
            };
            let mut meta = decode(&raw)?;
            let ts = now();
            if meta.is_expired(self.ttl_secs, ts) {
                self.delete_if_unchanged(&mut conn, &key, &raw).await?;
                return Ok(false);
            }
            meta.touch(ts);
            let swapped: i64 = swap_script()
                .key(&key)
                .arg(&raw)
                .arg(encode(&meta)?)
                .arg(self.ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_err)?;
            if swapped == 1 {
                return Ok(true);
            }
        }
        warn!(session_id, "Touch kept losing to concurrent writers");
        Err(redis_err(format!("touch of {} did not settle after {} attempts", session_id, TOUCH_ATTEMPTS)))
    }

    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>> {
        let mut conn = self.connection()?;
        let ts = now();
        let mut live = Vec::new();
        for (key, raw) in self.scan(&mut conn).await? {
            match decode(&raw) {
                Ok(meta) => live.push(meta),
                Err(e) => warn!(key = %key, "Skipping undecodable session record: {}", e),
            }
        }
        live.retain(|m| owner_id.map_or(true, |owner| m.owner_id == owner) && !m.is_expired(self.ttl_secs, ts));
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        Ok(live.into_iter().map(|m| m.session_id).collect())
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        if self.ttl_secs == 0 {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let ts = now();
        let mut purged = 0;
        for (key, raw) in self.scan(&mut conn).await? {
            let Ok(meta) = decode(&raw) else {
                continue;
            };
            if meta.is_expired(self.ttl_secs, ts) && self.delete_if_unchanged(&mut conn, &key, &raw).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
