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

//! Broker configuration
//!
//! Loaded from a TOML file and overridden by `AGENTBROKER_*` environment
//! variables. Priority: env > file > defaults.

use crate::error::{BrokerError, BrokerResult};
use crate::metadata::AgentOptions;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which storage backend holds session metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    File,
    Sqlite,
    Postgres,
    Redis,
}

impl std::str::FromStr for StorageBackendKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(BrokerError::Configuration(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Session TTL in seconds (0 = never expire)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Directory for the JSON file backend
    #[serde(default = "default_file_dir")]
    pub file_dir: PathBuf,

    /// Database file for the SQLite backend
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    #[serde(default)]
    pub postgres: PostgresConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            ttl_secs: default_ttl_secs(),
            file_dir: default_file_dir(),
            sqlite_path: default_sqlite_path(),
            postgres: PostgresConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pg_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pg_table")]
    pub table: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            user: default_pg_user(),
            password: String::new(),
            pool_size: default_pg_pool_size(),
            table: default_pg_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prepended to every session id to form the key
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum pooled sessions across all owners (0 = unlimited)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum stored sessions per owner (0 = unlimited)
    #[serde(default = "default_max_sessions_per_owner")]
    pub max_sessions_per_owner: usize,

    /// Admission capacity for simultaneous in-flight sends
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Idle handle eviction threshold in seconds (0 = never)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Process memory ceiling in MB (0 = disabled)
    #[serde(default)]
    pub memory_threshold_mb: u64,

    /// Bound on the admission wait in seconds (0 = wait indefinitely)
    #[serde(default)]
    pub admission_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_sessions_per_owner: default_max_sessions_per_owner(),
            max_concurrent_requests: default_max_concurrent_requests(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            memory_threshold_mb: 0,
            admission_timeout_secs: 0,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        (self.admission_timeout_secs > 0).then(|| Duration::from_secs(self.admission_timeout_secs))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Root under which every owner gets `<base_dir>/<owner_id>`
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default = "default_true")]
    pub auto_create_dir: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            auto_create_dir: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Agent runtime executable
    #[serde(default = "default_command")]
    pub command: String,

    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub args: Vec<String>,

    /// Root of the runtime's per-directory conversation logs
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    #[serde(default = "default_log_extension")]
    pub log_extension: String,

    /// Message sent on creation to learn the session id
    #[serde(default = "default_init_message")]
    pub init_message: String,

    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            log_root: default_log_root(),
            log_extension: default_log_extension(),
            init_message: default_init_message(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

/// Agent configuration applied to new and recovered sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentDefaults {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Map<String, Value>,
    #[serde(default)]
    pub plugins: Vec<Value>,
    #[serde(default)]
    pub setting_sources: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: None,
            permission_mode: default_permission_mode(),
            allowed_tools: default_allowed_tools(),
            disallowed_tools: Vec::new(),
            mcp_servers: Map::new(),
            plugins: Vec::new(),
            setting_sources: Vec::new(),
            model: None,
            max_turns: None,
            max_budget_usd: None,
        }
    }
}

impl AgentDefaults {
    pub fn to_options(&self) -> AgentOptions {
        AgentOptions {
            system_prompt: self.system_prompt.clone(),
            permission_mode: Some(self.permission_mode.clone()),
            allowed_tools: self.allowed_tools.clone(),
            disallowed_tools: self.disallowed_tools.clone(),
            mcp_servers: self.mcp_servers.clone(),
            plugins: self.plugins.clone(),
            setting_sources: self.setting_sources.clone(),
            model: self.model.clone(),
            max_turns: self.max_turns,
            max_budget_usd: self.max_budget_usd,
            add_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Ceiling on the serialized caller metadata blob
    #[serde(default = "default_max_metadata_bytes")]
    pub max_metadata_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_metadata_bytes: default_max_metadata_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default values
fn default_ttl_secs() -> u64 {
    3600
}

fn default_file_dir() -> PathBuf {
    PathBuf::from(".sessions")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("sessions.db")
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_database() -> String {
    "agentbroker".to_string()
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_pool_size() -> usize {
    10
}

fn default_pg_table() -> String {
    "sessions".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_key_prefix() -> String {
    "agentbroker:session:".to_string()
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_sessions_per_owner() -> usize {
    10
}

fn default_max_concurrent_requests() -> usize {
    16
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/home")
}

fn default_true() -> bool {
    true
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_log_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude/projects"))
}

fn default_log_extension() -> String {
    "jsonl".to_string()
}

fn default_init_message() -> String {
    "Hello".to_string()
}

fn default_close_timeout_secs() -> u64 {
    5
}

fn default_permission_mode() -> String {
    "bypassPermissions".to_string()
}

fn default_allowed_tools() -> Vec<String> {
    ["Bash", "Read", "Write", "Edit", "Glob", "Grep"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_metadata_bytes() -> usize {
    100 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BrokerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            BrokerError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Defaults overridden by environment variables
    ///
    /// Supported environment variables:
    /// - AGENTBROKER_STORAGE_BACKEND: memory | file | sqlite | postgres | redis
    /// - AGENTBROKER_SESSION_TTL: session TTL in seconds
    /// - AGENTBROKER_SQLITE_PATH / AGENTBROKER_FILE_DIR
    /// - AGENTBROKER_PG_HOST / _PORT / _DATABASE / _USER / _PASSWORD
    /// - AGENTBROKER_REDIS_URL / AGENTBROKER_REDIS_KEY_PREFIX
    /// - AGENTBROKER_BASE_DIR: sandbox root
    /// - AGENTBROKER_MAX_SESSIONS / AGENTBROKER_MAX_SESSIONS_PER_OWNER
    /// - AGENTBROKER_MAX_CONCURRENT: admission capacity
    /// - AGENTBROKER_IDLE_TIMEOUT: idle eviction in seconds
    /// - AGENTBROKER_MEMORY_THRESHOLD_MB
    /// - AGENTBROKER_LOG_ROOT / AGENTBROKER_RUNTIME_COMMAND
    /// - AGENTBROKER_LOG_LEVEL
    pub fn from_env() -> BrokerResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<&Path>) -> BrokerResult<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields for every variable `lookup` yields.
    pub fn apply_env<F>(&mut self, lookup: F) -> BrokerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENTBROKER_STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = lookup("AGENTBROKER_SESSION_TTL") {
            self.storage.ttl_secs = parse_env("AGENTBROKER_SESSION_TTL", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBROKER_FILE_DIR") {
            self.storage.file_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBROKER_PG_HOST") {
            self.storage.postgres.host = v;
        }
        if let Some(v) = lookup("AGENTBROKER_PG_PORT") {
            self.storage.postgres.port = parse_env("AGENTBROKER_PG_PORT", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_PG_DATABASE") {
            self.storage.postgres.database = v;
        }
        if let Some(v) = lookup("AGENTBROKER_PG_USER") {
            self.storage.postgres.user = v;
        }
        if let Some(v) = lookup("AGENTBROKER_PG_PASSWORD") {
            self.storage.postgres.password = v;
        }
        if let Some(v) = lookup("AGENTBROKER_REDIS_URL") {
            self.storage.redis.url = v;
        }
        if let Some(v) = lookup("AGENTBROKER_REDIS_KEY_PREFIX") {
            self.storage.redis.key_prefix = v;
        }
        if let Some(v) = lookup("AGENTBROKER_BASE_DIR") {
            self.sandbox.base_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBROKER_MAX_SESSIONS") {
            self.pool.max_sessions = parse_env("AGENTBROKER_MAX_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_MAX_SESSIONS_PER_OWNER") {
            self.pool.max_sessions_per_owner = parse_env("AGENTBROKER_MAX_SESSIONS_PER_OWNER", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_MAX_CONCURRENT") {
            self.pool.max_concurrent_requests = parse_env("AGENTBROKER_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_IDLE_TIMEOUT") {
            self.pool.idle_timeout_secs = parse_env("AGENTBROKER_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_MEMORY_THRESHOLD_MB") {
            self.pool.memory_threshold_mb = parse_env("AGENTBROKER_MEMORY_THRESHOLD_MB", &v)?;
        }
        if let Some(v) = lookup("AGENTBROKER_LOG_ROOT") {
            self.runtime.log_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTBROKER_RUNTIME_COMMAND") {
            self.runtime.command = v;
        }
        if let Some(v) = lookup("AGENTBROKER_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Reject settings the broker cannot start with
    pub fn validate(&self) -> BrokerResult<()> {
        if self.storage.backend == StorageBackendKind::Postgres {
            if self.storage.postgres.host.trim().is_empty() {
                return Err(BrokerError::Configuration(
                    "postgres backend requires a host".into(),
                ));
            }
            if self.storage.postgres.database.trim().is_empty() {
                return Err(BrokerError::Configuration(
                    "postgres backend requires a database".into(),
                ));
            }
            let table = &self.storage.postgres.table;
            if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(BrokerError::Configuration(format!(
                    "invalid postgres table name '{}'",
                    table
                )));
            }
        }
        if self.storage.backend == StorageBackendKind::Redis {
            if self.storage.redis.url.trim().is_empty() {
                return Err(BrokerError::Configuration(
                    "redis backend requires a url".into(),
                ));
            }
            if self.storage.redis.key_prefix.is_empty() {
                return Err(BrokerError::Configuration(
                    "redis backend requires a key prefix".into(),
                ));
            }
        }
        if self.pool.max_concurrent_requests == 0 {
            return Err(BrokerError::Configuration(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.pool.cleanup_interval_secs == 0 {
            return Err(BrokerError::Configuration(
                "cleanup_interval_secs must be at least 1".into(),
            ));
        }
        if self.runtime.command.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "runtime command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> BrokerResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BrokerError::Configuration(format!("invalid value for {}: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.storage.ttl_secs, 3600);
        assert_eq!(config.pool.max_concurrent_requests, 16);
        assert_eq!(config.limits.max_metadata_bytes, 102400);
        assert_eq!(config.defaults.permission_mode, "bypassPermissions");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BrokerConfig = toml::from_str(
            r#"
            [storage]
            backend = "sqlite"
            ttl_secs = 0

            [pool]
            max_sessions = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Sqlite);
        assert_eq!(config.storage.ttl_secs, 0);
        assert_eq!(config.pool.max_sessions, 5);
        assert_eq!(config.pool.max_sessions_per_owner, 10);
        assert_eq!(config.runtime.init_message, "Hello");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: BrokerConfig = toml::from_str("[pool]\nmax_sessions = 5\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("AGENTBROKER_MAX_SESSIONS", "42"),
            ("AGENTBROKER_STORAGE_BACKEND", "file"),
            ("AGENTBROKER_BASE_DIR", "/srv/agents"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.pool.max_sessions, 42);
        assert_eq!(config.storage.backend, StorageBackendKind::File);
        assert_eq!(config.sandbox.base_dir, PathBuf::from("/srv/agents"));
    }

    #[test]
    fn test_bad_env_value_is_configuration_error() {
        let mut config = BrokerConfig::default();
        let err = config
            .apply_env(|key| (key == "AGENTBROKER_SESSION_TTL").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = BrokerConfig::default();
        config.pool.max_concurrent_requests = 0;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.storage.backend = StorageBackendKind::Postgres;
        config.storage.postgres.host.clear();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.storage.backend = StorageBackendKind::Postgres;
        config.storage.postgres.table = "sessions; drop".into();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.storage.backend = StorageBackendKind::Redis;
        config.storage.redis.url = " ".into();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.runtime.command = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_settings() {
        let mut config: BrokerConfig =
            toml::from_str("[storage]\nbackend = \"redis\"\n\n[storage.redis]\nkey_prefix = \"team:\"\n").unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Redis);
        assert_eq!(config.storage.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.storage.redis.key_prefix, "team:");
        assert!(config.validate().is_ok());

        config
            .apply_env(|key| (key == "AGENTBROKER_REDIS_URL").then(|| "redis://cache:6380/2".to_string()))
            .unwrap();
        assert_eq!(config.storage.redis.url, "redis://cache:6380/2");
        assert_eq!("REDIS".parse::<StorageBackendKind>().unwrap(), StorageBackendKind::Redis);
    }
}
