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

//! Behaviour every storage backend must share

use agentbroker_core::metadata::now;
use agentbroker_core::{AgentOptions, SessionMetadata};
use agentbroker_storage::{FileStore, InMemoryStore, SessionStore, SqliteStore};
use chrono::Duration;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const TTL: u64 = 60;

fn sample(session_id: &str, owner: &str) -> SessionMetadata {
    let mut options = AgentOptions {
        system_prompt: Some("You are terse.".into()),
        permission_mode: Some("bypassPermissions".into()),
        allowed_tools: vec!["Read".into(), "Grep".into()],
        disallowed_tools: vec!["Bash".into()],
        plugins: vec![json!({"type": "local", "path": "/opt/plugins/lint"})],
        setting_sources: vec!["project".into()],
        model: Some("sonnet".into()),
        max_turns: Some(25),
        max_budget_usd: Some(1.75),
        add_dirs: vec!["data".into()],
        ..AgentOptions::default()
    };
    options
        .mcp_servers
        .insert("fs".into(), json!({"command": "mcp-fs", "args": ["--root", "/"]}));

    let mut blob = serde_json::Map::new();
    blob.insert("ticket".into(), json!("OPS-12"));
    blob.insert("priority".into(), json!(3));

    SessionMetadata::new(
        session_id,
        owner,
        Some("proj".into()),
        PathBuf::from(format!("/base/{}/proj", owner)),
        options,
    )
    .with_metadata(blob)
}

/// A record whose last activity lies beyond the TTL
fn stale(session_id: &str, owner: &str) -> SessionMetadata {
    let mut meta = sample(session_id, owner);
    meta.last_active_at = now() - Duration::seconds(TTL as i64 + 5);
    meta
}

struct Backends {
    _dir: TempDir,
    stores: Vec<Arc<dyn SessionStore>>,
}

async fn backends(ttl: u64) -> Backends {
    let dir = tempfile::tempdir().unwrap();
    let stores: Vec<Arc<dyn SessionStore>> = vec![
        Arc::new(InMemoryStore::new(ttl)),
        Arc::new(FileStore::open(dir.path().join("files"), ttl).await.unwrap()),
        Arc::new(SqliteStore::open(dir.path().join("sessions.db"), ttl).await.unwrap()),
    ];
    Backends { _dir: dir, stores }
}

/// save followed by get returns an equal record on every backend
#[tokio::test]
async fn test_round_trip_preserves_every_field() {
    for store in backends(TTL).await.stores {
        let meta = sample("rt-1", "alice");
        store.save(&meta).await.unwrap();
        let loaded = store.get("rt-1").await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&meta), "backend {}", store.backend_name());
    }
}

/// save on an existing id replaces the record
#[tokio::test]
async fn test_save_is_upsert() {
    for store in backends(TTL).await.stores {
        let mut meta = sample("up-1", "alice");
        store.save(&meta).await.unwrap();
        meta.options.model = Some("opus".into());
        meta.message_count = 7;
        store.save(&meta).await.unwrap();

        let loaded = store.get("up-1").await.unwrap().unwrap();
        assert_eq!(loaded.options.model.as_deref(), Some("opus"), "backend {}", store.backend_name());
        assert_eq!(loaded.message_count, 7);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }
}

/// touch bumps the counter and never moves last_active_at backwards
#[tokio::test]
async fn test_touch_updates_activity() {
    for store in backends(TTL).await.stores {
        let meta = sample("t-1", "alice");
        store.save(&meta).await.unwrap();

        assert!(store.touch("t-1").await.unwrap());
        assert!(store.touch("t-1").await.unwrap());
        let loaded = store.get("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.message_count, 2, "backend {}", store.backend_name());
        assert!(loaded.last_active_at >= meta.last_active_at);
        assert_eq!(loaded.created_at, meta.created_at);

        assert!(!store.touch("missing").await.unwrap());
    }
}

/// concurrent touches against one id are all counted
#[tokio::test]
async fn test_concurrent_touch_is_linearizable() {
    for store in backends(TTL).await.stores {
        store.save(&sample("c-1", "alice")).await.unwrap();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move { store.touch("c-1").await.unwrap() }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        let loaded = store.get("c-1").await.unwrap().unwrap();
        assert_eq!(loaded.message_count, 16, "backend {}", store.backend_name());
    }
}

/// delete reports whether a record existed
#[tokio::test]
async fn test_delete_is_terminal() {
    for store in backends(TTL).await.stores {
        store.save(&sample("d-1", "alice")).await.unwrap();
        assert!(store.delete("d-1").await.unwrap());
        assert!(!store.delete("d-1").await.unwrap());
        assert!(store.get("d-1").await.unwrap().is_none());
        assert!(!store.touch("d-1").await.unwrap());
    }
}

/// list filters by owner and orders by creation
#[tokio::test]
async fn test_list_by_owner() {
    for store in backends(TTL).await.stores {
        let mut first = sample("l-1", "alice");
        first.created_at = now() - Duration::seconds(10);
        store.save(&first).await.unwrap();
        store.save(&sample("l-2", "bob")).await.unwrap();
        store.save(&sample("l-3", "alice")).await.unwrap();

        let name = store.backend_name();
        assert_eq!(store.list(Some("alice")).await.unwrap(), vec!["l-1", "l-3"], "backend {}", name);
        assert_eq!(store.list(Some("bob")).await.unwrap(), vec!["l-2"]);
        assert!(store.list(Some("carol")).await.unwrap().is_empty());
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }
}

/// records past last_active_at + ttl are absent from get, touch and list
#[tokio::test]
async fn test_ttl_expiry_is_lazy_and_consistent() {
    for store in backends(TTL).await.stores {
        let name = store.backend_name();
        store.save(&stale("old-1", "alice")).await.unwrap();
        store.save(&stale("old-2", "alice")).await.unwrap();
        store.save(&sample("new-1", "alice")).await.unwrap();

        assert_eq!(store.list(Some("alice")).await.unwrap(), vec!["new-1"], "backend {}", name);
        assert!(store.get("old-1").await.unwrap().is_none(), "backend {}", name);
        assert!(!store.touch("old-2").await.unwrap(), "backend {}", name);

        // both stale records were removed on first access
        assert!(!store.delete("old-1").await.unwrap(), "backend {}", name);
        assert!(!store.delete("old-2").await.unwrap(), "backend {}", name);
    }
}

/// a record exactly at the boundary is still live
#[tokio::test]
async fn test_ttl_boundary_record_is_live() {
    for store in backends(TTL).await.stores {
        let mut meta = sample("edge-1", "alice");
        meta.last_active_at = now() - Duration::seconds(TTL as i64 - 5);
        store.save(&meta).await.unwrap();
        assert!(store.get("edge-1").await.unwrap().is_some(), "backend {}", store.backend_name());
    }
}

/// ttl = 0 keeps records forever
#[tokio::test]
async fn test_zero_ttl_never_expires() {
    for store in backends(0).await.stores {
        let mut meta = sample("forever-1", "alice");
        meta.last_active_at = now() - Duration::days(400);
        store.save(&meta).await.unwrap();
        assert!(store.get("forever-1").await.unwrap().is_some(), "backend {}", store.backend_name());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}

/// purge_expired removes exactly the stale records
#[tokio::test]
async fn test_purge_expired_counts() {
    for store in backends(TTL).await.stores {
        store.save(&stale("p-1", "alice")).await.unwrap();
        store.save(&stale("p-2", "bob")).await.unwrap();
        store.save(&sample("p-3", "bob")).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 2, "backend {}", store.backend_name());
        assert_eq!(store.list(None).await.unwrap(), vec!["p-3"]);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}

/// close may be called repeatedly
#[tokio::test]
async fn test_close_is_idempotent() {
    for store in backends(TTL).await.stores {
        store.close().await.unwrap();
        store.close().await.unwrap();
    }
}

/// Runs the shared checks against PostgreSQL when AGENTBROKER_TEST_PG_HOST is set
#[cfg(feature = "postgres")]
#[tokio::test]
async fn test_postgres_conformance() {
    use agentbroker_core::config::PostgresConfig;
    use agentbroker_storage::PostgresStore;

    let Ok(host) = std::env::var("AGENTBROKER_TEST_PG_HOST") else {
        eprintln!("AGENTBROKER_TEST_PG_HOST not set, skipping postgres conformance");
        return;
    };
    let config = PostgresConfig {
        host,
        database: std::env::var("AGENTBROKER_TEST_PG_DATABASE").unwrap_or_else(|_| "agentbroker_test".into()),
        user: std::env::var("AGENTBROKER_TEST_PG_USER").unwrap_or_else(|_| "postgres".into()),
        password: std::env::var("AGENTBROKER_TEST_PG_PASSWORD").unwrap_or_default(),
        table: format!("sessions_test_{}", std::process::id()),
        ..PostgresConfig::default()
    };
    let store = PostgresStore::connect(&config, TTL).await.unwrap();

    let meta = sample("pg-1", "alice");
    store.save(&meta).await.unwrap();
    assert_eq!(store.get("pg-1").await.unwrap(), Some(meta));
    assert!(store.touch("pg-1").await.unwrap());
    store.save(&stale("pg-old", "alice")).await.unwrap();
    assert_eq!(store.list(Some("alice")).await.unwrap(), vec!["pg-1"]);
    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert!(store.delete("pg-1").await.unwrap());
    store.close().await.unwrap();
}

/// Runs the shared checks against Redis when AGENTBROKER_TEST_REDIS_URL is set
#[cfg(feature = "redis")]
#[tokio::test]
async fn test_redis_conformance() {
    use agentbroker_core::config::RedisConfig;
    use agentbroker_storage::RedisStore;

    let Ok(url) = std::env::var("AGENTBROKER_TEST_REDIS_URL") else {
        eprintln!("AGENTBROKER_TEST_REDIS_URL not set, skipping redis conformance");
        return;
    };
    let config = RedisConfig {
        url,
        key_prefix: format!("agentbroker:test:{}:", std::process::id()),
    };
    let store = Arc::new(RedisStore::connect(&config, TTL).await.unwrap());

    let meta = sample("rd-1", "alice");
    store.save(&meta).await.unwrap();
    assert_eq!(store.get("rd-1").await.unwrap(), Some(meta.clone()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.touch("rd-1").await.unwrap() })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(store.get("rd-1").await.unwrap().unwrap().message_count, 8);

    store.save(&stale("rd-old-1", "alice")).await.unwrap();
    store.save(&stale("rd-old-2", "alice")).await.unwrap();
    store.save(&sample("rd-2", "bob")).await.unwrap();
    assert_eq!(store.list(Some("alice")).await.unwrap(), vec!["rd-1"]);
    assert_eq!(store.list(None).await.unwrap(), vec!["rd-1", "rd-2"]);
    assert!(store.get("rd-old-1").await.unwrap().is_none());
    assert!(!store.touch("rd-old-1").await.unwrap());
    assert_eq!(store.purge_expired().await.unwrap(), 1);

    assert!(store.delete("rd-1").await.unwrap());
    assert!(!store.delete("rd-1").await.unwrap());
    assert!(store.delete("rd-2").await.unwrap());
    store.close().await.unwrap();
    store.close().await.unwrap();
    assert!(store.get("rd-2").await.is_err());
}
