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

//! Rebuilds session metadata from the runtime's on-disk conversation logs
//! when the store has no record

use agentbroker_core::config::AgentDefaults;
use agentbroker_core::recovery::{find_session_log, resolve_owner, sorted_subdirs, ResolvedOwner};
use agentbroker_core::{BrokerError, BrokerResult, SessionMetadata, StorageError};
use agentbroker_storage::SessionStore;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RecoveryResolver {
    log_root: PathBuf,
    log_extension: String,
    base_dir: PathBuf,
    defaults: AgentDefaults,
}

impl RecoveryResolver {
    pub fn new(
        log_root: impl Into<PathBuf>,
        log_extension: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        defaults: AgentDefaults,
    ) -> Self {
        Self {
            log_root: log_root.into(),
            log_extension: log_extension.into(),
            base_dir: base_dir.into(),
            defaults,
        }
    }

    /// Find the log for `session_id` and decode who owns it
    pub async fn locate(&self, session_id: &str) -> BrokerResult<Option<ResolvedOwner>> {
        let log_root = self.log_root.clone();
        let extension = self.log_extension.clone();
        let base_dir = self.base_dir.clone();
        let id = session_id.to_string();

        tokio::task::spawn_blocking(move || -> std::io::Result<Option<ResolvedOwner>> {
            let Some(log) = find_session_log(&log_root, &id, &extension)? else {
                return Ok(None);
            };
            let owners = sorted_subdirs(&base_dir)?;
            let resolved = resolve_owner(&log.encoded_dir, &base_dir, &owners);
            if resolved.is_none() {
                debug!(session_id = %id, encoded_dir = %log.encoded_dir, "Log found but owner could not be decoded");
            }
            Ok(resolved)
        })
        .await
        .map_err(|e| StorageError::backend("recovery", e))?
        .map_err(|e| {
            warn!(log_root = %self.log_root.display(), "Conversation log scan failed: {}", e);
            BrokerError::Storage(StorageError::Io(e))
        })
    }

    /// Synthesize and persist metadata for `session_id` from its log.
    ///
    /// The original agent configuration is not in the log, so current defaults apply.
    pub async fn recover(&self, session_id: &str, store: &dyn SessionStore) -> BrokerResult<Option<SessionMetadata>> {
        let Some(owner) = self.locate(session_id).await? else {
            return Ok(None);
        };
        let metadata = SessionMetadata::new(
            session_id,
            owner.owner_id,
            owner.subdir,
            owner.cwd,
            self.defaults.to_options(),
        );
        store.save(&metadata).await?;
        info!(
            session_id,
            owner_id = %metadata.owner_id,
            cwd = %metadata.cwd.display(),
            "Recovered session metadata from conversation log"
        );
        Ok(Some(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbroker_storage::InMemoryStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_recover_persists_metadata() {
        let root = tempdir().unwrap();
        let base = root.path().join("base");
        let logs = root.path().join("logs");
        std::fs::create_dir_all(base.join("ou_649ee1e6")).unwrap();

        let encoded = agentbroker_core::recovery::normalize(&agentbroker_core::recovery::encode_path(
            &base.join("ou_649ee1e6"),
        ));
        std::fs::create_dir_all(logs.join(&encoded)).unwrap();
        std::fs::write(logs.join(&encoded).join("sess-1.jsonl"), b"{}\n").unwrap();

        let resolver = RecoveryResolver::new(&logs, "jsonl", &base, AgentDefaults::default());
        let store = InMemoryStore::new(0);
        let meta = resolver.recover("sess-1", &store).await.unwrap().unwrap();

        assert_eq!(meta.owner_id, "ou_649ee1e6");
        assert_eq!(meta.cwd, base.join("ou_649ee1e6"));
        assert_eq!(meta.options.permission_mode.as_deref(), Some("bypassPermissions"));
        assert!(store.get("sess-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_log_is_none() {
        let root = tempdir().unwrap();
        let resolver = RecoveryResolver::new(root.path(), "jsonl", root.path(), AgentDefaults::default());
        let store = InMemoryStore::new(0);
        assert!(resolver.recover("nope", &store).await.unwrap().is_none());
    }

    /// Stray files and broken links next to the log directories do not stop the scan
    #[tokio::test]
    async fn test_noise_in_log_root_is_skipped() {
        let root = tempdir().unwrap();
        let base = root.path().join("base");
        let logs = root.path().join("logs");
        std::fs::create_dir_all(base.join("alice")).unwrap();

        let encoded = agentbroker_core::recovery::encode_path(&base.join("alice"));
        std::fs::create_dir_all(logs.join(&encoded)).unwrap();
        std::fs::write(logs.join(&encoded).join("sess-2.jsonl"), b"{}\n").unwrap();
        std::fs::write(logs.join("aaa-stray.txt"), b"x").unwrap();
        std::fs::write(base.join("notes.txt"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.path().join("gone"), logs.join("aab-dangling")).unwrap();

        let resolver = RecoveryResolver::new(&logs, "jsonl", &base, AgentDefaults::default());
        let store = InMemoryStore::new(0);
        let meta = resolver.recover("sess-2", &store).await.unwrap().unwrap();
        assert_eq!(meta.owner_id, "alice");
    }
}
