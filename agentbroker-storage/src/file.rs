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

//! One JSON document per session under a directory
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a reader never sees a half-written record. A store-wide async
//! mutex serializes every operation, which keeps `touch` linearizable.

use crate::{invalid_id, is_safe_session_id, SessionStore};
use agentbroker_core::metadata::now;
use agentbroker_core::{SessionMetadata, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

const EXTENSION: &str = "json";

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    ttl_secs: u64,
    guard: Mutex<()>,
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>, ttl_secs: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ttl_secs,
            guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> Option<PathBuf> {
        is_safe_session_id(session_id).then(|| self.dir.join(format!("{}.{}", session_id, EXTENSION)))
    }

    async fn read_record(&self, path: &Path) -> StorageResult<Option<SessionMetadata>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, path: &Path, metadata: &SessionMetadata) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(metadata)?;
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", metadata.session_id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_record(&self, path: &Path) -> StorageResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every parseable record in the directory. Unreadable files are skipped.
    async fn scan(&self) -> StorageResult<Vec<(PathBuf, SessionMetadata)>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(meta)) => records.push((path, meta)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable session file: {}", e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    async fn save(&self, metadata: &SessionMetadata) -> StorageResult<()> {
        let path = self
            .record_path(&metadata.session_id)
            .ok_or_else(|| invalid_id(&metadata.session_id))?;
        let _guard = self.guard.lock().await;
        self.write_record(&path, metadata).await
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionMetadata>> {
        let Some(path) = self.record_path(session_id) else {
            return Ok(None);
        };
        let _guard = self.guard.lock().await;
        match self.read_record(&path).await? {
            Some(meta) if meta.is_expired(self.ttl_secs, now()) => {
                self.remove_record(&path).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        let Some(path) = self.record_path(session_id) else {
            return Ok(false);
        };
        let _guard = self.guard.lock().await;
        self.remove_record(&path).await
    }

    async fn touch(&self, session_id: &str) -> StorageResult<bool> {
        let Some(path) = self.record_path(session_id) else {
            return Ok(false);
        };
        let _guard = self.guard.lock().await;
        let Some(mut meta) = self.read_record(&path).await? else {
            return Ok(false);
        };
        let ts = now();
        if meta.is_expired(self.ttl_secs, ts) {
            self.remove_record(&path).await?;
            return Ok(false);
        }
        meta.touch(ts);
        self.write_record(&path, &meta).await?;
        Ok(true)
    }

    async fn list(&self, owner_id: Option<&str>) -> StorageResult<Vec<String>> {
        let _guard = self.guard.lock().await;
        let ts = now();
        let mut live: Vec<SessionMetadata> = self
            .scan()
            .await?
            .into_iter()
            .map(|(_, meta)| meta)
            .filter(|m| owner_id.map_or(true, |owner| m.owner_id == owner))
            .filter(|m| !m.is_expired(self.ttl_secs, ts))
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        Ok(live.into_iter().map(|m| m.session_id).collect())
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        let _guard = self.guard.lock().await;
        let ts = now();
        let mut purged = 0;
        for (path, meta) in self.scan().await? {
            if meta.is_expired(self.ttl_secs, ts) && self.remove_record(&path).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbroker_core::AgentOptions;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_are_plain_json_files() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 0).await.unwrap();
        let meta = SessionMetadata::new("abc-1", "alice", None, PathBuf::from("/base/alice"), AgentOptions::default());
        store.save(&meta).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("abc-1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["owner_id"], "alice");

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_ids_never_touch_the_filesystem() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("sessions"), 0).await.unwrap();
        let meta = SessionMetadata::new("../escape", "alice", None, PathBuf::from("/base/alice"), AgentOptions::default());
        assert!(store.save(&meta).await.is_err());
        assert!(store.get("../escape").await.unwrap().is_none());
        assert!(!dir.path().join("escape.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped_by_list() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 0).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let meta = SessionMetadata::new("ok-1", "alice", None, PathBuf::from("/base/alice"), AgentOptions::default());
        store.save(&meta).await.unwrap();

        assert_eq!(store.list(None).await.unwrap(), vec!["ok-1".to_string()]);
    }
}
