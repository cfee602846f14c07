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

//! Path sandbox: every working directory lives under `<base_dir>/<owner_id>`

use crate::error::{BrokerError, BrokerResult};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

const MAX_OWNER_ID_LEN: usize = 64;
const MAX_SUBDIR_LEN: usize = 200;

fn owner_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid owner id regex"))
}

/// Syntactic check shared by the sandbox and the recovery fallback
pub fn is_valid_owner_id(owner_id: &str) -> bool {
    !owner_id.is_empty()
        && owner_id.len() <= MAX_OWNER_ID_LEN
        && owner_id_pattern().is_match(owner_id)
}

/// Derives and validates owner working directories
#[derive(Debug, Clone)]
pub struct PathSandbox {
    base_dir: PathBuf,
    auto_create: bool,
}

impl PathSandbox {
    pub fn new(base_dir: impl Into<PathBuf>, auto_create: bool) -> Self {
        Self {
            base_dir: normalize(&base_dir.into()),
            auto_create,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn auto_create(&self) -> bool {
        self.auto_create
    }

    pub fn owner_root(&self, owner_id: &str) -> BrokerResult<PathBuf> {
        validate_owner_id(owner_id)?;
        Ok(self.base_dir.join(owner_id))
    }

    /// `<base>/<owner>[/<subdir>]`, normalized and contained in the owner root
    pub fn build_working_dir(&self, owner_id: &str, subdir: Option<&str>) -> BrokerResult<PathBuf> {
        let owner_root = self.owner_root(owner_id)?;
        let cwd = match validate_subdir(subdir)? {
            Some(sub) => normalize(&owner_root.join(sub)),
            None => owner_root.clone(),
        };
        if !cwd.starts_with(&owner_root) {
            return Err(BrokerError::PathSecurity(format!(
                "path escape detected: {} is not under {}",
                cwd.display(),
                owner_root.display()
            )));
        }
        Ok(cwd)
    }

    /// Resolve relative extra directories to absolute paths under the owner root
    pub fn build_add_dirs(&self, owner_id: &str, add_dirs: &[String]) -> BrokerResult<Vec<PathBuf>> {
        let owner_root = self.owner_root(owner_id)?;
        let mut resolved = Vec::with_capacity(add_dirs.len());
        for dir in add_dirs {
            let Some(rel) = validate_subdir(Some(dir))? else {
                continue;
            };
            let full = normalize(&owner_root.join(rel));
            if !full.starts_with(&owner_root) {
                return Err(BrokerError::PathSecurity(format!(
                    "path escape detected in add_dirs: {}",
                    dir
                )));
            }
            resolved.push(full);
        }
        Ok(resolved)
    }

    /// Ensure `path` is a directory, creating it when allowed.
    ///
    /// Returns `false` when the directory is missing and auto-creation is off.
    pub async fn ensure_directory(&self, path: &Path) -> BrokerResult<bool> {
        ensure_directory(path, self.auto_create).await
    }
}

pub fn validate_owner_id(owner_id: &str) -> BrokerResult<()> {
    if owner_id.is_empty() {
        return Err(BrokerError::PathSecurity("owner id cannot be empty".into()));
    }
    if owner_id.len() > MAX_OWNER_ID_LEN {
        return Err(BrokerError::PathSecurity(format!(
            "owner id too long (max {} characters)",
            MAX_OWNER_ID_LEN
        )));
    }
    if !owner_id_pattern().is_match(owner_id) {
        return Err(BrokerError::PathSecurity(
            "owner id must contain only alphanumeric characters, underscores, or hyphens".into(),
        ));
    }
    Ok(())
}

/// Strip surrounding slashes and reject traversal, NUL bytes and oversize input
pub fn validate_subdir(subdir: Option<&str>) -> BrokerResult<Option<String>> {
    let Some(raw) = subdir else {
        return Ok(None);
    };
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.contains('\0') {
        return Err(BrokerError::PathSecurity("null bytes not allowed in path".into()));
    }
    if trimmed.len() > MAX_SUBDIR_LEN {
        return Err(BrokerError::PathSecurity(format!(
            "subdir too long (max {} characters)",
            MAX_SUBDIR_LEN
        )));
    }
    if trimmed.contains("..") {
        return Err(BrokerError::PathSecurity(format!(
            "path traversal not allowed: {}",
            raw
        )));
    }
    if Path::new(trimmed).is_absolute() {
        return Err(BrokerError::PathSecurity(format!(
            "absolute path not allowed: {}",
            raw
        )));
    }
    Ok(Some(trimmed.to_string()))
}

pub async fn ensure_directory(path: &Path, auto_create: bool) -> BrokerResult<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(true),
        Ok(_) => {
            return Err(BrokerError::PathSecurity(format!(
                "path exists but is not a directory: {}",
                path.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BrokerError::PathSecurity(format!(
                "cannot inspect {}: {}",
                path.display(),
                e
            )))
        }
    }
    if !auto_create {
        return Ok(false);
    }
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        BrokerError::PathSecurity(format!("failed to create directory {}: {}", path.display(), e))
    })?;
    Ok(true)
}

/// Lexical normalization: drops `.` and folds `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sandbox() -> PathSandbox {
        PathSandbox::new("/base", true)
    }

    #[test]
    fn test_owner_id_rules() {
        assert!(validate_owner_id("user_abc-1").is_ok());
        assert!(validate_owner_id("").is_err());
        assert!(validate_owner_id("a/b").is_err());
        assert!(validate_owner_id("a.b").is_err());
        assert!(validate_owner_id(&"x".repeat(65)).is_err());
        assert!(is_valid_owner_id(&"x".repeat(64)));
    }

    #[test]
    fn test_build_working_dir() {
        let sb = sandbox();
        assert_eq!(sb.build_working_dir("alice", None).unwrap(), PathBuf::from("/base/alice"));
        assert_eq!(
            sb.build_working_dir("alice", Some("/proj/src/")).unwrap(),
            PathBuf::from("/base/alice/proj/src")
        );
        assert_eq!(
            sb.build_working_dir("alice", Some("./proj")).unwrap(),
            PathBuf::from("/base/alice/proj")
        );
        assert_eq!(sb.build_working_dir("alice", Some("///")).unwrap(), PathBuf::from("/base/alice"));
    }

    #[test]
    fn test_traversal_rejected() {
        let sb = sandbox();
        for bad in ["../bob", "proj/../../bob", "a\0b"] {
            let err = sb.build_working_dir("alice", Some(bad)).unwrap_err();
            assert_eq!(err.kind(), "path_security_violation", "input {:?}", bad);
        }
        assert!(sb.build_working_dir("alice", Some(&"d".repeat(201))).is_err());
    }

    #[test]
    fn test_add_dirs_resolve_under_owner() {
        let sb = sandbox();
        let dirs = sb
            .build_add_dirs("alice", &["data".into(), "/shared/".into(), "".into()])
            .unwrap();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/base/alice/data"), PathBuf::from("/base/alice/shared")]
        );
        assert!(sb.build_add_dirs("alice", &["../bob".into()]).is_err());
    }

    #[tokio::test]
    async fn test_ensure_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice").join("proj");

        assert!(!ensure_directory(&target, false).await.unwrap());
        assert!(ensure_directory(&target, true).await.unwrap());
        assert!(target.is_dir());
        assert!(PathSandbox::new(dir.path(), false).ensure_directory(&target).await.unwrap());

        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_directory(&file, true).await.is_err());
    }
}
