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

//! Decoding runtime log directories back to session ownership
//!
//! The runtime stores each conversation under
//! `<log_root>/<encoded cwd>/<session_id>.<ext>`, where the encoded cwd is the
//! absolute working directory with every `/` replaced by `-`. The encoding is
//! lossy: a `-` in the name may have been a separator, a literal hyphen, or an
//! underscore or dot the runtime folded. Decoding therefore compares against
//! the owner directories that actually exist.

use crate::sandbox::{is_valid_owner_id, validate_subdir};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

const JOIN: char = '-';

/// Ownership recovered from an encoded log directory name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    pub owner_id: String,
    pub subdir: Option<String>,
    pub cwd: PathBuf,
}

/// A located conversation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLog {
    /// Name of the encoded-cwd directory holding the log
    pub encoded_dir: String,
    pub path: PathBuf,
}

pub fn encode_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "-")
}

/// Fold characters the runtime may have rewritten to the join character
pub fn normalize(encoded: &str) -> String {
    encoded
        .chars()
        .map(|c| if c == '_' || c == '.' { JOIN } else { c })
        .collect()
}

/// Resolve an encoded directory name against existing owner directories.
///
/// Passes run in order over all candidates: exact, normalized, prefix,
/// normalized prefix. Prefix passes try longer owner ids first so that
/// `user-abc` wins over `user`. When nothing matches, the base prefix is
/// stripped and the remainder accepted if it is a syntactically valid owner id.
pub fn resolve_owner(encoded: &str, base_dir: &Path, candidates: &[String]) -> Option<ResolvedOwner> {
    let encoded_norm = normalize(encoded);
    let encoded_candidates: Vec<(&String, String)> = candidates
        .iter()
        .filter(|c| is_valid_owner_id(c))
        .map(|c| (c, encode_path(&base_dir.join(c))))
        .collect();

    for (owner, candidate) in &encoded_candidates {
        if encoded == candidate {
            return Some(owner_only(base_dir, owner));
        }
    }
    for (owner, candidate) in &encoded_candidates {
        if encoded_norm == normalize(candidate) {
            return Some(owner_only(base_dir, owner));
        }
    }

    let mut by_length: Vec<&(&String, String)> = encoded_candidates.iter().collect();
    by_length.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    for (owner, candidate) in &by_length {
        if let Some(resolved) = prefix_match(encoded, encoded, candidate, base_dir, owner) {
            return Some(resolved);
        }
    }
    for (owner, candidate) in &by_length {
        if let Some(resolved) = prefix_match(&encoded_norm, encoded, &normalize(candidate), base_dir, owner) {
            return Some(resolved);
        }
    }

    let base_prefix = format!("{}{}", encode_path(base_dir), JOIN);
    let remainder = encoded.strip_prefix(base_prefix.as_str())?;
    is_valid_owner_id(remainder).then(|| owner_only(base_dir, remainder))
}

fn owner_only(base_dir: &Path, owner: &str) -> ResolvedOwner {
    ResolvedOwner {
        owner_id: owner.to_string(),
        subdir: None,
        cwd: base_dir.join(owner),
    }
}

/// `haystack` is compared, `raw` supplies the subdir text at the same offset
fn prefix_match(
    haystack: &str,
    raw: &str,
    candidate: &str,
    base_dir: &Path,
    owner: &str,
) -> Option<ResolvedOwner> {
    let rest = haystack.strip_prefix(candidate)?.strip_prefix(JOIN)?;
    if rest.is_empty() {
        return None;
    }
    let subdir = raw.get(raw.len() - rest.len()..)?;
    let subdir = validate_subdir(Some(subdir)).ok()??;
    Some(ResolvedOwner {
        owner_id: owner.to_string(),
        cwd: base_dir.join(owner).join(&subdir),
        subdir: Some(subdir),
    })
}

/// Find `<session_id>.<ext>` in any subdirectory of `log_root`.
///
/// Directories are visited in name order so the result is deterministic.
pub fn find_session_log(log_root: &Path, session_id: &str, extension: &str) -> io::Result<Option<SessionLog>> {
    if session_id.is_empty() || session_id.contains(['/', '\\', '\0']) || session_id.contains("..") {
        return Ok(None);
    }
    if !log_root.is_dir() {
        return Ok(None);
    }
    let file_name = format!("{}.{}", session_id, extension);
    for dir in sorted_subdirs(log_root)? {
        let candidate = log_root.join(&dir).join(&file_name);
        if candidate.is_file() {
            return Ok(Some(SessionLog {
                encoded_dir: dir,
                path: candidate,
            }));
        }
    }
    Ok(None)
}

/// Names of the directories directly under `dir`, sorted
pub fn sorted_subdirs(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), "Skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %entry.path().display(), "Skipping entry of unknown type: {}", e);
            }
        }
    }
    names.sort();
    Ok(names)
}
