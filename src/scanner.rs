use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::config::MarkerConfig;

const LOG_EXTENSION: &str = "jsonl";

/// One session log discovered under the root. Identity is the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    pub id: String,
    pub path: PathBuf,
    pub project: String,
    pub mtime: SystemTime,
    pub size: u64,
}

impl SessionFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.id.clone())
    }

    /// True when `session` names this log by id or by full path.
    pub fn matches(&self, session: &str) -> bool {
        self.id == session || self.path.as_os_str() == session
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub project: String,
    pub mtime: DateTime<Utc>,
}

impl From<&SessionFile> for SessionSummary {
    fn from(file: &SessionFile) -> Self {
        Self {
            id: file.id.clone(),
            project: file.project.clone(),
            mtime: DateTime::<Utc>::from(file.mtime),
        }
    }
}

/// Names that keep internal stores and sub-agent transcripts out of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub excluded_dir: String,
    pub subagent_marker: String,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self::from_markers(&MarkerConfig::default())
    }
}

impl ScanFilter {
    pub fn from_markers(markers: &MarkerConfig) -> Self {
        Self {
            excluded_dir: markers.excluded_dir.clone(),
            subagent_marker: markers.subagent.clone(),
        }
    }

    fn skips_dir(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        name == self.excluded_dir.as_str() || self.has_subagent_marker(&name)
    }

    fn has_subagent_marker(&self, name: &str) -> bool {
        !self.subagent_marker.is_empty() && name.contains(self.subagent_marker.as_str())
    }
}

pub fn scan_session_files(root: &Path, window: Duration, filter: &ScanFilter) -> Vec<SessionFile> {
    scan_session_files_at(root, window, filter, SystemTime::now())
}

/// Walks `root` for session logs modified within `window` of `now`.
/// Unreadable entries are skipped; a missing root yields an empty list.
pub fn scan_session_files_at(
    root: &Path,
    window: Duration,
    filter: &ScanFilter,
    now: SystemTime,
) -> Vec<SessionFile> {
    if !root.exists() {
        debug!(root = %root.display(), "session root does not exist");
        return Vec::new();
    }

    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !filter.skips_dir(entry))
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        if filter.has_subagent_marker(&entry.file_name().to_string_lossy()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skipping unreadable session file");
                continue;
            }
        };
        let Ok(mtime) = metadata.modified() else {
            continue;
        };
        if mtime < cutoff {
            continue;
        }

        files.push(SessionFile {
            id: session_id(path),
            path: path.to_path_buf(),
            project: project_name(root, path),
            mtime,
            size: metadata.len(),
        });
    }

    files
}

/// Newest first, capped at `limit`.
pub fn recent_sessions(files: &[SessionFile], limit: usize) -> Vec<SessionSummary> {
    let mut ordered: Vec<&SessionFile> = files.iter().collect();
    ordered.sort_by_key(|file| (Reverse(file.mtime), file.path.clone()));
    ordered
        .into_iter()
        .take(limit)
        .map(SessionSummary::from)
        .collect()
}

fn session_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn project_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .and_then(|relative| relative.parent())
        .and_then(|parent| parent.components().next())
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-project".to_string())
}
