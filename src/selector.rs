use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::info;

use crate::scanner::SessionFile;

/// Last observed size per path, kept for the process lifetime.
#[derive(Debug, Default)]
pub struct GrowthRecord {
    sizes: HashMap<PathBuf, u64>,
}

impl GrowthRecord {
    /// Records the file's size and reports whether it grew since the last observation.
    /// A file seen for the first time has not grown.
    pub fn observe(&mut self, file: &SessionFile) -> bool {
        let previous = self.sizes.insert(file.path.clone(), file.size);
        previous.is_some_and(|size| file.size > size)
    }

    #[cfg(test)]
    pub fn last_size(&self, path: &std::path::Path) -> Option<u64> {
        self.sizes.get(path).copied()
    }
}

/// Ordering key for candidates. Growth dominates any recency difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SelectionScore {
    pub grew: bool,
    pub modified: SystemTime,
}

#[derive(Debug, Default)]
pub struct ActiveSessionSelector {
    growth: GrowthRecord,
    pinned: Option<String>,
}

impl ActiveSessionSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&mut self, session: Option<String>) {
        let session = session
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if session != self.pinned {
            info!(pinned = ?session, "session pin changed");
        }
        self.pinned = session;
    }

    pub fn pinned(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    #[cfg(test)]
    pub fn growth(&self) -> &GrowthRecord {
        &self.growth
    }

    pub fn select<'a>(&mut self, candidates: &'a [SessionFile]) -> Option<&'a SessionFile> {
        let scored: Vec<(SelectionScore, &SessionFile)> = candidates
            .iter()
            .map(|file| {
                let score = SelectionScore {
                    grew: self.growth.observe(file),
                    modified: file.mtime,
                };
                (score, file)
            })
            .collect();

        if let Some(pinned) = self.pinned.as_deref()
            && let Some(file) = candidates.iter().find(|file| file.matches(pinned))
        {
            return Some(file);
        }

        scored
            .into_iter()
            .max_by(|(left_score, left), (right_score, right)| {
                left_score
                    .cmp(right_score)
                    .then_with(|| right.path.cmp(&left.path))
            })
            .map(|(_, file)| file)
    }
}
