use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to stat {}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {} at offset {offset}", path.display())]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

/// Byte cursor over one append-only log. The offset never moves backwards while attached;
/// bytes after the last newline are carried until their line completes.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl TailCursor {
    /// Starts at the current end of file so earlier history is never replayed.
    pub fn attach(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        Self::at_offset(path, offset)
    }

    pub fn at_offset(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_new(&mut self) -> Vec<String> {
        match self.try_read_new() {
            Ok(lines) => lines,
            Err(err) => {
                debug!(error = %err, offset = self.offset, "tail read failed, keeping offset");
                Vec::new()
            }
        }
    }

    pub fn try_read_new(&mut self) -> Result<Vec<String>, TailError> {
        let size = fs::metadata(&self.path)
            .map_err(|source| TailError::Metadata {
                path: self.path.clone(),
                source,
            })?
            .len();
        if size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).map_err(|source| TailError::Open {
            path: self.path.clone(),
            source,
        })?;
        let read_err = |source| TailError::Read {
            path: self.path.clone(),
            offset: self.offset,
            source,
        };
        file.seek(SeekFrom::Start(self.offset)).map_err(read_err)?;

        let wanted = size - self.offset;
        let mut chunk = Vec::with_capacity(usize::try_from(wanted).unwrap_or(0));
        file.take(wanted).read_to_end(&mut chunk).map_err(read_err)?;

        self.offset += chunk.len() as u64;
        Ok(self.split_lines(&chunk))
    }

    fn split_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .split(|byte| *byte == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }
}
