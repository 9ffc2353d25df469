//! Run log: JSONL append-only record of every provider run.
//!
//! One `RunSummary` per line. Readers skip malformed lines so a torn write at
//! the tail never hides earlier runs. The latest `SystemSummary` is kept
//! separately in `system_summary.json`, replaced atomically.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::multi::SystemSummary;
use crate::orchestrator::RunSummary;

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("run log I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to serialize run record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt system summary at {path}: {cause}")]
    Corrupt { path: PathBuf, cause: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RunLogError + '_ {
    move |source| RunLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, summary: &RunSummary) -> Result<(), RunLogError> {
        let json = serde_json::to_string(summary)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        writeln!(file, "{json}").map_err(io_error(&self.path))?;
        file.flush().map_err(io_error(&self.path))?;
        Ok(())
    }

    /// All runs in the order they were logged.
    pub fn read_all(&self) -> Result<Vec<RunSummary>, RunLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(io_error(&self.path))?;
        let reader = io::BufReader::new(file);

        let mut runs = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(io_error(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunSummary>(&line) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %self.path.display(), line = n + 1, error = %e, "skipping malformed run log line"),
            }
        }
        Ok(runs)
    }

    /// The most recent `n` runs, oldest first, optionally for one provider.
    pub fn recent(&self, n: usize, provider: Option<&str>) -> Result<Vec<RunSummary>, RunLogError> {
        let mut runs: Vec<RunSummary> = self
            .read_all()?
            .into_iter()
            .filter(|r| provider.map_or(true, |p| r.provider == p))
            .collect();
        let skip = runs.len().saturating_sub(n);
        Ok(runs.split_off(skip))
    }
}

/// Replace `system_summary.json` via a temp file and rename.
pub fn write_system_summary(path: &Path, summary: &SystemSummary) -> Result<(), RunLogError> {
    let json = serde_json::to_string_pretty(summary)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_error(&tmp))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_error(path)(e));
    }
    Ok(())
}

/// `Ok(None)` when no summary has been written yet.
pub fn read_system_summary(path: &Path) -> Result<Option<SystemSummary>, RunLogError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RunLogError::Corrupt {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
}
