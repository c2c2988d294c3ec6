//! Spill storage for oversized results.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::info;

/// Writes oversized result text to uniquely named files.
///
/// Files are `<dir>/<prefix><uuid>.txt`, created with create-new
/// semantics so a name is never reused. The store never deletes what it
/// wrote; cleanup is left to whoever owns the directory.
#[derive(Debug, Clone)]
pub struct OverflowStore {
    dir: PathBuf,
    prefix: String,
}

impl OverflowStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Writes `text` to a fresh file and returns its path.
    pub fn write(&self, text: &str) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("{}{}.txt", self.prefix, uuid::Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| anyhow!("Cannot create {}: {e}", path.display()))?;
        file.write_all(text.as_bytes())
            .map_err(|e| anyhow!("Cannot write {}: {e}", path.display()))?;
        info!(
            "Result of {} chars written to {}",
            text.chars().count(),
            path.display()
        );
        Ok(path)
    }
}

/// Inline stand-in for a result that was written to `path`.
pub fn overflow_notice(chars: usize, path: &Path) -> String {
    format!(
        "[Result too large ({chars} chars), written to {}]",
        path.display()
    )
}
