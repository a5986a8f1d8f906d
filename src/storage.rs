use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::message::{DetectionResult, ResultMessage};

/// Persists assembled results.
pub trait ResultStore {
    /// Write `result` as `{dir}/{filename}` below the store's root. Returns the path written.
    fn store(&mut self, result: &DetectionResult, dir: &Path, filename: &str) -> Result<PathBuf>;
}

/// Writes one JSON file per image below a base directory.
pub struct FileResultStore {
    base_dir: PathBuf,
    save_crops: bool,
}

impl FileResultStore {
    pub fn new(base_dir: impl Into<PathBuf>, save_crops: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            save_crops,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl ResultStore for FileResultStore {
    fn store(&mut self, result: &DetectionResult, dir: &Path, filename: &str) -> Result<PathBuf> {
        let target_dir = self.base_dir.join(dir);
        if !target_dir.exists() {
            std::fs::create_dir_all(&target_dir)
                .with_context(|| format!("failed to create {}", target_dir.display()))?;
            log::info!("created directory {}", target_dir.display());
        }
        let path = target_dir.join(filename);
        let json = result.to_message(self.save_crops)?.to_json()?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("saved result to {}", path.display());
        Ok(path)
    }
}

/// Keeps serialized results in memory.
#[derive(Default)]
pub struct InMemoryResultStore {
    save_crops: bool,
    entries: Vec<(PathBuf, ResultMessage)>,
}

impl InMemoryResultStore {
    pub fn new(save_crops: bool) -> Self {
        Self {
            save_crops,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[(PathBuf, ResultMessage)] {
        &self.entries
    }
}

impl ResultStore for InMemoryResultStore {
    fn store(&mut self, result: &DetectionResult, dir: &Path, filename: &str) -> Result<PathBuf> {
        let path = dir.join(filename);
        self.entries
            .push((path.clone(), result.to_message(self.save_crops)?));
        Ok(path)
    }
}
