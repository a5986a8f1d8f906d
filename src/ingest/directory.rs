//! Local directory work source.
//!
//! Files are discovered by a recursive scan and handed out in modification-time
//! order. A path is handed out at most once per process; a rescan only appends
//! paths it has not seen before.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use super::{WorkItem, WorkSource};

pub struct DirectorySource {
    base_dir: PathBuf,
    extension: String,
    seen: HashSet<PathBuf>,
    pending: VecDeque<PathBuf>,
}

impl DirectorySource {
    pub fn new(base_dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            base_dir: base_dir.into(),
            extension: extension.to_string(),
            seen: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// Queue files that appeared since the last scan. Returns how many were added.
    pub fn scan(&mut self) -> Result<usize> {
        let mut unseen: Vec<(SystemTime, PathBuf)> = Vec::new();
        let mut dirs = vec![self.base_dir.clone()];
        while let Some(dir) = dirs.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("failed to scan input directory {}", dir.display()))?;
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    dirs.push(path);
                } else if self.matches(&path) && !self.seen.contains(&path) {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    unseen.push((modified, path));
                }
            }
        }
        unseen.sort();
        let added = unseen.len();
        for (_, path) in unseen {
            self.seen.insert(path.clone());
            self.pending.push_back(path);
        }
        log::debug!("{}: {} new files", self.base_dir.display(), added);
        Ok(added)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(&self.extension))
            .unwrap_or(false)
    }
}

impl WorkSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    fn next_item(&mut self) -> Result<Option<WorkItem>> {
        if self.pending.is_empty() {
            self.scan()?;
        }
        Ok(self.pending.pop_front().map(WorkItem::new))
    }
}
