//! Work sources feeding image paths into the pipeline.
//!
//! - `DirectorySource`: recursive scan of a local directory.
//! - `QueueSource`: request/reply client for an external work queue.
//!
//! A source hands out one path at a time. `Ok(None)` means nothing is available
//! right now; the caller sleeps and asks again.

pub mod directory;
pub mod queue;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::InputSource;

pub use directory::DirectorySource;
pub use queue::{QueueSource, RequestCode};

/// One unit of work: the image file to process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    path: PathBuf,
}

impl WorkItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub trait WorkSource: Send {
    fn name(&self) -> &str;

    /// Next item, or `None` when the source is idle.
    fn next_item(&mut self) -> Result<Option<WorkItem>>;

    /// Called once the item has been fully processed.
    fn complete(&mut self, _item: &WorkItem) -> Result<()> {
        Ok(())
    }
}

/// Build the work source selected by the input configuration.
pub fn open_source(source: &InputSource) -> Result<Box<dyn WorkSource>> {
    match source {
        InputSource::Directory(settings) => Ok(Box::new(DirectorySource::new(
            &settings.base_dir,
            &settings.extension,
        ))),
        InputSource::MessageQueue(settings) => Ok(Box::new(QueueSource::new(settings)?)),
    }
}
