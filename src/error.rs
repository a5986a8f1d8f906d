//! Error taxonomy for the detection pipeline.
//!
//! Plumbing (config, I/O, model loading) reports `anyhow::Error`. The pipeline core
//! reports the typed errors below so callers can decide whether to abandon an image,
//! skip a crop, or keep going after a delivery failure. None of them is fatal to the
//! process.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::geometry::BoundingBox;

/// A box with non-positive width or height was handed to a geometry routine.
///
/// Real detector output never produces these; seeing one means a backend broke its
/// contract, so the current image is abandoned.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "invalid bounding box ({x_min}, {y_min}, {x_max}, {y_max}): min edge must be below max edge",
    x_min = .0.x_min,
    y_min = .0.y_min,
    x_max = .0.x_max,
    y_max = .0.y_max
)]
pub struct InvalidBoxError(pub BoundingBox);

/// The source filename did not follow `{node_id}_{YYYY-MM-DDTHH-MM-SSZ}.{ext}`.
///
/// Always recovered with sentinel values by [`crate::message::SourceIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot derive node id and timestamp from '{stem}': {reason}")]
pub struct FilenameParseError {
    pub stem: String,
    pub reason: String,
}

/// Which detector stage produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Flower,
    Pollinator,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flower => write!(f, "flower"),
            Self::Pollinator => write!(f, "pollinator"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidBox(#[from] InvalidBoxError),

    #[error("{stage} detection failed: {source}")]
    Detection {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("delivery to {sink} failed: {source}")]
    Transport {
        sink: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("result invariant violated: {0}")]
    Invariant(String),

    #[error("failed to load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl PipelineError {
    pub fn detection(stage: Stage, source: anyhow::Error) -> Self {
        Self::Detection { stage, source }
    }

    pub fn transport(sink: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transport {
            sink: sink.into(),
            source,
        }
    }
}
