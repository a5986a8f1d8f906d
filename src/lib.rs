//! Pollinator Inference
//!
//! Cascaded object detection for camera traps watching flowers: a flower detector
//! runs on the whole image, a pollinator detector runs on every flower crop, and
//! the detections of one image are merged into a single, consistently indexed
//! result message.
//!
//! # Guarantees per image
//!
//! 1. **Flower indices** are `0..F` in flower-detector order. Flowers are never merged.
//! 2. **Pollinator indices** are unique across all crops. Each crop claims a
//!    contiguous range starting where the previous crop's range ended.
//! 3. **Multi-label merging**: with multi-label inference on, pollinator boxes that
//!    overlap (directly or through a chain) count as one pollinator.
//! 4. **Whole results only**: a result is exposed after every crop was handled,
//!    sorted by index; a flower-stage failure produces no result at all.
//!
//! # Module Structure
//!
//! - `geometry`, `cluster`: IoU, crop rectangles, overlap clustering
//! - `detect`: detector backends (stub, tract ONNX) and YOLO decoding
//! - `cascade`: the two-stage run and pollinator index assignment
//! - `message`: result assembly and the JSON wire format
//! - `ingest`, `storage`, `transport`: work sources and result sinks
//! - `pipeline`: the per-image driver used by `pollinatord`

pub mod cascade;
pub mod cluster;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod message;
pub mod pipeline;
pub mod storage;
pub mod transport;
pub mod ui;

#[cfg(test)]
mod test_support;

pub use cascade::{Cascade, CascadeOutput, CascadeState, DetectionStage, StageTiming};
pub use cluster::{cluster_count, cluster_ids, overlap_clusters, representatives};
pub use config::{ModelSettings, PipelineConfig};
pub use detect::{Detection, DetectorBackend, StubBackend};
pub use error::{FilenameParseError, InvalidBoxError, PipelineError, Stage};
pub use frame::{crop_with_margin, Crop, SourceImage};
pub use geometry::{iou, padded_crop, BoundingBox, Rect};
pub use message::{DetectionResult, FlowerRecord, PollinatorRecord, ResultMessage, SourceIdentity};
pub use pipeline::{Outcome, Pipeline, RunSummary};
