//! Result assembly and the JSON wire format.
//!
//! The domain model (`DetectionResult` with its typed records) and the wire model
//! (`ResultMessage`) are separate types. `DetectionResult::to_message` is the only
//! place where scores get rounded and crops get JPEG/base64 encoded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cascade::{CascadeOutput, StageTiming};
use crate::config::ModelSettings;
use crate::error::{FilenameParseError, PipelineError};
use crate::frame::Crop;

/// Timestamp layout embedded in source filenames and output filenames.
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

#[derive(Clone, Debug, PartialEq)]
pub struct FlowerRecord {
    pub index: usize,
    pub class_name: String,
    pub confidence: f32,
    pub crop_width: u32,
    pub crop_height: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollinatorRecord {
    pub index: usize,
    pub flower_index: usize,
    pub class_name: String,
    pub confidence: f32,
    pub crop_width: u32,
    pub crop_height: u32,
    pub crop: Crop,
}

/// Node id and capture time, recovered from a source filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceIdentity {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SourceIdentity {
    /// Parse `{node_id}_{YYYY-MM-DDTHH-MM-SSZ}[_...].{ext}`.
    pub fn parse(file_name: &str) -> Result<Self, FilenameParseError> {
        let stem = file_name.split('.').next().unwrap_or_default();
        let mut fields = stem.split('_');
        let node_id = fields.next().unwrap_or_default();
        let fail = |reason: String| FilenameParseError {
            stem: stem.to_string(),
            reason,
        };
        if node_id.is_empty() {
            return Err(fail("empty node id".into()));
        }
        let raw_timestamp = fields
            .next()
            .ok_or_else(|| fail("missing timestamp field".into()))?;
        let naive = NaiveDateTime::parse_from_str(raw_timestamp, FILENAME_TIMESTAMP_FORMAT)
            .map_err(|e| fail(format!("timestamp '{}': {}", raw_timestamp, e)))?;
        Ok(Self {
            node_id: node_id.to_string(),
            timestamp: Utc.from_utc_datetime(&naive),
        })
    }

    /// Like [`SourceIdentity::parse`], but never fails.
    ///
    /// Unparseable names map to `unknown-{first field}` at the Unix epoch.
    pub fn from_path(path: &Path) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&file_name).unwrap_or_else(|err| {
            log::warn!("{}", err);
            let first = file_name
                .split('.')
                .next()
                .and_then(|stem| stem.split('_').next())
                .unwrap_or_default();
            Self {
                node_id: format!("unknown-{}", first),
                timestamp: DateTime::<Utc>::default(),
            }
        })
    }

    pub fn is_sentinel(&self) -> bool {
        self.timestamp == DateTime::<Utc>::default()
    }

    /// `{node_id}_{YYYY-MM-DDTHH-MM-SSZ}.json`
    pub fn output_filename(&self) -> String {
        format!(
            "{}_{}.json",
            self.node_id,
            self.timestamp.format(FILENAME_TIMESTAMP_FORMAT)
        )
    }

    /// `{node_id}/{YYYY-MM-DD}/{HH}`, relative to a sink's base directory.
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.node_id)
            .join(self.timestamp.format("%Y-%m-%d").to_string())
            .join(self.timestamp.format("%H").to_string())
    }
}

/// Settings and timings of one detector stage, as reported in `metadata`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub margin: u32,
    pub multi_label: bool,
    pub multi_label_iou_threshold: f32,
    pub model_name: String,
    pub max_det: usize,
    pub augment: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inference_times: Vec<f64>,
}

impl ModelMetadata {
    pub fn describe(settings: &ModelSettings, timing: &StageTiming) -> Self {
        let mut inference_times = Vec::new();
        if let Some(total) = timing.total_secs() {
            inference_times.push(round3(total));
        }
        if timing.inferences > 1 {
            inference_times.extend(timing.average_secs().map(round3));
        }
        Self {
            confidence_threshold: settings.confidence_threshold,
            iou_threshold: settings.iou_threshold,
            margin: settings.margin,
            multi_label: settings.multi_label,
            multi_label_iou_threshold: settings.multi_label_iou_threshold,
            model_name: settings.model_name.clone(),
            max_det: settings.max_detections,
            augment: settings.augment,
            inference_times,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub size: [u32; 2],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub node_id: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub flower_inference: ModelMetadata,
    pub pollinator_inference: ModelMetadata,
    pub original_image: ImageMetadata,
    pub source: SourceMetadata,
}

/// Fully assembled result for one image. Records are sorted by index.
#[derive(Debug)]
pub struct DetectionResult {
    source: SourceIdentity,
    flowers: Vec<FlowerRecord>,
    pollinators: Vec<PollinatorRecord>,
    metadata: ResultMetadata,
}

impl DetectionResult {
    /// Check the record invariants and freeze the result.
    pub fn assemble(
        source: SourceIdentity,
        output: CascadeOutput,
        flower_settings: &ModelSettings,
        pollinator_settings: &ModelSettings,
    ) -> Result<Self, PipelineError> {
        let CascadeOutput {
            mut flowers,
            mut pollinators,
            flower_timing,
            pollinator_timing,
            image_width,
            image_height,
            ..
        } = output;

        flowers.sort_by_key(|f| f.index);
        pollinators.sort_by_key(|p| p.index);

        if let Some((position, flower)) = flowers
            .iter()
            .enumerate()
            .find(|(position, flower)| flower.index != *position)
        {
            return Err(PipelineError::Invariant(format!(
                "flower index {} found at position {}",
                flower.index, position
            )));
        }
        if let Some(pair) = pollinators.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(PipelineError::Invariant(format!(
                "pollinator index {} assigned twice",
                pair[0].index
            )));
        }
        if let Some(orphan) = pollinators.iter().find(|p| p.flower_index >= flowers.len()) {
            return Err(PipelineError::Invariant(format!(
                "pollinator {} references missing flower {}",
                orphan.index, orphan.flower_index
            )));
        }

        let metadata = ResultMetadata {
            flower_inference: ModelMetadata::describe(flower_settings, &flower_timing),
            pollinator_inference: ModelMetadata::describe(pollinator_settings, &pollinator_timing),
            original_image: ImageMetadata {
                size: [image_width, image_height],
            },
            source: SourceMetadata {
                node_id: source.node_id.clone(),
                timestamp: source.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        };

        Ok(Self {
            source,
            flowers,
            pollinators,
            metadata,
        })
    }

    pub fn source(&self) -> &SourceIdentity {
        &self.source
    }

    pub fn flowers(&self) -> &[FlowerRecord] {
        &self.flowers
    }

    pub fn pollinators(&self) -> &[PollinatorRecord] {
        &self.pollinators
    }

    pub fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.pollinators.is_empty()
    }

    /// Build the wire message. Crops are embedded only when `save_crops` is set.
    pub fn to_message(&self, save_crops: bool) -> Result<ResultMessage> {
        let flowers = self
            .flowers
            .iter()
            .map(|f| FlowerEntry {
                index: f.index,
                class_name: f.class_name.clone(),
                score: round3(f64::from(f.confidence)),
                size: [f.crop_width, f.crop_height],
            })
            .collect();

        let pollinators = self
            .pollinators
            .iter()
            .map(|p| {
                let crop = if save_crops {
                    let jpeg = p
                        .crop
                        .encode_jpeg()
                        .with_context(|| format!("encode crop of pollinator {}", p.index))?;
                    Some(B64.encode(jpeg))
                } else {
                    None
                };
                Ok(PollinatorEntry {
                    index: p.index,
                    flower_index: p.flower_index,
                    class_name: p.class_name.clone(),
                    score: round3(f64::from(p.confidence)),
                    crop,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResultMessage {
            detections: WireDetections {
                flowers,
                pollinators,
            },
            metadata: self.metadata.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowerEntry {
    pub index: usize,
    pub class_name: String,
    pub score: f64,
    pub size: [u32; 2],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollinatorEntry {
    pub index: usize,
    pub flower_index: usize,
    pub class_name: String,
    pub score: f64,
    /// Base64 JPEG of the pollinator crop, `null` when crops are not saved.
    pub crop: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireDetections {
    pub flowers: Vec<FlowerEntry>,
    pub pollinators: Vec<PollinatorEntry>,
}

/// `{"detections": {...}, "metadata": {...}}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub detections: WireDetections,
    pub metadata: ResultMetadata,
}

impl ResultMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize result message")
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize result message")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parse result message")
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
