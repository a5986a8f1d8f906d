//! Two-stage flower → pollinator detection cascade.
//!
//! One `Cascade::run` call processes exactly one image:
//!
//! 1. The flower stage sees the whole image. Every detection becomes a flower,
//!    indexed by its position in the detector output. Flowers are never deduplicated.
//! 2. Each flower is cut out with the flower model's margin and handed to the
//!    pollinator stage. The boxes found in that crop are clustered (multi-label
//!    mode only) and each cluster keeps its first member as representative.
//! 3. Cluster ordinals are turned into image-wide pollinator indices by a fold over
//!    the crops in flower order, carrying the running offset as its accumulator.
//!
//! A flower-stage failure abandons the image. A pollinator-stage failure skips only
//! the crop it happened on. The running offset lives on the stack of one run.

use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;

use crate::cluster::{cluster_count, cluster_ids, representatives};
use crate::config::ModelSettings;
use crate::detect::{Detection, DetectorBackend};
use crate::error::{PipelineError, Stage};
use crate::frame::{Crop, SourceImage};
use crate::message::{FlowerRecord, PollinatorRecord};

/// Where a cascade run currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeState {
    Idle,
    FlowerDetection,
    PerCropPollinatorDetection { flower_index: usize },
    Assembled,
}

/// Accumulated inference time of one stage during one image.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageTiming {
    pub total: Duration,
    pub inferences: u32,
}

impl StageTiming {
    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.inferences += 1;
    }

    pub fn total_secs(&self) -> Option<f64> {
        (self.inferences > 0).then(|| self.total.as_secs_f64())
    }

    pub fn average_secs(&self) -> Option<f64> {
        (self.inferences > 0).then(|| self.total.as_secs_f64() / f64::from(self.inferences))
    }

    pub fn total_millis(&self) -> u128 {
        self.total.as_millis()
    }
}

/// A detector backend plus the settings it was configured with.
pub struct DetectionStage {
    backend: Box<dyn DetectorBackend>,
    settings: ModelSettings,
}

impl DetectionStage {
    pub fn new(backend: Box<dyn DetectorBackend>, settings: ModelSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.backend.warm_up()
    }

    fn predict(&mut self, image: &RgbImage, timing: &mut StageTiming) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let detections = self.backend.detect(image, self.settings.image_size);
        timing.record(started.elapsed());
        detections
    }
}

/// Representative of one overlap cluster inside a flower crop.
#[derive(Clone, Debug)]
pub struct ClusterRepresentative {
    /// Cluster ordinal within its crop, `0..k`.
    pub ordinal: usize,
    pub class_name: String,
    pub confidence: f32,
    pub crop: Crop,
}

/// Clustered pollinator detections of one flower crop, before image-wide indexing.
#[derive(Clone, Debug)]
pub struct CropClusters {
    pub flower_index: usize,
    pub clusters: Vec<ClusterRepresentative>,
}

impl CropClusters {
    fn skipped(flower_index: usize) -> Self {
        Self {
            flower_index,
            clusters: Vec::new(),
        }
    }

    /// Size of the index range this crop claims: highest ordinal plus one.
    pub fn index_span(&self) -> usize {
        self.clusters
            .iter()
            .map(|cluster| cluster.ordinal + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Everything one cascade run produced for one image.
#[derive(Debug)]
pub struct CascadeOutput {
    pub flowers: Vec<FlowerRecord>,
    pub pollinators: Vec<PollinatorRecord>,
    pub flower_timing: StageTiming,
    pub pollinator_timing: StageTiming,
    pub skipped_crops: usize,
    pub image_width: u32,
    pub image_height: u32,
}

pub struct Cascade {
    flower: DetectionStage,
    pollinator: DetectionStage,
}

impl Cascade {
    pub fn new(flower: DetectionStage, pollinator: DetectionStage) -> Self {
        Self { flower, pollinator }
    }

    pub fn flower_stage(&self) -> &DetectionStage {
        &self.flower
    }

    pub fn pollinator_stage(&self) -> &DetectionStage {
        &self.pollinator
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.flower.warm_up()?;
        self.pollinator.warm_up()
    }

    /// Run both stages over one image.
    pub fn run(&mut self, image: &SourceImage) -> Result<CascadeOutput, PipelineError> {
        let mut state = CascadeState::Idle;
        let mut flower_timing = StageTiming::default();
        let mut pollinator_timing = StageTiming::default();

        transition(&mut state, CascadeState::FlowerDetection, image);
        let flower_detections = self
            .flower
            .predict(image.pixels(), &mut flower_timing)
            .map_err(|e| PipelineError::detection(Stage::Flower, e))?;

        let flower_settings = &self.flower.settings;
        let flower_crops: Vec<(FlowerRecord, Crop)> = flower_detections
            .iter()
            .enumerate()
            .map(|(index, detection)| {
                let crop = Crop::around(image.pixels(), detection, flower_settings.margin);
                let record = FlowerRecord {
                    index,
                    class_name: detection.label(flower_settings.class_names.as_deref()),
                    confidence: detection.confidence,
                    crop_width: crop.width(),
                    crop_height: crop.height(),
                };
                (record, crop)
            })
            .collect();

        let mut per_crop = Vec::with_capacity(flower_crops.len());
        let mut skipped_crops = 0;
        for (flower, crop) in &flower_crops {
            transition(
                &mut state,
                CascadeState::PerCropPollinatorDetection {
                    flower_index: flower.index,
                },
                image,
            );
            match self.pollinator.predict(crop.pixels(), &mut pollinator_timing) {
                Ok(detections) => {
                    per_crop.push(cluster_crop(
                        flower.index,
                        crop,
                        &detections,
                        &self.pollinator.settings,
                    )?);
                }
                Err(e) => {
                    let err = PipelineError::detection(Stage::Pollinator, e);
                    log::warn!(
                        "{}: skipping crop of flower {}: {}",
                        image.path().display(),
                        flower.index,
                        err
                    );
                    skipped_crops += 1;
                    per_crop.push(CropClusters::skipped(flower.index));
                }
            }
        }

        let pollinators = assign_indices(per_crop);
        transition(&mut state, CascadeState::Assembled, image);

        Ok(CascadeOutput {
            flowers: flower_crops.into_iter().map(|(record, _)| record).collect(),
            pollinators,
            flower_timing,
            pollinator_timing,
            skipped_crops,
            image_width: image.width(),
            image_height: image.height(),
        })
    }
}

fn transition(state: &mut CascadeState, next: CascadeState, image: &SourceImage) {
    log::debug!(
        "{}: {:?} -> {:?}",
        image.path().display(),
        state,
        next
    );
    *state = next;
}

/// Cluster the pollinator detections of one flower crop and cut out representatives.
pub fn cluster_crop(
    flower_index: usize,
    flower_crop: &Crop,
    detections: &[Detection],
    settings: &ModelSettings,
) -> Result<CropClusters, PipelineError> {
    let boxes: Vec<_> = detections.iter().map(|d| d.bbox).collect();
    let ids = cluster_ids(
        &boxes,
        settings.multi_label,
        settings.multi_label_iou_threshold,
    )?;
    debug_assert_eq!(representatives(&ids).len(), cluster_count(&ids));

    let clusters = representatives(&ids)
        .into_iter()
        .map(|member| {
            let detection = &detections[member];
            ClusterRepresentative {
                ordinal: ids[member],
                class_name: detection.label(settings.class_names.as_deref()),
                confidence: detection.confidence,
                crop: Crop::around(flower_crop.pixels(), detection, settings.margin),
            }
        })
        .collect();

    Ok(CropClusters {
        flower_index,
        clusters,
    })
}

/// Turn per-crop cluster ordinals into image-wide pollinator indices.
///
/// Crops are folded in flower order; each one claims the index range
/// `[offset, offset + span)` and advances the offset by its span. Crops may arrive
/// in any order, the fold re-sorts them first.
pub fn assign_indices(mut crops: Vec<CropClusters>) -> Vec<PollinatorRecord> {
    crops.sort_by_key(|crop| crop.flower_index);
    let (records, _) = crops
        .into_iter()
        .fold((Vec::new(), 0usize), |(mut records, offset), crop| {
            let span = crop.index_span();
            records.extend(crop.clusters.into_iter().map(|cluster| PollinatorRecord {
                index: offset + cluster.ordinal,
                flower_index: crop.flower_index,
                class_name: cluster.class_name,
                confidence: cluster.confidence,
                crop_width: cluster.crop.width(),
                crop_height: cluster.crop.height(),
                crop: cluster.crop,
            }));
            (records, offset + span)
        });
    records
}
