//! Decoding of YOLOv5-style detection heads.
//!
//! The model emits one row per anchor: `[cx, cy, w, h, objectness, class_0 .. class_n]`
//! in model-input pixels. Rows are scored as `objectness * class_score`, filtered by
//! the confidence threshold, suppressed per class, capped, and mapped back into the
//! coordinates of the image that was fed to the backend.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::detect::result::Detection;
use crate::geometry::{iou, BoundingBox};

/// Columns before the per-class scores.
const BOX_COLUMNS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct YoloParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Emit one detection per class above threshold instead of only the best class.
    pub multi_label: bool,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            multi_label: false,
            max_detections: 10,
        }
    }
}

/// Decode a row-major `[rows, 5 + classes]` output tensor.
///
/// `model_size` is the square input edge the image was resized to; `image_width` and
/// `image_height` are the dimensions of the image before resizing.
pub fn decode(
    output: &[f32],
    row_len: usize,
    params: &YoloParams,
    model_size: u32,
    image_width: u32,
    image_height: u32,
) -> Result<Vec<Detection>> {
    if row_len <= BOX_COLUMNS {
        return Err(anyhow!(
            "detection rows must have more than {} columns, got {}",
            BOX_COLUMNS,
            row_len
        ));
    }
    if output.len() % row_len != 0 {
        return Err(anyhow!(
            "output length {} is not a multiple of row length {}",
            output.len(),
            row_len
        ));
    }

    let scale_x = image_width as f32 / model_size as f32;
    let scale_y = image_height as f32 / model_size as f32;
    let mut candidates = Vec::new();

    for row in output.chunks_exact(row_len) {
        let objectness = row[4];
        if objectness <= params.confidence_threshold {
            continue;
        }
        let bbox = BoundingBox::new(
            ((row[0] - row[2] / 2.0) * scale_x).clamp(0.0, image_width as f32),
            ((row[1] - row[3] / 2.0) * scale_y).clamp(0.0, image_height as f32),
            ((row[0] + row[2] / 2.0) * scale_x).clamp(0.0, image_width as f32),
            ((row[1] + row[3] / 2.0) * scale_y).clamp(0.0, image_height as f32),
        );
        if bbox.validated().is_err() {
            continue;
        }

        let scores = row[BOX_COLUMNS..]
            .iter()
            .enumerate()
            .map(|(class_id, score)| (class_id as u32, score * objectness));
        if params.multi_label {
            for (class_id, confidence) in scores {
                if confidence > params.confidence_threshold {
                    candidates.push(Detection::new(bbox, confidence, class_id));
                }
            }
        } else if let Some((class_id, confidence)) =
            scores.max_by(|a, b| a.1.total_cmp(&b.1))
        {
            if confidence > params.confidence_threshold {
                candidates.push(Detection::new(bbox, confidence, class_id));
            }
        }
    }

    let mut kept = nms(candidates, params.iou_threshold)?;
    kept.truncate(params.max_detections);
    Ok(kept)
}

/// Per-class non-maximum suppression. Output is sorted by descending confidence.
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Result<Vec<Detection>> {
    let mut by_class: BTreeMap<u32, Vec<Detection>> = BTreeMap::new();
    for detection in detections {
        by_class.entry(detection.class_id).or_default().push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..group.len() {
                if !suppressed[j] && iou(&group[i].bbox, &group[j].bbox)? > iou_threshold {
                    suppressed[j] = true;
                }
            }
            kept.push(group[i].clone());
        }
    }

    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(kept)
}
