//! Box geometry shared by the cascade and the overlap clustering.
//!
//! Boxes are axis-aligned rectangles in pixel coordinates of the image they were
//! detected in. Crop rectangles are integer pixel bounds clamped to that image.

use serde::{Deserialize, Serialize};

use crate::error::InvalidBoxError;

/// Axis-aligned box in pixel coordinates, `min` edges inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Returns the box itself when both extents are strictly positive.
    pub fn validated(&self) -> Result<&Self, InvalidBoxError> {
        // NaN coordinates fail both comparisons and are rejected here too.
        if self.x_min < self.x_max && self.y_min < self.y_max {
            Ok(self)
        } else {
            Err(InvalidBoxError(*self))
        }
    }
}

/// Integer pixel rectangle `[left, right) x [top, bottom)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Intersection over union of two boxes.
///
/// Both boxes must have positive width and height. Disjoint boxes (including boxes
/// that only share an edge) yield exactly `0.0`; identical boxes yield `1.0`.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> Result<f32, InvalidBoxError> {
    a.validated()?;
    b.validated()?;

    let left = a.x_min.max(b.x_min);
    let top = a.y_min.max(b.y_min);
    let right = a.x_max.min(b.x_max);
    let bottom = a.y_max.min(b.y_max);

    if right <= left || bottom <= top {
        return Ok(0.0);
    }

    let intersection = (right - left) * (bottom - top);
    let union = a.area() + b.area() - intersection;
    Ok((intersection / union).clamp(0.0, 1.0))
}

/// Expand `bbox` by `margin` pixels on every side and clamp to the image.
///
/// Box coordinates are truncated toward zero before padding. Each edge is clamped
/// on its own, so a box hanging off one side of the image still keeps its other
/// edges. The result is never empty for a non-empty image: a degenerate box grows
/// to a one-pixel rectangle inside the image.
pub fn padded_crop(bbox: &BoundingBox, margin: u32, image_width: u32, image_height: u32) -> Rect {
    let margin = i64::from(margin);
    let (left, right) = clamp_span(
        bbox.x_min as i64 - margin,
        bbox.x_max as i64 + margin,
        image_width,
    );
    let (top, bottom) = clamp_span(
        bbox.y_min as i64 - margin,
        bbox.y_max as i64 + margin,
        image_height,
    );
    Rect {
        left,
        top,
        right,
        bottom,
    }
}

fn clamp_span(start: i64, end: i64, limit: u32) -> (u32, u32) {
    let max = i64::from(limit);
    let mut start = start.clamp(0, max);
    let mut end = end.clamp(0, max);
    if end <= start {
        if start < max {
            end = start + 1;
        } else {
            start = (max - 1).max(0);
            end = max;
        }
    }
    (start as u32, end as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1)
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = bb(0.0, 0.0, 10.0, 10.0);
        let b = bb(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b).unwrap(), 0.0);

        // Touching edges share no area.
        let c = bb(10.0, 0.0, 20.0, 10.0);
        assert_eq!(iou(&a, &c).unwrap(), 0.0);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = bb(3.5, 4.0, 17.25, 40.0);
        assert_eq!(iou(&a, &a).unwrap(), 1.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = bb(0.0, 0.0, 10.0, 10.0);
        let b = bb(5.0, 5.0, 15.0, 15.0);
        let ab = iou(&a, &b).unwrap();
        let ba = iou(&b, &a).unwrap();
        assert_eq!(ab, ba);
        // 25 / (100 + 100 - 25)
        assert!((ab - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_nested_box_is_area_ratio() {
        let outer = bb(0.0, 0.0, 10.0, 10.0);
        let inner = bb(0.0, 0.0, 5.0, 5.0);
        assert!((iou(&outer, &inner).unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn iou_rejects_degenerate_boxes() {
        let good = bb(0.0, 0.0, 10.0, 10.0);
        let flat = bb(0.0, 5.0, 10.0, 5.0);
        let inverted = bb(10.0, 0.0, 0.0, 10.0);
        assert_eq!(iou(&good, &flat), Err(InvalidBoxError(flat)));
        assert_eq!(iou(&inverted, &good), Err(InvalidBoxError(inverted)));
        assert!(iou(&good, &bb(f32::NAN, 0.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn padded_crop_expands_by_margin() {
        let rect = padded_crop(&bb(100.0, 50.0, 200.0, 150.0), 40, 640, 480);
        assert_eq!(
            rect,
            Rect {
                left: 60,
                top: 10,
                right: 240,
                bottom: 190
            }
        );
        assert_eq!(rect.width(), 180);
        assert_eq!(rect.height(), 180);
    }

    #[test]
    fn padded_crop_clamps_each_edge_independently() {
        let rect = padded_crop(&bb(10.0, 400.0, 630.0, 470.0), 40, 640, 480);
        assert_eq!(
            rect,
            Rect {
                left: 0,
                top: 360,
                right: 640,
                bottom: 480
            }
        );
    }

    #[test]
    fn padded_crop_truncates_fractional_coordinates() {
        let rect = padded_crop(&bb(10.9, 20.2, 30.7, 40.99), 0, 100, 100);
        assert_eq!(
            rect,
            Rect {
                left: 10,
                top: 20,
                right: 30,
                bottom: 40
            }
        );
    }

    #[test]
    fn padded_crop_is_never_empty() {
        let sliver = padded_crop(&bb(5.2, 5.1, 5.8, 5.9), 0, 10, 10);
        assert!(!sliver.is_empty());

        let outside = padded_crop(&bb(50.0, 50.0, 60.0, 60.0), 0, 10, 10);
        assert!(!outside.is_empty());
        assert_eq!(outside.right, 10);
        assert_eq!(outside.bottom, 10);
    }

    #[test]
    fn padded_crop_stays_inside_image() {
        let boxes = [
            bb(-30.0, -30.0, 5.0, 5.0),
            bb(0.0, 0.0, 1000.0, 1000.0),
            bb(12.0, 7.0, 13.0, 8.0),
            bb(-500.0, 20.0, -400.0, 30.0),
            bb(63.0, 47.0, 64.0, 48.0),
        ];
        for (w, h) in [(64, 48), (1, 1), (640, 480)] {
            for margin in [0, 1, 40, 10_000] {
                for b in &boxes {
                    let rect = padded_crop(b, margin, w, h);
                    assert!(rect.right <= w && rect.bottom <= h, "{rect:?} in {w}x{h}");
                    assert!(rect.left < rect.right && rect.top < rect.bottom, "{rect:?}");
                }
            }
        }
    }
}
