//! Source images and the crops cut out of them.
//!
//! - `SourceImage`: a decoded RGB image plus the path it was read from.
//! - `Crop`: an owned copy of a clamped, margin-padded region of an image.
//!
//! Crops own their pixels so the image they came from can be dropped first; a
//! pollinator crop outlives its flower crop inside the final record.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops, ImageFormat, RgbImage};

use crate::detect::Detection;
use crate::error::PipelineError;
use crate::geometry::{padded_crop, Rect};

/// Decoded input image.
pub struct SourceImage {
    path: PathBuf,
    pixels: RgbImage,
}

impl SourceImage {
    /// Decode an image file into an RGB buffer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let pixels = image::open(path)
            .map_err(|source| PipelineError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .into_rgb8();
        Ok(Self {
            path: path.to_path_buf(),
            pixels,
        })
    }

    pub fn from_rgb(path: impl Into<PathBuf>, pixels: RgbImage) -> Self {
        Self {
            path: path.into(),
            pixels,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Owned rectangular region of an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Crop {
    pub bounds: Rect,
    pixels: RgbImage,
}

impl Crop {
    /// Copy `bounds` out of `image`. Bounds must lie inside the image.
    pub fn extract(image: &RgbImage, bounds: Rect) -> Self {
        let pixels = imageops::crop_imm(
            image,
            bounds.left,
            bounds.top,
            bounds.width(),
            bounds.height(),
        )
        .to_image();
        Self { bounds, pixels }
    }

    /// Margin-padded crop around a detection.
    pub fn around(image: &RgbImage, detection: &Detection, margin: u32) -> Self {
        let bounds = padded_crop(&detection.bbox, margin, image.width(), image.height());
        Self::extract(image, bounds)
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Encode the crop as a baseline JPEG.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        self.pixels
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .context("encode crop as jpeg")?;
        Ok(buffer.into_inner())
    }
}

/// One margin-padded crop per detection, in detection order.
pub fn crop_with_margin(image: &RgbImage, detections: &[Detection], margin: u32) -> Vec<Crop> {
    detections
        .iter()
        .map(|detection| Crop::around(image, detection, margin))
        .collect()
}
