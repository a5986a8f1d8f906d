#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::detect::yolo::{self, YoloParams};

/// Tract-based backend for YOLOv5-style ONNX detectors.
///
/// This backend loads a local model file and performs inference on RGB images.
/// It does not perform any network I/O or write to disk beyond model loading.
pub struct TractBackend {
    name: String,
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    params: YoloParams,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for square `input_size` inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, params: YoloParams) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tract".to_string());

        Ok(Self {
            name,
            model,
            input_size,
            params,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, image: &RgbImage, size_hint: u32) -> Result<Vec<Detection>> {
        if size_hint != self.input_size {
            log::debug!(
                "{}: size hint {} ignored, model is fixed at {}",
                self.name,
                size_hint,
                self.input_size
            );
        }
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let row_len = *view
            .shape()
            .last()
            .ok_or_else(|| anyhow!("model output tensor has no dimensions"))?;
        let values: Vec<f32> = view.iter().copied().collect();

        yolo::decode(
            &values,
            row_len,
            &self.params,
            self.input_size,
            image.width(),
            image.height(),
        )
    }
}
