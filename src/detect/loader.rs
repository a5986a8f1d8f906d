use anyhow::Result;

use crate::config::ModelSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::backends::StubBackend;
use crate::detect::yolo::YoloParams;

/// Weights paths with this prefix select the scripted stub backend.
pub const STUB_SCHEME: &str = "stub://";

impl From<&ModelSettings> for YoloParams {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            confidence_threshold: settings.confidence_threshold,
            iou_threshold: settings.iou_threshold,
            multi_label: settings.multi_label,
            max_detections: settings.max_detections,
        }
    }
}

/// Build the backend named by `settings.weights_path`.
pub fn load_backend(settings: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    if settings.weights_path.starts_with(STUB_SCHEME) {
        log::warn!(
            "{}: stub backend selected, no detections will be produced",
            settings.weights_path
        );
        return Ok(Box::new(StubBackend::new()));
    }
    load_model_backend(settings)
}

#[cfg(feature = "backend-tract")]
fn load_model_backend(settings: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    use crate::detect::backends::TractBackend;

    let backend = TractBackend::new(
        &settings.weights_path,
        settings.image_size,
        YoloParams::from(settings),
    )?;
    log::info!(
        "loaded {} ({}x{} input)",
        settings.model_name,
        settings.image_size,
        settings.image_size
    );
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model_backend(settings: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow::anyhow!(
        "loading '{}' requires the backend-tract feature.\n\
         Recompile with: cargo build --features backend-tract\n\
         Or use a '{}' weights path for a dry run.",
        settings.weights_path,
        STUB_SCHEME
    ))
}
