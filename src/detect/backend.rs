use anyhow::Result;
use image::RgbImage;

use super::result::Detection;

/// Object detector backend.
///
/// Each cascade stage owns one backend. The backend sees either the full source
/// image (flower stage) or a crop of it (pollinator stage) and reports boxes in the
/// coordinates of whatever it was given. Thresholds, NMS and class filtering are the
/// backend's business; the cascade only clusters what comes back.
pub trait DetectorBackend: Send {
    /// Backend identifier, used in logs.
    fn name(&self) -> &str;

    /// Run detection on an RGB image.
    ///
    /// `size_hint` is the square inference size the model was configured with.
    /// An `Err` is a detection failure: the cascade abandons the image when it
    /// happens at the flower stage and skips the crop at the pollinator stage.
    fn detect(&mut self, image: &RgbImage, size_hint: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
