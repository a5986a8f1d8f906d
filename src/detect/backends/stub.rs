use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Scripted backend for tests and dry runs.
///
/// Responses are replayed in call order; once the script is exhausted every call
/// reports no detections. The sizes of the images it was called with are recorded
/// so tests can check which crops reached the detector.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Result<Vec<Detection>, String>>,
    calls: Vec<(u32, u32)>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn respond(mut self, detections: Vec<Detection>) -> Self {
        self.script.push_back(Ok(detections));
        self
    }

    /// Queue a failing response.
    pub fn fail(mut self, message: &str) -> Self {
        self.script.push_back(Err(message.to_string()));
        self
    }

    /// `(width, height)` of every image passed to `detect`, in call order.
    pub fn calls(&self) -> &[(u32, u32)] {
        &self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage, _size_hint: u32) -> Result<Vec<Detection>> {
        self.calls.push(image.dimensions());
        match self.script.pop_front() {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}
