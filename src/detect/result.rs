use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One raw detection reported by a backend, in pixel coordinates of the image the
/// backend was given.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    /// Label reported by the model itself, if it carries one.
    pub class_name: Option<String>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = Some(name.into());
        self
    }

    /// Resolve the display label.
    ///
    /// A configured class table wins over the model's own label; an id outside the
    /// table falls back to the model label and finally to `class_<id>`.
    pub fn label(&self, class_names: Option<&[String]>) -> String {
        class_names
            .and_then(|names| names.get(self.class_id as usize))
            .or(self.class_name.as_ref())
            .cloned()
            .unwrap_or_else(|| format!("class_{}", self.class_id))
    }
}
