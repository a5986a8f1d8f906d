//! Detector backends and their raw output.
//!
//! A backend turns an RGB image into `Detection`s in that image's pixel
//! coordinates. Everything downstream of a backend (cropping, clustering,
//! indexing) is backend-agnostic.

mod backend;
mod backends;
mod loader;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use loader::{load_backend, STUB_SCHEME};
pub use result::Detection;
