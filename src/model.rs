//! Traits for the external model collaborators. The face detector and the
//! embedding model are black boxes supplied by the wiring layer.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<FaceRegion>>;
}

pub trait Embedder: Send + Sync {
    /// Maps a cropped face image to a raw (not yet normalized) feature
    /// vector of [`Embedder::dim`] elements.
    fn embed(&self, face_crop: &[u8]) -> Result<Vec<f32>>;

    fn dim(&self) -> usize;
}
