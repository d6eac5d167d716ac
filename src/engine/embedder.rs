//! ArcFace Face Embedder
//!
//! Turns a padded face crop into an L2-normalized identity descriptor.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::pool::ModelHandle;
use super::preprocess::{crop_face, prepare};
use super::registry::ModelFamily;
use super::types::FaceRegion;
use crate::error::{Result, VisionError};
use crate::utils::math::{euclidean_distance, l2_normalize};

/// Default context padding around a detected face
pub const DEFAULT_CROP_PADDING: f32 = 0.25;

/// Face embedding result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub vector: Vec<f32>,
    /// Norm of the raw model output
    pub norm: f32,
}

impl FaceEmbedding {
    /// Create a new normalized embedding. A zero vector is kept as-is.
    pub fn new(mut vector: Vec<f32>) -> Self {
        let norm = l2_normalize(&mut vector);
        Self { vector, norm }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Euclidean distance to another embedding, `None` if dimensions differ
    pub fn distance(&self, other: &FaceEmbedding) -> Option<f32> {
        euclidean_distance(&self.vector, &other.vector)
    }
}

/// Face embedding stage bound to a loaded model
pub struct FaceEmbedder {
    handle: ModelHandle,
    embedding_dim: usize,
}

impl FaceEmbedder {
    /// Create a new face embedder; `embedding_dim` overrides the registry value
    pub fn new(handle: ModelHandle, embedding_dim: Option<usize>) -> Result<Self> {
        let config = handle.config();
        if config.family != ModelFamily::FaceEmbedder {
            return Err(VisionError::unavailable(handle.id(), "not a face embedding model"));
        }
        let embedding_dim = embedding_dim.or(config.embedding_dim).unwrap_or(512);
        Ok(Self { handle, embedding_dim })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Extract an embedding from a face crop
    ///
    /// A vector of unexpected length is logged and still returned; callers
    /// comparing descriptors reject it there.
    pub async fn embed(&self, face: &DynamicImage) -> Result<FaceEmbedding> {
        let config = self.handle.config();
        let prepared = prepare(face, config);
        let outputs = self.handle.run(prepared.inputs).await?;

        let raw = outputs
            .first()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VisionError::malformed(config.id, "no embedding output"))?;

        if raw.len() != self.embedding_dim {
            warn!(
                "{}",
                VisionError::DimensionMismatch {
                    expected: self.embedding_dim,
                    actual: raw.len(),
                }
            );
        }

        let embedding = FaceEmbedding::new(raw.data().to_vec());
        debug!("{} embedding norm {:.3}", config.id, embedding.norm);
        Ok(embedding)
    }

    /// Crop `face` out of `image` with `padding` on every side and embed it
    pub async fn embed_region(&self, image: &DynamicImage, face: &FaceRegion, padding: f32) -> Result<FaceEmbedding> {
        let crop = crop_face(image, &face.bbox, padding)?;
        self.embed(&crop).await
    }
}
