//! Service layer types

use serde::Serialize;

use super::matcher::{MatchContext, MatchResult};
use crate::engine::{Detection, FaceEmbedding, FaceRegion, ModelStatus, SceneClassification};

/// Object detection or segmentation result
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub model_id: String,
    pub image_width: u32,
    pub image_height: u32,
    pub detections: Vec<Detection>,
    pub inference_time_ms: u64,
}

/// Face detection result
#[derive(Debug, Clone, Serialize)]
pub struct FaceDetectionResult {
    pub faces: Vec<FaceRegion>,
    pub inference_time_ms: u64,
}

/// Per-face outcome of detect, embed and match
#[derive(Debug, Clone, Serialize)]
pub struct FaceAnalysis {
    pub face: FaceRegion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<FaceEmbedding>,
    #[serde(rename = "match")]
    pub matched: Option<MatchResult>,
    /// Set when this face could not be embedded; other faces are unaffected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Face analysis result
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub context: MatchContext,
    pub faces: Vec<FaceAnalysis>,
    pub inference_time_ms: u64,
}

impl AnalyzeResult {
    pub fn matched(&self) -> impl Iterator<Item = &MatchResult> {
        self.faces.iter().filter_map(|f| f.matched.as_ref())
    }
}

/// Scene classification result
#[derive(Debug, Clone, Serialize)]
pub struct SceneResult {
    #[serde(flatten)]
    pub classification: SceneClassification,
    pub inference_time_ms: u64,
}

/// Load state of one registered model
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusEntry {
    pub model_id: String,
    pub family: String,
    pub status: ModelStatus,
}
