//! Scene Classifier
//!
//! Single-output image classifier over the registry's scene categories.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pool::ModelHandle;
use super::preprocess::prepare;
use super::registry::{ModelConfig, ModelFamily};
use super::tensor::NamedTensors;
use crate::error::{Result, VisionError};
use crate::utils::math::softmax;

/// Tolerance for treating scores as already being probabilities
const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// One category score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneScore {
    pub label: String,
    pub score: f32,
}

/// Scene classification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneClassification {
    pub label: String,
    pub confidence: f32,
    /// Every category, highest score first
    pub scores: Vec<SceneScore>,
}

/// Turn raw classifier output into a ranked classification
pub fn decode_scene(config: &ModelConfig, outputs: &NamedTensors) -> Result<SceneClassification> {
    let raw = outputs
        .first()
        .ok_or_else(|| VisionError::malformed(config.id, "no output tensor"))?;

    if raw.len() != config.num_classes() {
        return Err(VisionError::malformed(
            config.id,
            format!("expected {} scores, got shape {:?}", config.num_classes(), raw.shape()),
        ));
    }

    let sum: f32 = raw.data().iter().sum();
    let all_probabilities = raw.data().iter().all(|&p| (0.0..=1.0).contains(&p));
    let probs = if all_probabilities && (sum - 1.0).abs() <= PROBABILITY_SUM_TOLERANCE {
        raw.data().to_vec()
    } else {
        debug!("{} scores sum to {:.3}, applying softmax", config.id, sum);
        softmax(raw.data())
    };

    let mut scores: Vec<SceneScore> = config
        .classes
        .iter()
        .zip(probs)
        .map(|(label, score)| SceneScore {
            label: label.to_string(),
            score,
        })
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));

    let top = scores
        .first()
        .ok_or_else(|| VisionError::malformed(config.id, "no scene categories"))?;

    Ok(SceneClassification {
        label: top.label.clone(),
        confidence: top.score,
        scores,
    })
}

/// Scene classification stage bound to a loaded model
pub struct SceneClassifier {
    handle: ModelHandle,
}

impl SceneClassifier {
    pub fn new(handle: ModelHandle) -> Result<Self> {
        if handle.config().family != ModelFamily::SceneClassifier {
            return Err(VisionError::unavailable(handle.id(), "not a scene classification model"));
        }
        Ok(Self { handle })
    }

    /// Classify a whole image
    pub async fn classify(&self, image: &DynamicImage) -> Result<SceneClassification> {
        let config = self.handle.config();
        let prepared = prepare(image, config);
        let outputs = self.handle.run(prepared.inputs).await?;
        let result = decode_scene(config, &outputs)?;
        debug!("{} classified as {} ({:.3})", config.id, result.label, result.confidence);
        Ok(result)
    }
}
