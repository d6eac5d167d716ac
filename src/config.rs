//! Vision pipeline configuration

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::engine::registry::{self, ModelConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub faces: FacesConfig,
    pub matching: MatchingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
    /// Run one zero-filled inference right after load
    pub warmup: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub directory: PathBuf,
    /// Per-model file overrides; relative paths resolve against `directory`
    pub files: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model: String,
    pub segmentation_model: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub mask_threshold: f32,
    /// Class names to keep; empty keeps every class
    pub relevant_classes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FacesConfig {
    pub detector: String,
    pub embedder: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub crop_padding: f32,
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ContextPolicy {
    /// Maximum Euclidean distance accepted as a match
    pub threshold: f32,
    pub max_faces: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub descriptor_dimension: usize,
    pub portrait: ContextPolicy,
    pub action: ContextPolicy,
    pub podium: ContextPolicy,
    pub auto: ContextPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists. Only a missing file yields `None`; a file
    /// that exists but does not parse is an error.
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl ModelsConfig {
    /// Local file for a registered model
    pub fn path_for(&self, config: &ModelConfig) -> PathBuf {
        match self.files.get(config.id) {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => self.directory.join(file),
            None => self.directory.join(config.file_name),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            warmup: true,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("models"),
            files: HashMap::new(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: registry::RF_DETR.to_string(),
            segmentation_model: registry::YOLOV8_SEG.to_string(),
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            max_detections: 100,
            mask_threshold: 0.5,
            relevant_classes: Vec::new(),
        }
    }
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            detector: registry::YUNET.to_string(),
            embedder: registry::ARCFACE.to_string(),
            confidence_threshold: 0.6,
            nms_threshold: 0.3,
            crop_padding: 0.25,
            embedding_dim: 512,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            descriptor_dimension: 512,
            portrait: ContextPolicy { threshold: 0.9, max_faces: 3 },
            action: ContextPolicy { threshold: 1.0, max_faces: 10 },
            podium: ContextPolicy { threshold: 0.95, max_faces: 6 },
            auto: ContextPolicy { threshold: 0.95, max_faces: 20 },
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.inference.device, "CPU");
        assert_eq!(config.detection.max_detections, 100);
        assert_eq!(config.faces.detector, "yunet");
        assert!((config.faces.confidence_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[detection]
confidence_threshold = 0.3
relevant_classes = ["person", "car"]

[matching.portrait]
threshold = 0.7
max_faces = 2
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!((config.detection.confidence_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.detection.relevant_classes, vec!["person", "car"]);
        assert_eq!(config.detection.max_detections, 100);
        assert_eq!(config.matching.portrait.max_faces, 2);
        assert_eq!(config.matching.action.max_faces, 10);
        assert_eq!(config.inference.device, "CPU");
    }

    #[test]
    fn test_model_paths() {
        let mut models = ModelsConfig {
            directory: PathBuf::from("/opt/models"),
            files: HashMap::new(),
        };
        let yunet = registry::get_config(registry::YUNET).unwrap();
        assert_eq!(
            models.path_for(yunet),
            PathBuf::from("/opt/models/face_detection_yunet_2023mar.onnx")
        );

        models.files.insert("yunet".into(), PathBuf::from("custom/yunet.xml"));
        assert_eq!(models.path_for(yunet), PathBuf::from("/opt/models/custom/yunet.xml"));

        models.files.insert("yunet".into(), PathBuf::from("/abs/yunet.onnx"));
        assert_eq!(models.path_for(yunet), PathBuf::from("/abs/yunet.onnx"));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(Config::load("/nonexistent/config.toml").is_err());
    }

    #[test]
    fn test_malformed_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detection]\nconfidence_threshold = \"high\"").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("confidence_threshold"));
        assert!(Config::load_optional(file.path()).is_err());
    }

    #[test]
    fn test_load_optional_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_optional(dir.path().join("config.toml")).unwrap().is_none());
    }
}
