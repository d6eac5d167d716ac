//! Vision Service - pipeline orchestration
//!
//! Owns the model pool and the face gallery, loads models on request and
//! runs each pipeline stage against ready handles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use tracing::{info, warn};

use crate::config::{Config, ModelsConfig};
use crate::engine::registry::{self, ModelConfig};
use crate::engine::{
    DecodeOptions, FaceDetector, FaceEmbedder, ModelHandle, ModelPool, ObjectDetector,
    OpenVinoLoader, SceneClassifier, Segmenter, SessionLoader,
};
use crate::error::{Result, VisionError};
use crate::storage::DescriptorStore;

use super::matcher::{FaceMatcher, MatchContext};
use super::types::*;

/// Resolves a registered model to a local file
pub trait ModelLocator: Send + Sync {
    fn locate(&self, config: &'static ModelConfig) -> Result<PathBuf>;
}

/// Locator backed by the `[models]` configuration section
pub struct ConfigModelLocator {
    models: ModelsConfig,
}

impl ConfigModelLocator {
    pub fn new(models: ModelsConfig) -> Self {
        Self { models }
    }
}

impl ModelLocator for ConfigModelLocator {
    fn locate(&self, config: &'static ModelConfig) -> Result<PathBuf> {
        Ok(self.models.path_for(config))
    }
}

/// Vision pipeline service
pub struct VisionService {
    pool: Arc<ModelPool>,
    locator: Arc<dyn ModelLocator>,
    matcher: FaceMatcher,
    config: Config,
}

impl VisionService {
    /// Create a new vision service
    pub fn new(pool: Arc<ModelPool>, locator: Arc<dyn ModelLocator>, config: Config) -> Self {
        let matcher = FaceMatcher::new(&config.matching);
        Self {
            pool,
            locator,
            matcher,
            config,
        }
    }

    /// Service backed by OpenVINO and the configured model directory
    pub fn from_config(config: Config) -> Result<Self> {
        let loader: Arc<dyn SessionLoader> = Arc::new(OpenVinoLoader::new(&config.inference.device)?);
        let pool = Arc::new(ModelPool::new(loader).with_warmup(config.inference.warmup));
        let locator = Arc::new(ConfigModelLocator::new(config.models.clone()));
        Ok(Self::new(pool, locator, config))
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load one model, resolving its file through the locator
    pub async fn load_model(&self, model_id: &str) -> Result<ModelHandle> {
        let config = registry::get_config(model_id)
            .ok_or_else(|| VisionError::UnknownModel(model_id.to_string()))?;
        let path = self.locator.locate(config)?;
        self.pool.load_model(model_id, path).await
    }

    /// Clear a cached load failure and try again
    pub async fn retry_model(&self, model_id: &str) -> Result<ModelHandle> {
        let config = registry::get_config(model_id)
            .ok_or_else(|| VisionError::UnknownModel(model_id.to_string()))?;
        let path = self.locator.locate(config)?;
        self.pool.retry_load(model_id, path).await
    }

    /// Load every listed model. All loads are attempted; the first failure is
    /// returned after the rest have run.
    pub async fn initialize<S: AsRef<str>>(&self, model_ids: &[S]) -> Result<()> {
        let mut first_error = None;
        for model_id in model_ids {
            if let Err(e) = self.load_model(model_id.as_ref()).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Initialized {} models", model_ids.len());
                Ok(())
            }
        }
    }

    /// Status of every registered model
    pub fn model_status(&self) -> Vec<ModelStatusEntry> {
        self.pool
            .get_status()
            .into_iter()
            .filter_map(|(model_id, status)| {
                registry::get_config(model_id).map(|config| ModelStatusEntry {
                    model_id: model_id.to_string(),
                    family: config.family.as_str().to_string(),
                    status,
                })
            })
            .collect()
    }

    fn decode_options(&self, model_id: &str) -> DecodeOptions {
        let detection = &self.config.detection;
        let relevant_class_ids = registry::class_names_to_ids(model_id, &detection.relevant_classes);
        if relevant_class_ids.len() < detection.relevant_classes.len() {
            warn!("Some relevant classes are unknown to {} and were ignored", model_id);
        }
        DecodeOptions {
            confidence_threshold: detection.confidence_threshold,
            iou_threshold: detection.iou_threshold,
            relevant_class_ids,
            max_detections: detection.max_detections,
            mask_threshold: detection.mask_threshold,
        }
    }

    /// Detect objects with the given (or configured) detector
    pub async fn detect_objects(&self, image: &DynamicImage, model_id: Option<&str>) -> Result<DetectionResult> {
        let start = Instant::now();
        let model_id = model_id.unwrap_or(self.config.detection.model.as_str());
        let detector = ObjectDetector::new(self.pool.handle(model_id)?)?;
        let detections = detector.detect(image, &self.decode_options(model_id)).await?;
        let (image_width, image_height) = image.dimensions();

        Ok(DetectionResult {
            model_id: model_id.to_string(),
            image_width,
            image_height,
            detections,
            inference_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Instance segmentation with the configured segmenter
    pub async fn segment(&self, image: &DynamicImage) -> Result<DetectionResult> {
        let start = Instant::now();
        let model_id = self.config.detection.segmentation_model.as_str();
        let segmenter = Segmenter::new(self.pool.handle(model_id)?)?;
        let detections = segmenter.segment(image, &self.decode_options(model_id)).await?;
        let (image_width, image_height) = image.dimensions();

        Ok(DetectionResult {
            model_id: model_id.to_string(),
            image_width,
            image_height,
            detections,
            inference_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn face_detector(&self) -> Result<FaceDetector> {
        let faces = &self.config.faces;
        FaceDetector::new(
            self.pool.handle(&faces.detector)?,
            faces.confidence_threshold,
            faces.nms_threshold,
        )
    }

    /// Detect faces
    pub async fn detect_faces(&self, image: &DynamicImage) -> Result<FaceDetectionResult> {
        let start = Instant::now();
        let faces = self.face_detector()?.detect(image).await?;
        Ok(FaceDetectionResult {
            faces,
            inference_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Detect, embed and match every face, up to the context's face cap.
    ///
    /// A face that cannot be cropped or embedded gets an error entry; the
    /// remaining faces are still processed.
    pub async fn analyze_faces(&self, image: &DynamicImage, context: MatchContext) -> Result<AnalyzeResult> {
        let start = Instant::now();
        let policy = self.matcher.policy(context);
        let detector = self.face_detector()?.with_max_faces(policy.max_faces);
        let embedder = FaceEmbedder::new(
            self.pool.handle(&self.config.faces.embedder)?,
            Some(self.config.faces.embedding_dim),
        )?;

        let faces = detector.detect(image).await?;
        let mut analyses = Vec::with_capacity(faces.len());

        for face in faces {
            match embedder.embed_region(image, &face, self.config.faces.crop_padding).await {
                Ok(embedding) => {
                    let matched = self.matcher.find_match(&embedding.vector, context);
                    analyses.push(FaceAnalysis {
                        face,
                        embedding: Some(embedding),
                        matched,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Skipping face at {:?}: {}", face.bbox, e);
                    analyses.push(FaceAnalysis {
                        face,
                        embedding: None,
                        matched: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let result = AnalyzeResult {
            context,
            faces: analyses,
            inference_time_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Analyzed {} faces ({} matched) in {}ms",
            result.faces.len(),
            result.matched().count(),
            result.inference_time_ms
        );
        Ok(result)
    }

    /// Classify the whole image into a scene category
    pub async fn classify_scene(&self, image: &DynamicImage) -> Result<SceneResult> {
        let start = Instant::now();
        let classifier = SceneClassifier::new(self.pool.handle(registry::SCENE_CLASSIFIER)?)?;
        let classification = classifier.classify(image).await?;
        Ok(SceneResult {
            classification,
            inference_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub fn gallery(&self) -> &FaceMatcher {
        &self.matcher
    }

    /// Exclusive access for gallery mutation
    pub fn gallery_mut(&mut self) -> &mut FaceMatcher {
        &mut self.matcher
    }

    /// Replace the gallery with the store's contents
    pub async fn load_gallery(&mut self, store: &dyn DescriptorStore) -> anyhow::Result<usize> {
        let descriptors = store.load_descriptors().await?;
        Ok(self.matcher.load(descriptors))
    }
}
