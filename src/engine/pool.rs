//! Model Pool Manager
//!
//! Owns one session per model id. Loading is explicit and deduplicated:
//! concurrent `load_model` calls for one id wait on the same slot load lock,
//! so a single load runs and everyone sees its outcome. The published state
//! sits behind its own `RwLock`, so readers never wait on a load. Failures
//! are cached until `retry_load` is called.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::registry::{self, ModelConfig};
use super::session::{InferenceSession, SessionLoader};
use super::tensor::{NamedTensors, Tensor};
use crate::error::{Result, VisionError};

/// A ready model: its registry entry plus the loaded session.
/// Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct ModelHandle {
    config: &'static ModelConfig,
    session: Arc<dyn InferenceSession>,
}

impl ModelHandle {
    pub fn new(config: &'static ModelConfig, session: Arc<dyn InferenceSession>) -> Self {
        Self { config, session }
    }

    pub fn config(&self) -> &'static ModelConfig {
        self.config
    }

    pub fn id(&self) -> &'static str {
        self.config.id
    }

    /// Run inference on the blocking pool
    pub async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors> {
        let session = self.session.clone();
        let start = Instant::now();
        let outputs = tokio::task::spawn_blocking(move || session.run(&inputs))
            .await
            .map_err(|e| VisionError::inference(format!("inference task failed: {}", e)))??;
        debug!("{} inference took {:?}", self.config.id, start.elapsed());
        Ok(outputs)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("id", &self.config.id).finish()
    }
}

/// Load state of one model id
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

enum SlotState {
    Empty,
    Ready(ModelHandle),
    Failed(VisionError),
}

struct Slot {
    /// Serializes loads, retries and disposal for one id
    load: AsyncMutex<()>,
    state: RwLock<SlotState>,
}

impl Slot {
    /// Cached outcome of the last load, if any
    fn published(&self) -> Option<Result<ModelHandle>> {
        match &*self.state.read() {
            SlotState::Ready(handle) => Some(Ok(handle.clone())),
            SlotState::Failed(err) => Some(Err(err.clone())),
            SlotState::Empty => None,
        }
    }
}

/// Model Pool Manager with explicit, deduplicated loading
pub struct ModelPool {
    loader: Arc<dyn SessionLoader>,
    warmup: bool,
    slots: Mutex<HashMap<&'static str, Arc<Slot>>>,
}

impl ModelPool {
    /// Create a new model pool
    pub fn new(loader: Arc<dyn SessionLoader>) -> Self {
        Self {
            loader,
            warmup: true,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    fn slot(&self, config: &'static ModelConfig) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(config.id)
            .or_insert_with(|| {
                Arc::new(Slot {
                    load: AsyncMutex::new(()),
                    state: RwLock::new(SlotState::Empty),
                })
            })
            .clone()
    }

    fn existing_slot(&self, model_id: &str) -> Option<Arc<Slot>> {
        self.slots.lock().get(model_id).cloned()
    }

    /// Whether `slot` is still the one registered for `model_id`
    fn is_current(&self, model_id: &str, slot: &Arc<Slot>) -> bool {
        self.existing_slot(model_id)
            .is_some_and(|current| Arc::ptr_eq(&current, slot))
    }

    /// Load a model, or return the already-loaded handle.
    ///
    /// A cached failure is returned as-is without touching the file again.
    pub async fn load_model(&self, model_id: &str, path: impl AsRef<Path>) -> Result<ModelHandle> {
        let config = registry::get_config(model_id)
            .ok_or_else(|| VisionError::UnknownModel(model_id.to_string()))?;
        let path = path.as_ref();

        loop {
            let slot = self.slot(config);
            if let Some(outcome) = slot.published() {
                return outcome;
            }

            let _load = slot.load.lock().await;
            // Disposed while we waited; start over on the live slot
            if !self.is_current(config.id, &slot) {
                continue;
            }
            if let Some(outcome) = slot.published() {
                return outcome;
            }

            info!("Loading model: {} from {}", model_id, path.display());
            let start = Instant::now();

            let outcome = self.load_session(config, path.to_path_buf()).await;
            match &outcome {
                Ok(handle) => {
                    info!("Model {} ready in {:?}", model_id, start.elapsed());
                    *slot.state.write() = SlotState::Ready(handle.clone());
                }
                Err(err) => {
                    warn!("Model {} failed to load: {}", model_id, err);
                    *slot.state.write() = SlotState::Failed(err.clone());
                }
            }
            return outcome;
        }
    }

    /// Clear a cached failure and load again
    pub async fn retry_load(&self, model_id: &str, path: impl AsRef<Path>) -> Result<ModelHandle> {
        if let Some(slot) = self.existing_slot(model_id) {
            let _load = slot.load.lock().await;
            let mut state = slot.state.write();
            if matches!(*state, SlotState::Failed(_)) {
                *state = SlotState::Empty;
            }
        }
        self.load_model(model_id, path).await
    }

    async fn load_session(&self, config: &'static ModelConfig, path: PathBuf) -> Result<ModelHandle> {
        let loader = self.loader.clone();
        let warmup = self.warmup;

        tokio::task::spawn_blocking(move || {
            let session = loader.load(&path, config).map_err(|e| match e {
                VisionError::ModelUnavailable { .. } => e,
                other => VisionError::unavailable(config.id, other),
            })?;
            if warmup {
                warm_up(config, session.as_ref());
            }
            Ok(ModelHandle::new(config, session))
        })
        .await
        .map_err(|e| VisionError::unavailable(config.id, format!("load task failed: {}", e)))?
    }

    /// Ready handle for a model, `ModelUnavailable` otherwise
    pub fn handle(&self, model_id: &str) -> Result<ModelHandle> {
        let slot = self
            .existing_slot(model_id)
            .ok_or_else(|| VisionError::unavailable(model_id, "model not loaded"))?;
        match slot.published() {
            Some(outcome) => outcome,
            None if slot.load.try_lock().is_err() => {
                Err(VisionError::unavailable(model_id, "model is still loading"))
            }
            None => Err(VisionError::unavailable(model_id, "model not loaded")),
        }
    }

    pub fn is_ready(&self, model_id: &str) -> bool {
        self.handle(model_id).is_ok()
    }

    /// Cached load error, if the last load failed
    pub fn load_error(&self, model_id: &str) -> Option<VisionError> {
        let slot = self.existing_slot(model_id)?;
        let state = slot.state.read();
        match &*state {
            SlotState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn status(&self, model_id: &str) -> ModelStatus {
        let Some(slot) = self.existing_slot(model_id) else {
            return ModelStatus::NotLoaded;
        };
        let state = slot.state.read();
        match &*state {
            SlotState::Empty if slot.load.try_lock().is_err() => ModelStatus::Loading,
            SlotState::Empty => ModelStatus::NotLoaded,
            SlotState::Ready(_) => ModelStatus::Ready,
            SlotState::Failed(err) => ModelStatus::Failed(err.to_string()),
        }
    }

    /// Get status of all registered models
    pub fn get_status(&self) -> Vec<(&'static str, ModelStatus)> {
        registry::all_configs()
            .iter()
            .map(|config| (config.id, self.status(config.id)))
            .collect()
    }

    /// Run inference against a loaded model
    pub async fn run(&self, model_id: &str, inputs: NamedTensors) -> Result<NamedTensors> {
        self.handle(model_id)?.run(inputs).await
    }

    /// Drop a model's session. Outstanding handles keep it alive until released.
    pub async fn dispose(&self, model_id: &str) {
        let Some(slot) = self.existing_slot(model_id) else {
            return;
        };
        let _load = slot.load.lock().await;
        {
            let mut slots = self.slots.lock();
            if slots.get(model_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(model_id);
            }
        }
        let mut state = slot.state.write();
        if matches!(*state, SlotState::Ready(_)) {
            info!("Disposing model: {}", model_id);
        }
        *state = SlotState::Empty;
    }
}

/// One inference on zeroed input so the first real call doesn't pay setup costs
fn warm_up(config: &'static ModelConfig, session: &dyn InferenceSession) {
    let inputs = NamedTensors::single(config.input_name, Tensor::zeros(config.input_shape()));
    let start = Instant::now();
    match session.run(&inputs) {
        Ok(_) => debug!("Model {} warm-up done in {:?}", config.id, start.elapsed()),
        Err(e) => warn!("Model {} warm-up failed: {}", config.id, e),
    }
}
