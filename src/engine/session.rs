//! Inference sessions
//!
//! `InferenceSession` is the seam between decoders and the runtime. The
//! OpenVINO implementation lives here; tests inject their own sessions.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use openvino::{CompiledModel, Core, ElementType, Shape, Tensor as OvTensor};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::registry::ModelConfig;
use super::tensor::{NamedTensors, Tensor};
use crate::error::{Result, VisionError};

/// A loaded model. `run` must not mutate shared state.
pub trait InferenceSession: Send + Sync {
    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors>;
}

/// Creates sessions from model files
pub trait SessionLoader: Send + Sync {
    fn load(&self, path: &Path, config: &'static ModelConfig) -> Result<Arc<dyn InferenceSession>>;
}

/// Wrapper for OpenVINO Core that implements Send
struct SafeCore(Core);
unsafe impl Send for SafeCore {}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
/// Request creation needs `&mut`, so it goes through the mutex.
struct SafeCompiledModel(Mutex<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

/// Loads models through a shared OpenVINO core
pub struct OpenVinoLoader {
    core: Mutex<SafeCore>,
    device: String,
}

impl OpenVinoLoader {
    pub fn new(device: &str) -> Result<Self> {
        let core = Core::new().map_err(|e| VisionError::inference(format!("OpenVINO init: {}", e)))?;
        Ok(Self {
            core: Mutex::new(SafeCore(core)),
            device: device.to_string(),
        })
    }
}

impl SessionLoader for OpenVinoLoader {
    fn load(&self, path: &Path, config: &'static ModelConfig) -> Result<Arc<dyn InferenceSession>> {
        if !path.exists() {
            return Err(VisionError::unavailable(
                config.id,
                format!("model file not found: {}", path.display()),
            ));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| VisionError::unavailable(config.id, "model path is not valid UTF-8"))?;

        info!("Compiling model {} from {} on {}", config.id, path_str, self.device);
        let start = Instant::now();

        let compiled = {
            let mut core = self.core.lock();
            let model = core
                .0
                .read_model_from_file(path_str, "")
                .map_err(|e| VisionError::unavailable(config.id, e))?;
            core.0
                .compile_model(&model, self.device.as_str().into())
                .map_err(|e| VisionError::unavailable(config.id, e))?
        };

        let output_count = compiled
            .get_output_size()
            .map_err(|e| VisionError::unavailable(config.id, e))?;
        let mut output_names = Vec::with_capacity(output_count);
        for i in 0..output_count {
            let name = compiled
                .get_output_by_index(i)
                .and_then(|node| node.get_name())
                .unwrap_or_else(|_| format!("output{}", i));
            output_names.push(name);
        }

        info!(
            "Model {} compiled in {:?} ({} outputs: {:?})",
            config.id,
            start.elapsed(),
            output_count,
            output_names
        );

        Ok(Arc::new(OpenVinoSession {
            model_id: config.id,
            compiled: SafeCompiledModel(Mutex::new(compiled)),
            output_names,
        }))
    }
}

/// A compiled OpenVINO model
pub struct OpenVinoSession {
    model_id: &'static str,
    compiled: SafeCompiledModel,
    output_names: Vec<String>,
}

impl OpenVinoSession {
    fn to_ov_tensor(tensor: &Tensor) -> Result<OvTensor> {
        let dims: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
        let shape = Shape::new(&dims).map_err(VisionError::inference)?;
        let mut ov = OvTensor::new(ElementType::F32, &shape).map_err(VisionError::inference)?;
        ov.get_data_mut::<f32>()
            .map_err(VisionError::inference)?
            .copy_from_slice(tensor.data());
        Ok(ov)
    }

    fn from_ov_tensor(ov: &OvTensor) -> Result<Tensor> {
        let shape: Vec<usize> = ov
            .get_shape()
            .map_err(VisionError::inference)?
            .get_dimensions()
            .iter()
            .map(|&d| d as usize)
            .collect();

        // Integer outputs (class labels) are widened to f32
        let data: Vec<f32> = match ov.get_element_type().map_err(VisionError::inference)? {
            ElementType::I64 => ov
                .get_data::<i64>()
                .map_err(VisionError::inference)?
                .iter()
                .map(|&v| v as f32)
                .collect(),
            ElementType::I32 => ov
                .get_data::<i32>()
                .map_err(VisionError::inference)?
                .iter()
                .map(|&v| v as f32)
                .collect(),
            _ => ov.get_data::<f32>().map_err(VisionError::inference)?.to_vec(),
        };

        Tensor::new(shape, data)
    }
}

impl InferenceSession for OpenVinoSession {
    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors> {
        let mut request = self
            .compiled
            .0
            .lock()
            .create_infer_request()
            .map_err(VisionError::inference)?;

        for (name, tensor) in inputs.iter() {
            let ov = Self::to_ov_tensor(tensor)?;
            if inputs.len() == 1 {
                request.set_input_tensor(&ov).map_err(VisionError::inference)?;
            } else {
                request.set_tensor(name, &ov).map_err(VisionError::inference)?;
            }
        }

        request.infer().map_err(VisionError::inference)?;

        let mut outputs = NamedTensors::new();
        for (i, name) in self.output_names.iter().enumerate() {
            let ov = request
                .get_output_tensor_by_index(i)
                .map_err(VisionError::inference)?;
            let tensor = Self::from_ov_tensor(&ov)?;
            debug!("{} output {} shape {:?}", self.model_id, name, tensor.shape());
            outputs.push(name.clone(), tensor);
        }

        Ok(outputs)
    }
}
