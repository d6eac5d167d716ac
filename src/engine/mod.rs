//! Inference engine module
//!
//! Provides registry-driven inference with:
//! - Deduplicated model loading behind explicit handles
//! - Per-family preprocessing and output decoding
//! - Async execution on the blocking thread pool

pub mod registry;
pub mod tensor;
pub mod types;
pub mod session;
pub mod pool;
pub mod preprocess;
pub mod nms;
pub mod objects;
pub mod segment;
pub mod detector;
pub mod embedder;
pub mod scene;

pub use pool::{ModelHandle, ModelPool, ModelStatus};
pub use session::{InferenceSession, OpenVinoLoader, SessionLoader};
pub use objects::{DecodeOptions, ObjectDetector};
pub use segment::Segmenter;
pub use detector::FaceDetector;
pub use embedder::{FaceEmbedder, FaceEmbedding};
pub use scene::{SceneClassification, SceneClassifier};
pub use types::{BoundingBox, Detection, FaceRegion, SegmentMask};
