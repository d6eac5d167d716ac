//! On-device vision pipeline: object detection, instance segmentation,
//! face detection, embedding and identity matching.

pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{Result, VisionError};
