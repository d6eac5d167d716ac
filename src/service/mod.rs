//! Service layer module

pub mod matcher;
pub mod types;
pub mod vision_service;

pub use matcher::{FaceMatcher, MatchContext, MatchResult};
pub use vision_service::{ConfigModelLocator, ModelLocator, VisionService};
pub use types::*;
