//! Storage abstraction traits
//!
//! Defines the interface for face descriptor persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use anyhow::Result;

/// A known identity with one or more reference descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDescriptor {
    pub identity_id: String,
    pub identity_name: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Every vector takes part in nearest-neighbor search
    pub embeddings: Vec<Vec<f32>>,
    /// Where the descriptors came from, e.g. "arcface" or "legacy"
    #[serde(default = "default_source_type")]
    pub source_type: String,
}

fn default_source_type() -> String {
    "arcface".to_string()
}

impl StoredDescriptor {
    pub fn new(identity_id: impl Into<String>, identity_name: impl Into<String>, embeddings: Vec<Vec<f32>>) -> Self {
        Self {
            identity_id: identity_id.into(),
            identity_name: identity_name.into(),
            team: None,
            role: None,
            embeddings,
            source_type: default_source_type(),
        }
    }
}

/// Descriptor storage trait
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait DescriptorStore: Send + Sync + 'static {
    /// Load every stored identity
    async fn load_descriptors(&self) -> Result<Vec<StoredDescriptor>>;

    /// Replace the stored gallery
    async fn save_descriptors(&self, descriptors: &[StoredDescriptor]) -> Result<()>;
}
