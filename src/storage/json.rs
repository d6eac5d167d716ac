//! JSON file descriptor store

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::traits::{DescriptorStore, StoredDescriptor};

/// Gallery kept as a single JSON array on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DescriptorStore for JsonFileStore {
    async fn load_descriptors(&self) -> Result<Vec<StoredDescriptor>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("No descriptor file at {:?}, starting with an empty gallery", self.path);
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let descriptors: Vec<StoredDescriptor> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid descriptor file {:?}", self.path))?;

        debug!("Loaded {} identities from {:?}", descriptors.len(), self.path);
        Ok(descriptors)
    }

    async fn save_descriptors(&self, descriptors: &[StoredDescriptor]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(descriptors)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {:?}", self.path))?;

        info!("Saved {} identities to {:?}", descriptors.len(), self.path);
        Ok(())
    }
}
