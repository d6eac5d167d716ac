//! Storage module for face descriptor persistence

pub mod traits;
pub mod json;

pub use traits::{DescriptorStore, StoredDescriptor};
pub use json::JsonFileStore;
