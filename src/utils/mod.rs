//! Shared numeric and image helpers

pub mod image;
pub mod math;
