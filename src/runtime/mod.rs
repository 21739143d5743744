//! Runtime identifiers and the images that provide them.

pub mod image;
pub mod registry;
