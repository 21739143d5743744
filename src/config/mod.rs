//! Configuration
//!
//! Launcher configuration file, request/result types and the error model.

pub mod loader;
pub mod types;
