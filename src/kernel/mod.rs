//! Thin wrappers around kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod credentials;
pub mod signal;
