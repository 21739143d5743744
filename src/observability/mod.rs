//! Observability
//!
//! Structured audit events for operational visibility.

pub mod audit;
