//! Safety and cleanup
//!
//! Run-scoped workspaces that never outlive their run.

pub mod workspace;
