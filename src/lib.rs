//! runbox: run untrusted commands inside per-run runtime containers
//!
//! A caller names a runtime (e.g. `java17`) and a command. The launcher
//! resolves the runtime to a container image, starts a fresh resource-limited
//! container, supervises it under a wall-clock deadline and delivers exactly one
//! [`RunResult`] per accepted request, with the output streamed live on the way.
//!
//! # Architecture
//!
//! ## Runtime table ([`runtime`])
//! - [`runtime::image`]: Validated container image references
//! - [`runtime::registry`]: Immutable runtime id -> image table
//!
//! ## Container backends ([`backend`])
//! - [`backend::docker`]: Local and remote docker daemons via the docker CLI
//! - [`backend::host`]: Degraded host-process backend (no isolation, opt-in)
//!
//! ## Lifecycle ([`supervisor`], [`launcher`], [`channel`])
//! - [`supervisor::monitor`]: Exit / deadline / cancel race, stop escalation
//! - [`supervisor::state`]: Container state machine
//! - [`supervisor::latch`]: First-writer-wins outcome record
//! - [`channel`]: Ordered output chunks followed by one final result
//! - [`launcher`]: Submission, tickets and cancellation
//!
//! ## Kernel primitives ([`kernel`])
//! - [`kernel::credentials`]: Unprivileged run identity
//! - [`kernel::signal`]: Stop signals and process-group delivery
//!
//! ## Judging ([`judge`], [`safety`])
//! - [`judge`]: Language harnesses and test case evaluation
//! - [`safety::workspace`]: Run-scoped source directories
//!
//! ## Ambient
//! - [`config`]: Launcher configuration, request and result types, errors
//! - [`observability::audit`]: Structured audit events
//! - [`utils::output`]: Bounded output capture

pub mod backend;
pub mod channel;
pub mod cli;
pub mod config;
pub mod judge;
pub mod kernel;
pub mod launcher;
pub mod observability;
pub mod runtime;
pub mod safety;
pub mod supervisor;
pub mod utils;

pub use channel::{OutputEvent, ResultStream};
pub use config::loader::LauncherConfig;
pub use config::types::*;
pub use launcher::{CancelHandle, Launcher, RunTicket};
