//! Lifecycle supervision of one running container.
//!
//! One supervisor thread per run blocks on whichever comes first: container
//! exit, the watchdog deadline or a cancellation. The winner is recorded once in
//! an [`OutcomeLatch`]; stop escalation, output collection and teardown follow.

pub mod latch;
pub mod monitor;
pub mod state;

pub use latch::{OutcomeLatch, StopCause};
pub use monitor::{spawn_supervisor, Supervision};
pub use state::{ContainerHandle, ContainerState};
