use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Why a run stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCause {
    /// The process exited on its own
    Exited,
    /// Watchdog deadline fired first
    TimedOut,
    /// Caller cancelled first
    Cancelled,
    /// The supervisor itself failed
    Failed,
}

/// Write-once cell shared by everything that can end a run.
///
/// The first `record` wins; later ones return `false` and leave the value alone.
#[derive(Debug, Default)]
pub struct OutcomeLatch<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> OutcomeLatch<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns `true` if this call set the value.
    pub fn record(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    pub fn get(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}
