use crate::backend::ContainerRef;
use crate::config::types::{LauncherError, Result, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container lifecycle: `Created -> Running -> terminal`, or `Created -> Errored`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Completed,
    TimedOut,
    Killed,
    Errored,
}

impl ContainerState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContainerState::Created | ContainerState::Running)
    }

    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Errored)
                | (Running, Completed)
                | (Running, TimedOut)
                | (Running, Killed)
                | (Running, Errored)
        )
    }

    pub fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => ContainerState::Completed,
            RunStatus::TimedOut => ContainerState::TimedOut,
            RunStatus::Killed => ContainerState::Killed,
            RunStatus::Errored => ContainerState::Errored,
        }
    }
}

/// Supervisor-owned record of one container
#[derive(Debug)]
pub struct ContainerHandle {
    pub id: String,
    pub runtime_id: String,
    /// Set once the container is running
    pub process_ref: Option<ContainerRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    state: ContainerState,
}

impl ContainerHandle {
    pub fn new(id: &str, runtime_id: &str) -> Self {
        Self {
            id: id.to_string(),
            runtime_id: runtime_id.to_string(),
            process_ref: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: ContainerState::Created,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    fn transition(&mut self, next: ContainerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(LauncherError::InternalError(format!(
                "container {}: illegal transition {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        log::debug!("container {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_running(&mut self, process_ref: ContainerRef) -> Result<()> {
        self.transition(ContainerState::Running)?;
        self.process_ref = Some(process_ref);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.transition(ContainerState::from_status(status))
    }

    pub fn fail_spawn(&mut self) -> Result<()> {
        self.transition(ContainerState::Errored)
    }
}
