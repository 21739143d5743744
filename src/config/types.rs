/// Core types and structures for the runbox launcher
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default wall-clock budget for a run when the caller does not supply one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Resource limits applied to a single container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in MB (swap is pinned to the same value)
    pub memory_mb: u64,
    /// CPU quota in fractional cores
    pub cpus: f64,
    /// Maximum number of processes/threads inside the container
    pub pids_limit: u32,
    /// Run without any network interface
    pub network_disabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpus: 0.5,
            pids_limit: 64,
            network_disabled: true,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(LauncherError::InvalidRequest(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err(LauncherError::InvalidRequest(format!(
                "cpu quota must be a positive number, got {}",
                self.cpus
            )));
        }
        if self.pids_limit == 0 {
            return Err(LauncherError::InvalidRequest(
                "pids limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Host directory exposed inside the container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Source directory on the host
    pub host_path: PathBuf,
    /// Target path inside the container
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// A single execution request.
///
/// Fields are private: once built, a request cannot be altered. It carries no
/// identity of its own; every submission gets a fresh run id, so a cloned
/// request submitted twice makes two independent runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    runtime_id: String,
    command: String,
    args: Vec<String>,
    resource_limits: ResourceLimits,
    timeout: Duration,
    stdin: Option<String>,
    environment: Vec<(String, String)>,
    mount: Option<Mount>,
}

impl RunRequest {
    pub fn builder(runtime_id: impl Into<String>, command: impl Into<String>) -> RunRequestBuilder {
        RunRequestBuilder {
            runtime_id: runtime_id.into(),
            command: command.into(),
            args: Vec::new(),
            resource_limits: ResourceLimits::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stdin: None,
            environment: Vec::new(),
            mount: None,
        }
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.resource_limits
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    pub fn mount(&self) -> Option<&Mount> {
        self.mount.as_ref()
    }
}

/// Builder for [`RunRequest`]. Validation happens in [`RunRequestBuilder::build`].
#[derive(Clone, Debug)]
pub struct RunRequestBuilder {
    runtime_id: String,
    command: String,
    args: Vec<String>,
    resource_limits: ResourceLimits,
    timeout: Duration,
    stdin: Option<String>,
    environment: Vec<(String, String)>,
    mount: Option<Mount>,
}

impl RunRequestBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mount = Some(mount);
        self
    }

    pub fn build(self) -> Result<RunRequest> {
        if self.runtime_id.trim().is_empty() {
            return Err(LauncherError::InvalidRequest("empty runtime id".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(LauncherError::InvalidRequest("empty command".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(LauncherError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }
        self.resource_limits.validate()?;
        for (key, _) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(LauncherError::InvalidRequest(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }
        if let Some(mount) = &self.mount {
            if !mount.container_path.is_absolute() {
                return Err(LauncherError::InvalidRequest(format!(
                    "mount target must be absolute: {}",
                    mount.container_path.display()
                )));
            }
        }

        Ok(RunRequest {
            runtime_id: self.runtime_id,
            command: self.command,
            args: self.args,
            resource_limits: self.resource_limits,
            timeout: self.timeout,
            stdin: self.stdin,
            environment: self.environment,
            mount: self.mount,
        })
    }
}

/// Terminal state of a run
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    /// Process exited on its own (any exit code)
    #[serde(rename = "completed")]
    Completed,
    /// Watchdog deadline expired; the container was killed
    #[serde(rename = "timed_out")]
    TimedOut,
    /// Cancelled by the caller; the container was killed
    #[serde(rename = "killed")]
    Killed,
    /// Launcher-side failure during the run
    #[serde(rename = "errored")]
    Errored,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::TimedOut => write!(f, "timed_out"),
            RunStatus::Killed => write!(f, "killed"),
            RunStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Final outcome of one run. Produced exactly once per request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Exit code of the process (if it exited normally)
    pub exit_code: Option<i32>,
    /// Signal that terminated the process (if any)
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall clock time from start until the exit was observed (or the stop
    /// sequence gave up)
    pub duration_ms: u64,
    /// Output is incomplete: a stream hit its capture limit or collection was
    /// cut short
    pub truncated: bool,
    pub error_message: Option<String>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed && self.exit_code == Some(0)
    }

    /// Map the terminal state onto the launcher error kinds.
    pub fn into_result(self) -> Result<RunResult> {
        match self.status {
            RunStatus::Completed => match (self.exit_code, self.signal) {
                (Some(0), _) => Ok(self),
                (Some(code), _) => Err(LauncherError::NonZeroExit {
                    code,
                    stderr: self.stderr,
                }),
                (None, Some(sig)) => Err(LauncherError::NonZeroExit {
                    code: 128 + sig,
                    stderr: self.stderr,
                }),
                (None, None) => Err(LauncherError::InternalError(
                    "process finished without exit status".to_string(),
                )),
            },
            RunStatus::TimedOut => Err(LauncherError::Timeout {
                elapsed_ms: self.duration_ms,
            }),
            RunStatus::Killed => Err(LauncherError::Cancelled),
            RunStatus::Errored => Err(LauncherError::InternalError(
                self.error_message
                    .unwrap_or_else(|| "run failed inside the launcher".to_string()),
            )),
        }
    }
}

/// Custom error types for runbox
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("Spawn failure: {0}")]
    SpawnFailure(String),

    #[error("Run timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Process exited with code {code}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LauncherError {
    /// Process exit code used by the CLI for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LauncherError::UnsupportedRuntime(_) => 64, // usage
            LauncherError::InvalidRequest(_) => 64,
            LauncherError::SpawnFailure(_) => 69, // unavailable
            LauncherError::Timeout { .. } => 124,
            LauncherError::NonZeroExit { code, .. } => *code,
            LauncherError::Cancelled => 130,
            LauncherError::InternalError(_) => 70, // software
            LauncherError::Config(_) => 78,
            LauncherError::Privilege(_) => 77,
            LauncherError::Io(_) => 74,
        }
    }
}

impl From<nix::errno::Errno> for LauncherError {
    fn from(err: nix::errno::Errno) -> Self {
        LauncherError::InternalError(err.to_string())
    }
}

/// Result type alias for runbox operations
pub type Result<T> = std::result::Result<T, LauncherError>;
