/// Lifecycle audit trail for runbox
/// Every run emits structured events that can be correlated by run id:
/// submission, start, stop escalation, cleanup outcome and final status.
///
/// Events always go to the `log` facade under the `runbox::audit` target. When
/// a file sink is initialised they are additionally appended to it as JSON lines.
use crate::config::types::{LauncherError, Result, RunStatus};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const AUDIT_TARGET: &str = "runbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Lifecycle
    RunSubmitted,
    RunStarted,
    RunFinished,
    SpawnFailed,

    // Isolation
    DegradedBackend,

    // Termination
    GracefulStop,
    ForcedKill,
    OutputTruncated,

    // Failures inside the launcher
    SupervisorPanic,
    CleanupFailure,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RunSubmitted
            | AuditEventType::RunStarted
            | AuditEventType::RunFinished => AuditSeverity::Low,
            AuditEventType::GracefulStop | AuditEventType::OutputTruncated => AuditSeverity::Medium,
            AuditEventType::SpawnFailed
            | AuditEventType::DegradedBackend
            | AuditEventType::ForcedKill => AuditSeverity::High,
            AuditEventType::SupervisorPanic | AuditEventType::CleanupFailure => {
                AuditSeverity::Critical
            }
        }
    }
}

/// Identifiers tying events of one run together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub run_id: String,
    pub runtime_id: String,
    /// Container name once known
    pub container: Option<String>,
    pub backend: Option<String>,
}

impl Correlation {
    pub fn new(run_id: &str, runtime_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            runtime_id: runtime_id.to_string(),
            container: None,
            backend: None,
        }
    }

    pub fn with_container(mut self, container: &str) -> Self {
        self.container = Some(container.to_string());
        self
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Correlation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, correlation: &Correlation, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details,
            correlation: correlation.clone(),
            status: None,
            duration_ms: None,
        }
    }

    pub fn with_status(mut self, status: RunStatus, duration_ms: u64) -> Self {
        self.status = Some(status);
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"serialization_error\":\"{}\"}}",
                self.event_type, e
            )
        })
    }
}

/// Append-only JSON lines file
pub struct AuditLogger {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLogger {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LauncherError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LauncherError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn write(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            error!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

static AUDIT_LOGGER: OnceCell<AuditLogger> = OnceCell::new();

/// Install the file sink. A second call is reported and ignored.
pub fn init_audit_logger(path: &Path) -> Result<()> {
    let logger = AuditLogger::new(path)?;
    if AUDIT_LOGGER.set(logger).is_err() {
        warn!("Audit logger already initialized");
    } else {
        info!("Audit log at {}", path.display());
    }
    Ok(())
}

pub fn record(event: AuditEvent) {
    let line = event.to_json();
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => {
            log::warn!(target: AUDIT_TARGET, "{}", line)
        }
        AuditSeverity::Medium | AuditSeverity::Low => log::info!(target: AUDIT_TARGET, "{}", line),
    }
    if let Some(logger) = AUDIT_LOGGER.get() {
        logger.write(&line);
    }
}

pub fn run_submitted(correlation: &Correlation, image: &str) {
    record(AuditEvent::new(
        AuditEventType::RunSubmitted,
        correlation,
        format!("Run submitted: image={}", image),
    ));
}

pub fn run_started(correlation: &Correlation, pgid: i32) {
    record(AuditEvent::new(
        AuditEventType::RunStarted,
        correlation,
        format!("Run started: process group {}", pgid),
    ));
}

pub fn spawn_failed(correlation: &Correlation, reason: &str) {
    record(AuditEvent::new(
        AuditEventType::SpawnFailed,
        correlation,
        format!("Spawn failed: {}", reason),
    ));
}

pub fn degraded_backend(correlation: &Correlation, backend: &str) {
    record(AuditEvent::new(
        AuditEventType::DegradedBackend,
        correlation,
        format!("Backend '{}' provides no container isolation", backend),
    ));
}

pub fn graceful_stop(correlation: &Correlation, cause: &str) {
    record(AuditEvent::new(
        AuditEventType::GracefulStop,
        correlation,
        format!("SIGTERM sent: {}", cause),
    ));
}

pub fn forced_kill(correlation: &Correlation, reason: &str) {
    record(AuditEvent::new(
        AuditEventType::ForcedKill,
        correlation,
        format!("SIGKILL sent: {}", reason),
    ));
}

pub fn output_truncated(correlation: &Correlation) {
    record(AuditEvent::new(
        AuditEventType::OutputTruncated,
        correlation,
        "Output exceeded capture limit".to_string(),
    ));
}

pub fn supervisor_panic(correlation: &Correlation, message: &str) {
    record(AuditEvent::new(
        AuditEventType::SupervisorPanic,
        correlation,
        format!("Supervisor panicked: {}", message),
    ));
}

pub fn cleanup_failure(correlation: &Correlation, error: &str) {
    record(AuditEvent::new(
        AuditEventType::CleanupFailure,
        correlation,
        format!("Cleanup failed: {}", error),
    ));
}

pub fn run_finished(correlation: &Correlation, status: RunStatus, duration_ms: u64) {
    record(
        AuditEvent::new(
            AuditEventType::RunFinished,
            correlation,
            format!("Run finished: status={}", status),
        )
        .with_status(status, duration_ms),
    );
}
