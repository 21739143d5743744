/// Configuration loading from runbox.json
use crate::config::types::{LauncherError, ResourceLimits, Result, DEFAULT_TIMEOUT_MS};
use crate::utils::output::OutputLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RUNBOX_CONFIG";

/// One row of the runtime -> image table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEntry {
    /// Canonical runtime identifier (e.g. "java17")
    pub id: String,
    /// Image reference, `repository[:tag]` or `repository@digest`
    pub image: String,
    /// Alternative identifiers accepted by the resolver
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Base image the runtime image was built from (informational)
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Defaults applied to every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub limits: ResourceLimits,
    pub timeout_ms: u64,
    /// Time between the cooperative stop signal and the hard kill
    pub grace_ms: u64,
    /// Identity the command runs as inside the container
    pub user: String,
    /// Working directory inside the container
    pub workdir: String,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            grace_ms: 2_000,
            user: "runner".to_string(),
            workdir: "/app".to_string(),
        }
    }
}

/// Which container runtime backs the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local docker daemon
    Docker,
    /// Remote daemon driven through `docker --host`
    Remote,
    /// Plain host process without container isolation
    Host,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Container CLI binary
    pub docker_binary: String,
    /// Daemon endpoint for the remote backend (e.g. "tcp://builder:2376")
    pub host: Option<String>,
    /// Pull images that are not present locally before spawning
    pub pull_missing: bool,
    /// Permit the host backend (no container isolation)
    pub allow_degraded: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Docker,
            docker_binary: "docker".to_string(),
            host: None,
            pull_missing: true,
            allow_degraded: false,
        }
    }
}

/// Full runbox.json structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub runtimes: Vec<RuntimeEntry>,
    pub defaults: RunDefaults,
    pub backend: BackendConfig,
    pub output: OutputLimits,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            runtimes: default_runtimes(),
            defaults: RunDefaults::default(),
            backend: BackendConfig::default(),
            output: OutputLimits::default(),
        }
    }
}

/// Runtime images built from the `code-runner-*` Dockerfiles.
pub fn default_runtimes() -> Vec<RuntimeEntry> {
    vec![
        RuntimeEntry {
            id: "java17".to_string(),
            image: "code-runner-java:17".to_string(),
            aliases: vec!["java".to_string()],
            base_image: Some("eclipse-temurin:17-jdk".to_string()),
            description: Some("Java 17 (Temurin JDK)".to_string()),
        },
        RuntimeEntry {
            id: "python".to_string(),
            image: "code-runner-python:3.11".to_string(),
            aliases: vec!["py".to_string(), "python3".to_string()],
            base_image: Some("python:3.11-alpine".to_string()),
            description: Some("Python 3.11".to_string()),
        },
        RuntimeEntry {
            id: "javascript".to_string(),
            image: "code-runner-javascript:20".to_string(),
            aliases: vec!["js".to_string(), "node".to_string()],
            base_image: Some("node:20-alpine".to_string()),
            description: Some("Node.js 20".to_string()),
        },
    ]
}

impl LauncherConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LauncherError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: LauncherConfig = serde_json::from_str(&content)
            .map_err(|e| LauncherError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        log::info!("Loaded launcher config from {}", path.display());
        Ok(config)
    }

    /// `$RUNBOX_CONFIG`, then `./runbox.json`, then built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from_file(PathBuf::from(path));
        }

        let local = std::env::current_dir()
            .map_err(|e| LauncherError::Config(format!("Failed to get current directory: {}", e)))?
            .join("runbox.json");
        if local.exists() {
            return Self::load_from_file(local);
        }

        log::debug!("No runbox.json found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtimes.is_empty() {
            return Err(LauncherError::Config("runtime table is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &self.runtimes {
            if entry.image.trim().is_empty() {
                return Err(LauncherError::Config(format!(
                    "runtime '{}' has no image",
                    entry.id
                )));
            }
            for name in std::iter::once(&entry.id).chain(entry.aliases.iter()) {
                let key = name.trim().to_ascii_lowercase();
                if key.is_empty() {
                    return Err(LauncherError::Config("empty runtime identifier".to_string()));
                }
                if !seen.insert(key) {
                    return Err(LauncherError::Config(format!(
                        "runtime identifier '{}' is declared twice",
                        name
                    )));
                }
            }
        }

        self.defaults
            .limits
            .validate()
            .map_err(|e| LauncherError::Config(format!("default limits: {}", e)))?;
        if self.defaults.timeout_ms == 0 {
            return Err(LauncherError::Config("default timeout must be positive".to_string()));
        }
        if !self.defaults.workdir.starts_with('/') {
            return Err(LauncherError::Config(format!(
                "workdir must be absolute: {}",
                self.defaults.workdir
            )));
        }
        crate::kernel::credentials::UnprivilegedUser::parse(&self.defaults.user)
            .map_err(|e| LauncherError::Config(format!("default user: {}", e)))?;

        if self.backend.kind == BackendKind::Remote && self.backend.host.is_none() {
            return Err(LauncherError::Config(
                "remote backend requires a daemon host".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Host && !self.backend.allow_degraded {
            return Err(LauncherError::Config(
                "host backend runs without container isolation; set allow_degraded to use it"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
