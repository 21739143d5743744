//! Container spawners.
//!
//! The supervisor only talks to [`ContainerRuntime`]. Variants:
//! - [`docker::DockerCli`] against a local daemon (bind-mounted workspace)
//! - [`docker::DockerCli`] against a remote orchestrator daemon (workspace copied in)
//! - [`host::HostProcess`], degraded execution without container isolation

pub mod docker;
pub mod host;

use crate::config::loader::{BackendConfig, BackendKind};
use crate::config::types::{LauncherError, Mount, ResourceLimits, Result};
use crate::kernel::credentials::UnprivilegedUser;
use crate::kernel::signal::StopSignal;
use crate::runtime::image::ImageRef;
use std::process::Child;
use std::sync::Arc;

/// Everything needed to instantiate one container
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    /// Unique container name, `runbox-<run_id>`
    pub name: String,
    pub run_id: String,
    pub image: ImageRef,
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub limits: ResourceLimits,
    pub workdir: String,
    pub user: UnprivilegedUser,
    pub environment: Vec<(String, String)>,
    pub mount: Option<Mount>,
}

impl ContainerSpec {
    pub fn container_name(run_id: &str) -> String {
        format!("runbox-{}", run_id)
    }
}

/// Reference the supervisor keeps to stop a running container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    /// Process group of the attached client (or of the workload itself on the host)
    pub pgid: i32,
}

/// A started container with its attached stdio
#[derive(Debug)]
pub struct SpawnedContainer {
    pub container: ContainerRef,
    /// Attached client process; stdin/stdout/stderr are piped
    pub child: Child,
}

pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;

    /// Make sure the image can be instantiated (pull if missing).
    fn ensure_image(&self, _image: &ImageRef) -> Result<()> {
        Ok(())
    }

    /// Create and start the container. Errors are spawn failures.
    fn spawn(&self, spec: &ContainerSpec) -> Result<SpawnedContainer>;

    /// Deliver a stop signal to the container and its client process group.
    fn stop(&self, container: &ContainerRef, signal: StopSignal) -> Result<()>;

    /// Remove any leftovers of the container. Idempotent.
    fn remove(&self, _container: &ContainerRef) -> Result<()> {
        Ok(())
    }

    /// Explain an exit code that belongs to the runtime rather than the workload.
    fn runtime_failure(&self, _exit_code: i32, _stderr: &str) -> Option<String> {
        None
    }

    /// Whether the backend provides container isolation
    fn isolated(&self) -> bool {
        true
    }
}

/// Build the backend selected in the configuration.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn ContainerRuntime>> {
    match config.kind {
        BackendKind::Docker => Ok(Arc::new(docker::DockerCli::local(
            &config.docker_binary,
            config.pull_missing,
        ))),
        BackendKind::Remote => {
            let host = config.host.as_deref().ok_or_else(|| {
                LauncherError::Config("remote backend requires a daemon host".to_string())
            })?;
            Ok(Arc::new(docker::DockerCli::remote(
                &config.docker_binary,
                host,
                config.pull_missing,
            )))
        }
        BackendKind::Host => {
            if !config.allow_degraded {
                return Err(LauncherError::Config(
                    "host backend runs without container isolation; enable allow_degraded"
                        .to_string(),
                ));
            }
            log::warn!("Using host backend: commands run without container isolation");
            Ok(Arc::new(host::HostProcess::new()))
        }
    }
}
