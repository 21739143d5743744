//! Docker CLI driver for local and remote daemons.

use super::{ContainerRef, ContainerRuntime, ContainerSpec, SpawnedContainer};
use crate::config::types::{LauncherError, Result};
use crate::kernel::signal::{signal_group, StopSignal};
use crate::runtime::image::ImageRef;
use std::os::unix::process::CommandExt;
use std::process::{Command, Output, Stdio};

/// Exit code `docker run`/`docker start` use for daemon-side failures.
const DOCKER_RUNTIME_ERROR: i32 = 125;

/// Prefix the docker client puts on its own diagnostics
const CLIENT_PREFIX: &str = "docker: ";
const DAEMON_ERROR: &str = "Error response from daemon";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonEndpoint {
    /// Daemon on this host; host paths can be bind-mounted
    Local,
    /// Orchestrator daemon elsewhere; files are copied into the container
    Remote { host: String },
}

#[derive(Clone, Debug)]
pub struct DockerCli {
    binary: String,
    endpoint: DaemonEndpoint,
    pull_missing: bool,
}

impl DockerCli {
    pub fn local(binary: &str, pull_missing: bool) -> Self {
        Self {
            binary: binary.to_string(),
            endpoint: DaemonEndpoint::Local,
            pull_missing,
        }
    }

    pub fn remote(binary: &str, host: &str, pull_missing: bool) -> Self {
        Self {
            binary: binary.to_string(),
            endpoint: DaemonEndpoint::Remote {
                host: host.to_string(),
            },
            pull_missing,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let DaemonEndpoint::Remote { host } = &self.endpoint {
            cmd.arg("--host").arg(host);
        }
        cmd
    }

    fn output(&self, args: &[String]) -> Result<Output> {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                let verb = args.first().map(String::as_str).unwrap_or_default();
                LauncherError::SpawnFailure(format!("{} {}: {}", self.binary, verb, e))
            })
    }

    /// Arguments for `docker run` (local) or `docker create` (remote).
    pub fn container_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = match self.endpoint {
            DaemonEndpoint::Local => vec!["run".into(), "--rm".into(), "-i".into()],
            DaemonEndpoint::Remote { .. } => vec!["create".into(), "-i".into()],
        };

        args.extend(["--name".to_string(), spec.name.clone()]);
        args.extend(["--label".to_string(), format!("runbox.run-id={}", spec.run_id)]);

        let limits = &spec.limits;
        if limits.network_disabled {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        args.extend(["--memory".to_string(), format!("{}m", limits.memory_mb)]);
        // Same value for swap: no swap beyond the memory limit.
        args.extend(["--memory-swap".to_string(), format!("{}m", limits.memory_mb)]);
        args.extend(["--cpus".to_string(), limits.cpus.to_string()]);
        args.extend(["--pids-limit".to_string(), limits.pids_limit.to_string()]);

        args.extend(["--user".to_string(), spec.user.as_docker_arg()]);
        args.extend(["--workdir".to_string(), spec.workdir.clone()]);
        args.extend(["--cap-drop".to_string(), "ALL".to_string()]);
        args.extend([
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
        ]);

        for (key, value) in &spec.environment {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }

        if let (DaemonEndpoint::Local, Some(mount)) = (&self.endpoint, &spec.mount) {
            let mut volume = format!(
                "{}:{}",
                mount.host_path.display(),
                mount.container_path.display()
            );
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.extend(["-v".to_string(), volume]);
        }

        args.push(spec.image.to_string());
        args.extend(spec.argv.iter().cloned());
        args
    }

    fn spawn_attached(&self, args: &[String]) -> Result<SpawnedContainer> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            LauncherError::SpawnFailure(format!("failed to start {}: {}", self.binary, e))
        })?;
        let pgid = child.id() as i32;
        Ok(SpawnedContainer {
            container: ContainerRef {
                // Filled in by the caller
                id: String::new(),
                pgid,
            },
            child,
        })
    }

    fn spawn_remote(&self, spec: &ContainerSpec) -> Result<SpawnedContainer> {
        let create = self.output(&self.container_args(spec))?;
        if !create.status.success() {
            return Err(LauncherError::SpawnFailure(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&create.stderr).trim()
            )));
        }

        if let Some(mount) = &spec.mount {
            let copy = self.output(&[
                "cp".to_string(),
                format!("{}/.", mount.host_path.display()),
                format!("{}:{}", spec.name, mount.container_path.display()),
            ]);
            let failure = match copy {
                Ok(out) if out.status.success() => None,
                Ok(out) => Some(String::from_utf8_lossy(&out.stderr).trim().to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                self.force_remove(&spec.name);
                return Err(LauncherError::SpawnFailure(format!(
                    "copying workspace into {} failed: {}",
                    spec.name, reason
                )));
            }
        }

        let attach = vec![
            "start".to_string(),
            "-a".to_string(),
            "-i".to_string(),
            spec.name.clone(),
        ];
        self.spawn_attached(&attach).map_err(|e| {
            self.force_remove(&spec.name);
            e
        })
    }

    fn force_remove(&self, name: &str) {
        let args = ["rm".to_string(), "-f".to_string(), name.to_string()];
        match self.output(&args) {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.contains("No such container") {
                    log::warn!("docker rm -f {} failed: {}", name, stderr.trim());
                }
            }
            Err(e) => log::warn!("docker rm -f {} failed: {}", name, e),
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn backend_name(&self) -> &'static str {
        match self.endpoint {
            DaemonEndpoint::Local => "docker",
            DaemonEndpoint::Remote { .. } => "docker-remote",
        }
    }

    fn ensure_image(&self, image: &ImageRef) -> Result<()> {
        let reference = image.to_string();
        let inspect = self.output(&[
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            reference.clone(),
        ])?;
        if inspect.status.success() {
            return Ok(());
        }

        if !self.pull_missing {
            return Err(LauncherError::SpawnFailure(format!(
                "image {} is not present and pulling is disabled",
                reference
            )));
        }

        log::info!("Pulling image {}", reference);
        let pull = self.output(&["pull".to_string(), reference.clone()])?;
        if !pull.status.success() {
            return Err(LauncherError::SpawnFailure(format!(
                "image pull failed for {}: {}",
                reference,
                String::from_utf8_lossy(&pull.stderr).trim()
            )));
        }
        Ok(())
    }

    fn spawn(&self, spec: &ContainerSpec) -> Result<SpawnedContainer> {
        let mut spawned = match self.endpoint {
            DaemonEndpoint::Local => self.spawn_attached(&self.container_args(spec))?,
            DaemonEndpoint::Remote { .. } => self.spawn_remote(spec)?,
        };
        spawned.container.id = spec.name.clone();
        log::debug!(
            "Started container {} via {} (client pid {})",
            spec.name,
            self.backend_name(),
            spawned.container.pgid
        );
        Ok(spawned)
    }

    fn stop(&self, container: &ContainerRef, signal: StopSignal) -> Result<()> {
        let args = [
            "kill".to_string(),
            "--signal".to_string(),
            signal.docker_name().to_string(),
            container.id.clone(),
        ];
        match self.output(&args) {
            Ok(out) if !out.status.success() => log::debug!(
                "docker kill {} ({}): {}",
                container.id,
                signal.docker_name(),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Ok(_) => {}
            Err(e) => log::warn!("docker kill {} failed: {}", container.id, e),
        }
        // The attached client may outlive the container; take its group down too.
        signal_group(container.pgid, signal)
    }

    fn remove(&self, container: &ContainerRef) -> Result<()> {
        self.force_remove(&container.id);
        Ok(())
    }

    fn runtime_failure(&self, exit_code: i32, stderr: &str) -> Option<String> {
        if exit_code != DOCKER_RUNTIME_ERROR {
            return None;
        }
        // A workload may exit 125 on its own; only the client's own diagnostics count.
        let detail = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| line.starts_with(CLIENT_PREFIX) || line.contains(DAEMON_ERROR))?;
        Some(format!("container runtime error: {}", detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Mount, ResourceLimits};
    use crate::kernel::credentials::UnprivilegedUser;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn spec(mount: Option<Mount>) -> ContainerSpec {
        ContainerSpec {
            name: "runbox-test".to_string(),
            run_id: "test".to_string(),
            image: ImageRef::parse("code-runner-python:3.11").unwrap(),
            argv: vec!["python3".to_string(), "/app/main.py".to_string()],
            limits: ResourceLimits::default(),
            workdir: "/app".to_string(),
            user: UnprivilegedUser::parse("runner").unwrap(),
            environment: vec![("LANG".to_string(), "C.UTF-8".to_string())],
            mount,
        }
    }

    fn workspace_mount() -> Mount {
        Mount {
            host_path: PathBuf::from("/tmp/runbox/abc"),
            container_path: PathBuf::from("/app"),
            read_only: true,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn local_run_args_carry_isolation_flags() {
        let cli = DockerCli::local("docker", true);
        let args = cli.container_args(&spec(Some(workspace_mount())));

        assert_eq!(&args[..3], &["run", "--rm", "-i"]);
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--memory", "256m"));
        assert!(has_pair(&args, "--memory-swap", "256m"));
        assert!(has_pair(&args, "--cpus", "0.5"));
        assert!(has_pair(&args, "--pids-limit", "64"));
        assert!(has_pair(&args, "--user", "runner"));
        assert!(has_pair(&args, "--workdir", "/app"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "-e", "LANG=C.UTF-8"));
        assert!(has_pair(&args, "-v", "/tmp/runbox/abc:/app:ro"));
    }

    #[test]
    fn image_precedes_the_command() {
        let cli = DockerCli::local("docker", true);
        let args = cli.container_args(&spec(None));
        let image_at = args
            .iter()
            .position(|a| a == "code-runner-python:3.11")
            .unwrap();
        assert_eq!(&args[image_at + 1..], &["python3", "/app/main.py"]);
    }

    #[test]
    fn network_flag_is_omitted_when_allowed() {
        let cli = DockerCli::local("docker", true);
        let mut s = spec(None);
        s.limits.network_disabled = false;
        let args = cli.container_args(&s);
        assert!(!args.iter().any(|a| a == "--network"));
    }

    #[test]
    fn remote_create_never_bind_mounts() {
        let cli = DockerCli::remote("docker", "tcp://10.0.0.5:2376", true);
        let args = cli.container_args(&spec(Some(workspace_mount())));
        assert_eq!(&args[..2], &["create", "-i"]);
        assert!(!args.iter().any(|a| a == "-v" || a == "--rm"));
        assert_eq!(cli.backend_name(), "docker-remote");
    }

    #[test]
    fn missing_cli_binary_is_a_spawn_failure() {
        let cli = DockerCli::local("/nonexistent/runbox-docker", false);
        let image = ImageRef::parse("code-runner-python:3.11").unwrap();
        assert!(matches!(
            cli.ensure_image(&image),
            Err(LauncherError::SpawnFailure(_))
        ));
        assert!(matches!(
            cli.spawn(&spec(None)),
            Err(LauncherError::SpawnFailure(_))
        ));
    }

    #[test]
    fn only_daemon_exit_code_is_a_runtime_failure() {
        let cli = DockerCli::local("docker", true);
        let reason = cli
            .runtime_failure(
                125,
                "Unable to find image 'x:1' locally\ndocker: Error response from daemon: pull access denied for x.\n",
            )
            .unwrap();
        assert!(reason.contains("pull access denied"));
        assert!(cli
            .runtime_failure(125, "Error response from daemon: No such container: runbox-x\n")
            .is_some());
        assert!(cli.runtime_failure(1, "whatever").is_none());
        assert!(cli.runtime_failure(127, "sh: nope: not found").is_none());
    }

    #[test]
    fn workload_exiting_125_is_not_a_runtime_failure() {
        let cli = DockerCli::local("docker", true);
        assert!(cli.runtime_failure(125, "app: bad config\n").is_none());
        assert!(cli.runtime_failure(125, "").is_none());
    }

    /// Fake docker client that appends its arguments to `calls.log` and fails
    /// `cp` with `cp_status`.
    fn stub_docker(cp_status: i32) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("runbox_docker_stub_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let log = dir.join("calls.log");
        let script = dir.join("docker");
        let body = format!(
            concat!(
                "#!/bin/sh\n",
                "echo \"$*\" >> '{log}'\n",
                "case \"$3\" in\n",
                "cp) [ {cp} -eq 0 ] || {{ echo 'Error: No such container:path' >&2; exit {cp}; }} ;;\n",
                "start) echo attached ;;\n",
                "esac\n",
                "exit 0\n",
            ),
            log = log.display(),
            cp = cp_status
        );
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    const HOST: &str = "--host tcp://10.0.0.5:2376";

    #[test]
    fn remote_spawn_creates_copies_then_attaches() {
        let (script, log) = stub_docker(0);
        let cli = DockerCli::remote(script.to_str().unwrap(), "tcp://10.0.0.5:2376", false);
        let spawned = cli.spawn(&spec(Some(workspace_mount()))).unwrap();
        assert_eq!(spawned.container.id, "runbox-test");

        let out = spawned.child.wait_with_output().unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout), "attached\n");

        let calls = calls(&log);
        assert_eq!(calls.len(), 3, "{calls:?}");
        assert!(calls[0].starts_with(&format!("{HOST} create -i --name runbox-test")));
        assert_eq!(calls[1], format!("{HOST} cp /tmp/runbox/abc/. runbox-test:/app"));
        assert_eq!(calls[2], format!("{HOST} start -a -i runbox-test"));
        let _ = fs::remove_dir_all(script.parent().unwrap());
    }

    #[test]
    fn failed_copy_removes_the_created_container() {
        let (script, log) = stub_docker(1);
        let cli = DockerCli::remote(script.to_str().unwrap(), "tcp://10.0.0.5:2376", false);
        match cli.spawn(&spec(Some(workspace_mount()))) {
            Err(LauncherError::SpawnFailure(message)) => {
                assert!(message.contains("copying workspace into runbox-test failed"), "{message}");
                assert!(message.contains("No such container"), "{message}");
            }
            other => panic!("expected SpawnFailure, got {:?}", other.map(|s| s.container)),
        }

        let calls = calls(&log);
        assert_eq!(calls.len(), 3, "{calls:?}");
        assert!(calls[0].starts_with(&format!("{HOST} create -i")));
        assert!(calls[1].starts_with(&format!("{HOST} cp ")));
        assert_eq!(calls[2], format!("{HOST} rm -f runbox-test"));
        let _ = fs::remove_dir_all(script.parent().unwrap());
    }
}
