//! Degraded backend: runs the command directly on the host.
//!
//! No image, no namespaces, no resource limits. The workload still gets its
//! own process group, a scrubbed environment and, when the launcher runs as
//! root, the unprivileged identity from the request.

use super::{ContainerRef, ContainerRuntime, ContainerSpec, SpawnedContainer};
use crate::config::types::{LauncherError, Mount, Result};
use crate::kernel::signal::{signal_group, StopSignal};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const HOST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Clone, Debug, Default)]
pub struct HostProcess;

impl HostProcess {
    pub fn new() -> Self {
        Self
    }

    /// Directory the workload starts in.
    fn working_dir(spec: &ContainerSpec) -> PathBuf {
        spec.mount
            .as_ref()
            .and_then(|mount| translate_path(mount, Path::new(&spec.workdir)))
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Map a path under the mount target onto the host directory backing it.
fn translate_path(mount: &Mount, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(&mount.container_path)
        .ok()
        .map(|rest| mount.host_path.join(rest))
}

/// Rewrite argv entries that point into the mounted directory.
pub fn translate_argv(argv: &[String], mount: Option<&Mount>) -> Vec<String> {
    let Some(mount) = mount else {
        return argv.to_vec();
    };
    argv.iter()
        .map(|arg| {
            let path = Path::new(arg);
            if !path.is_absolute() {
                return arg.clone();
            }
            translate_path(mount, path)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg.clone())
        })
        .collect()
}

impl ContainerRuntime for HostProcess {
    fn backend_name(&self) -> &'static str {
        "host"
    }

    fn spawn(&self, spec: &ContainerSpec) -> Result<SpawnedContainer> {
        let argv = translate_argv(&spec.argv, spec.mount.as_ref());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LauncherError::SpawnFailure("empty command".to_string()))?;

        let workdir = Self::working_dir(spec);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&workdir)
            .env_clear()
            .env("PATH", HOST_PATH)
            .env("HOME", &workdir)
            .envs(spec.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if nix::unistd::geteuid().is_root() {
            let (uid, gid) = spec.user.host_ids()?;
            log::debug!("Host run {} drops to uid={} gid={}", spec.run_id, uid, gid);
            cmd.uid(uid).gid(gid);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                LauncherError::SpawnFailure(format!("command not found: {}", program))
            }
            ErrorKind::PermissionDenied => {
                LauncherError::SpawnFailure(format!("command not executable: {}", program))
            }
            _ => LauncherError::SpawnFailure(format!("failed to start {}: {}", program, e)),
        })?;

        Ok(SpawnedContainer {
            container: ContainerRef {
                id: spec.name.clone(),
                pgid: child.id() as i32,
            },
            child,
        })
    }

    fn stop(&self, container: &ContainerRef, signal: StopSignal) -> Result<()> {
        signal_group(container.pgid, signal)
    }

    /// Kill whatever is left in the process group, such as background jobs
    /// that outlived the workload and still hold its output pipes.
    fn remove(&self, container: &ContainerRef) -> Result<()> {
        signal_group(container.pgid, StopSignal::Kill)
    }

    fn isolated(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ResourceLimits;
    use crate::kernel::credentials::UnprivilegedUser;
    use crate::runtime::image::ImageRef;
    use std::io::Read;

    fn spec(argv: &[&str]) -> ContainerSpec {
        ContainerSpec {
            name: "runbox-host-test".to_string(),
            run_id: "host-test".to_string(),
            image: ImageRef::parse("unused:latest").unwrap(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            limits: ResourceLimits::default(),
            workdir: "/app".to_string(),
            user: UnprivilegedUser::nobody(),
            environment: vec![("GREETING".to_string(), "hello".to_string())],
            mount: None,
        }
    }

    #[test]
    fn argv_paths_under_the_mount_are_translated() {
        let mount = Mount {
            host_path: PathBuf::from("/tmp/ws/run1"),
            container_path: PathBuf::from("/app"),
            read_only: true,
        };
        let argv = vec![
            "python3".to_string(),
            "/app/main.py".to_string(),
            "/etc/hosts".to_string(),
            "app/rel".to_string(),
        ];
        assert_eq!(
            translate_argv(&argv, Some(&mount)),
            vec!["python3", "/tmp/ws/run1/main.py", "/etc/hosts", "app/rel"]
        );
        assert_eq!(translate_argv(&argv, None), argv);
    }

    #[test]
    fn environment_is_scrubbed_and_extended() {
        let host = HostProcess::new();
        let mut spawned = host.spawn(&spec(&["sh", "-c", "echo $GREETING:$USER"])).unwrap();
        drop(spawned.child.stdin.take());

        let mut out = String::new();
        spawned
            .child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        let status = spawned.child.wait().unwrap();

        assert!(status.success());
        assert_eq!(out, "hello:\n");
        assert!(spawned.container.pgid > 1);
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let host = HostProcess::new();
        let err = host
            .spawn(&spec(&["/nonexistent/runbox-program"]))
            .unwrap_err();
        assert!(matches!(err, LauncherError::SpawnFailure(_)));
    }

    #[test]
    fn workload_gets_its_own_process_group() {
        let host = HostProcess::new();
        let mut spawned = host.spawn(&spec(&["sleep", "30"])).unwrap();
        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(
            spawned.child.id() as i32,
        )))
        .unwrap();
        assert_eq!(pgid.as_raw(), spawned.container.pgid);

        host.stop(&spawned.container, StopSignal::Kill).unwrap();
        let status = spawned.child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn remove_reaps_background_jobs_left_in_the_group() {
        let host = HostProcess::new();
        let mut spawned = host
            .spawn(&spec(&["sh", "-c", "sleep 30 & echo started"]))
            .unwrap();
        drop(spawned.child.stdin.take());
        let mut stdout = spawned.child.stdout.take().unwrap();
        assert!(spawned.child.wait().unwrap().success());

        // The orphaned sleep keeps the pipe open until the group is killed.
        host.remove(&spawned.container).unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "started\n");

        // A second removal finds nothing left and still succeeds.
        host.remove(&spawned.container).unwrap();
    }
}
