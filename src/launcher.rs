//! Caller-facing entry point.
//!
//! [`Launcher::submit`] resolves the runtime, spawns the container and hands it
//! to a supervisor thread, returning a [`RunTicket`]. Launch errors
//! (unsupported runtime, spawn failure) are returned right away and are the
//! only outcome of that request; otherwise the ticket yields exactly one
//! [`RunResult`].

use crate::backend::{self, ContainerRuntime, ContainerSpec};
use crate::channel::{result_channel, ResultStream};
use crate::config::loader::{LauncherConfig, RunDefaults};
use crate::config::types::{LauncherError, Result, RunRequest, RunRequestBuilder, RunResult, RunStatus};
use crate::kernel::credentials::UnprivilegedUser;
use crate::kernel::signal::StopSignal;
use crate::observability::audit::{self, Correlation};
use crate::runtime::registry::ImageRegistry;
use crate::supervisor::{spawn_supervisor, ContainerHandle, OutcomeLatch, StopCause, Supervision};
use crate::utils::output::OutputLimits;
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct Launcher {
    registry: Arc<ImageRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    defaults: RunDefaults,
    output: OutputLimits,
    user: UnprivilegedUser,
    /// Cancel handles of runs that may still be going
    inflight: Mutex<Vec<CancelHandle>>,
    closed: AtomicBool,
}

impl Launcher {
    pub fn new(
        config: &LauncherConfig,
        registry: Arc<ImageRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let user = UnprivilegedUser::parse(&config.defaults.user)?;
        Ok(Self {
            registry,
            runtime,
            defaults: config.defaults.clone(),
            output: config.output.clone(),
            user,
            inflight: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Build the runtime table and backend described by `config`.
    pub fn from_config(config: &LauncherConfig) -> Result<Self> {
        let registry = Arc::new(ImageRegistry::from_entries(&config.runtimes)?);
        let runtime = backend::from_config(&config.backend)?;
        Self::new(config, registry, runtime)
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn backend_name(&self) -> &'static str {
        self.runtime.backend_name()
    }

    pub fn defaults(&self) -> &RunDefaults {
        &self.defaults
    }

    /// Request builder preloaded with the configured limits and timeout.
    pub fn request(&self, runtime_id: &str, command: &str) -> RunRequestBuilder {
        RunRequest::builder(runtime_id, command)
            .resource_limits(self.defaults.limits.clone())
            .timeout(Duration::from_millis(self.defaults.timeout_ms))
    }

    /// Start a run and return immediately.
    ///
    /// Each call mints a new run id.
    pub fn submit(&self, request: RunRequest) -> Result<RunTicket> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LauncherError::Cancelled);
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut correlation = Correlation::new(&run_id, request.runtime_id())
            .with_backend(self.runtime.backend_name());

        let runtime_spec = match self.registry.resolve(request.runtime_id()) {
            Ok(spec) => spec,
            Err(e) => {
                audit::spawn_failed(&correlation, &e.to_string());
                return Err(e);
            }
        };

        let spec = ContainerSpec {
            name: ContainerSpec::container_name(&run_id),
            run_id: run_id.clone(),
            image: runtime_spec.image.clone(),
            argv: request.argv(),
            limits: request.resource_limits().clone(),
            workdir: self.defaults.workdir.clone(),
            user: self.user.clone(),
            environment: request.environment().to_vec(),
            mount: request.mount().cloned(),
        };
        correlation = correlation.with_container(&spec.name);
        audit::run_submitted(&correlation, &spec.image.to_string());
        if !self.runtime.isolated() {
            audit::degraded_backend(&correlation, self.runtime.backend_name());
        }

        let mut handle = ContainerHandle::new(&spec.name, &runtime_spec.id);
        let spawned = match self
            .runtime
            .ensure_image(&spec.image)
            .and_then(|_| self.runtime.spawn(&spec))
        {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Err(state_err) = handle.fail_spawn() {
                    log::error!("{}", state_err);
                }
                log::warn!("Run {} failed to spawn: {}", run_id, e);
                audit::spawn_failed(&correlation, &e.to_string());
                return Err(e);
            }
        };

        // The deadline counts from here; image pulls are not charged to the run.
        let started = Instant::now();
        let container = spawned.container.clone();
        if let Err(e) = handle.mark_running(container.clone()) {
            self.abandon(&container);
            return Err(e);
        }
        audit::run_started(&correlation, container.pgid);
        log::info!(
            "Run {} started: {} on {} ({})",
            run_id,
            runtime_spec.id,
            self.runtime.backend_name(),
            spec.image
        );

        let (sink, stream) = result_channel();
        let (cancel_tx, cancel_rx) = bounded(1);
        let latch = Arc::new(OutcomeLatch::new());
        let job = Supervision {
            runtime: Arc::clone(&self.runtime),
            spec,
            handle,
            stdin: request.stdin().map(str::to_string),
            timeout: request.timeout(),
            grace: Duration::from_millis(self.defaults.grace_ms),
            output: self.output.clone(),
            started,
            correlation,
        };

        let join = match spawn_supervisor(job, spawned, sink, cancel_rx, Arc::clone(&latch)) {
            Ok(join) => join,
            Err(e) => {
                self.abandon(&container);
                return Err(LauncherError::SpawnFailure(format!(
                    "failed to start supervisor thread: {}",
                    e
                )));
            }
        };

        let cancel = CancelHandle {
            run_id: run_id.clone(),
            latch,
            tx: cancel_tx,
        };
        let shut_down = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.retain(|handle| !handle.is_settled());
            inflight.push(cancel.clone());
            // A shutdown that began while this run was launching has already
            // drained the list.
            self.closed.load(Ordering::SeqCst)
        };
        if shut_down {
            log::warn!("Run {} started during shutdown, cancelling", run_id);
            cancel.cancel();
        }

        Ok(RunTicket {
            run_id,
            stream: Some(stream),
            cancel,
            join,
        })
    }

    /// Refuse new runs and cancel every run still in flight.
    ///
    /// Returns how many runs were actually cancelled.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let inflight = std::mem::take(&mut *self.inflight.lock().unwrap_or_else(|e| e.into_inner()));
        let cancelled = inflight.iter().filter(|handle| handle.cancel()).count();
        if cancelled > 0 {
            log::warn!("Shutdown cancelled {} in-flight run(s)", cancelled);
        }
        cancelled
    }

    /// Submit and block until the run reaches its terminal state.
    pub fn run(&self, request: RunRequest) -> Result<RunResult> {
        Ok(self.submit(request)?.wait())
    }

    fn abandon(&self, container: &backend::ContainerRef) {
        if let Err(e) = self.runtime.stop(container, StopSignal::Kill) {
            log::warn!("Failed to kill abandoned container {}: {}", container.id, e);
        }
        if let Err(e) = self.runtime.remove(container) {
            log::warn!("Failed to remove abandoned container {}: {}", container.id, e);
        }
    }
}

/// Cancels one run. Cloneable and usable from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    run_id: String,
    latch: Arc<OutcomeLatch<StopCause>>,
    tx: Sender<()>,
}

impl CancelHandle {
    /// Request cancellation.
    ///
    /// Returns `false` when the run already reached another outcome; the
    /// result is then unaffected.
    pub fn cancel(&self) -> bool {
        if !self.latch.record(StopCause::Cancelled) {
            log::debug!("Cancel for run {} lost the race", self.run_id);
            return false;
        }
        // The supervisor may already be gone; the latch decides the status either way.
        let _ = self.tx.try_send(());
        true
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether the run already has its outcome decided
    pub fn is_settled(&self) -> bool {
        self.latch.is_set()
    }
}

/// Handle to an in-flight run.
///
/// Dropping the ticket detaches from the run; it still finishes and is torn down.
#[derive(Debug)]
pub struct RunTicket {
    run_id: String,
    stream: Option<ResultStream>,
    cancel: CancelHandle,
    join: JoinHandle<RunResult>,
}

impl RunTicket {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Live output events. Available once.
    pub fn take_stream(&mut self) -> Option<ResultStream> {
        self.stream.take()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block until the run is over.
    pub fn wait(self) -> RunResult {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => RunResult {
                run_id: self.run_id,
                status: RunStatus::Errored,
                exit_code: None,
                signal: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
                truncated: false,
                error_message: Some("supervisor thread aborted".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostProcess;
    use crate::backend::{ContainerRef, SpawnedContainer};
    use crate::config::loader::BackendKind;
    use crate::runtime::image::ImageRef;
    use std::thread;

    fn host_launcher() -> Launcher {
        let mut config = LauncherConfig::default();
        config.backend.kind = BackendKind::Host;
        config.backend.allow_degraded = true;
        config.defaults.grace_ms = 200;
        Launcher::from_config(&config).unwrap()
    }

    #[test]
    fn request_carries_configured_defaults() {
        let launcher = host_launcher();
        let request = launcher.request("python", "true").build().unwrap();
        assert_eq!(request.timeout(), Duration::from_millis(5_000));
        assert_eq!(request.resource_limits().memory_mb, 256);
    }

    #[test]
    fn unsupported_runtime_fails_at_submit() {
        let launcher = host_launcher();
        let request = launcher.request("cobol", "true").build().unwrap();
        assert!(matches!(
            launcher.submit(request),
            Err(LauncherError::UnsupportedRuntime(_))
        ));
    }

    #[test]
    fn missing_command_fails_at_submit() {
        let launcher = host_launcher();
        let request = launcher
            .request("python", "/nonexistent/runbox-command")
            .build()
            .unwrap();
        assert!(matches!(
            launcher.submit(request),
            Err(LauncherError::SpawnFailure(_))
        ));
    }

    #[test]
    fn root_default_user_is_rejected() {
        let mut config = LauncherConfig::default();
        config.defaults.user = "root".to_string();
        config.backend.kind = BackendKind::Host;
        config.backend.allow_degraded = true;
        assert!(Launcher::from_config(&config).is_err());
    }

    #[test]
    fn cancel_after_completion_loses() {
        let launcher = host_launcher();
        let request = launcher.request("python", "true").build().unwrap();
        let ticket = launcher.submit(request).unwrap();
        let cancel = ticket.cancel_handle();
        let result = ticket.wait();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(!cancel.cancel());
        assert!(cancel.is_settled());
    }

    #[test]
    fn cloned_request_gets_its_own_run_id() {
        let launcher = host_launcher();
        let request = launcher.request("python", "echo").arg("twice").build().unwrap();
        let first = launcher.submit(request.clone()).unwrap();
        let second = launcher.submit(request).unwrap();
        assert_ne!(first.run_id(), second.run_id());

        let (first_id, second_id) = (first.run_id().to_string(), second.run_id().to_string());
        let (a, b) = (first.wait(), second.wait());
        assert_eq!(a.run_id, first_id);
        assert_eq!(b.run_id, second_id);
        assert_eq!(a.stdout, "twice\n");
        assert_eq!(b.stdout, "twice\n");
    }

    /// Host backend with a slow image pull
    struct SlowPull(HostProcess);

    impl ContainerRuntime for SlowPull {
        fn backend_name(&self) -> &'static str {
            "slow-pull"
        }
        fn ensure_image(&self, _image: &ImageRef) -> Result<()> {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        }
        fn spawn(&self, spec: &ContainerSpec) -> Result<SpawnedContainer> {
            self.0.spawn(spec)
        }
        fn stop(&self, container: &ContainerRef, signal: StopSignal) -> Result<()> {
            self.0.stop(container, signal)
        }
        fn remove(&self, container: &ContainerRef) -> Result<()> {
            self.0.remove(container)
        }
        fn isolated(&self) -> bool {
            false
        }
    }

    #[test]
    fn shutdown_during_image_pull_cancels_the_run() {
        let mut config = LauncherConfig::default();
        config.defaults.grace_ms = 200;
        let registry = Arc::new(ImageRegistry::from_entries(&config.runtimes).unwrap());
        let launcher = Arc::new(
            Launcher::new(&config, registry, Arc::new(SlowPull(HostProcess::new()))).unwrap(),
        );

        let submitter = {
            let launcher = Arc::clone(&launcher);
            thread::spawn(move || {
                let request = launcher.request("python", "sleep").arg("30").build().unwrap();
                launcher.submit(request)
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(launcher.shutdown(), 0);

        let ticket = submitter.join().unwrap().unwrap();
        let began = Instant::now();
        assert_eq!(ticket.wait().status, RunStatus::Killed);
        assert!(began.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn shutdown_cancels_in_flight_runs_and_refuses_new_ones() {
        let launcher = host_launcher();
        let request = launcher
            .request("python", "sleep")
            .arg("30")
            .build()
            .unwrap();
        let ticket = launcher.submit(request).unwrap();

        assert_eq!(launcher.shutdown(), 1);
        assert_eq!(ticket.wait().status, RunStatus::Killed);

        let late = launcher.request("python", "true").build().unwrap();
        assert!(matches!(launcher.submit(late), Err(LauncherError::Cancelled)));
    }
}
