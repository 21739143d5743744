use super::latch::{OutcomeLatch, StopCause};
use super::state::ContainerHandle;
use crate::backend::{ContainerRef, ContainerRuntime, ContainerSpec, SpawnedContainer};
use crate::channel::{ChunkSender, EventSink};
use crate::config::types::{RunResult, RunStatus};
use crate::kernel::signal::{KillReport, StopSignal};
use crate::observability::audit::{self, Correlation};
use crate::utils::output::{pump_into, CapturedStream, OutputLimits, SharedCapture};
use crossbeam_channel::{after, bounded, never, select, Receiver, RecvTimeoutError};
use std::any::Any;
use std::io::{ErrorKind, Write};
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on waiting for the process after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Everything the supervisor thread owns for one run
pub struct Supervision {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub spec: ContainerSpec,
    /// Already in `Running`
    pub handle: ContainerHandle,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub grace: Duration,
    pub output: OutputLimits,
    /// When the container was spawned; the deadline counts from here
    pub started: Instant,
    pub correlation: Correlation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

type ExitMessage = std::result::Result<ExitInfo, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Start the supervisor thread for a spawned container.
///
/// The thread always finishes `sink` with exactly one [`RunResult`], including
/// when supervision itself panics.
pub fn spawn_supervisor(
    job: Supervision,
    spawned: SpawnedContainer,
    sink: EventSink,
    cancel_rx: Receiver<()>,
    latch: Arc<OutcomeLatch<StopCause>>,
) -> std::io::Result<JoinHandle<RunResult>> {
    let name = format!("runbox-sup-{}", short_id(&job.spec.run_id));
    thread::Builder::new().name(name).spawn(move || {
        let run_id = job.spec.run_id.clone();
        let runtime = Arc::clone(&job.runtime);
        let container = spawned.container.clone();
        let correlation = job.correlation.clone();
        let started = job.started;
        let chunks = sink.chunks();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            supervise(job, spawned, chunks, cancel_rx, &latch)
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                latch.record(StopCause::Failed);
                let message = panic_message(payload.as_ref());
                log::error!("Supervisor for run {} panicked: {}", run_id, message);
                audit::supervisor_panic(&correlation, &message);

                // Nothing may outlive the run, even if the backend misbehaves again.
                let teardown = panic::catch_unwind(AssertUnwindSafe(|| {
                    let _ = runtime.stop(&container, StopSignal::Kill);
                    runtime.remove(&container)
                }));
                if !matches!(teardown, Ok(Ok(()))) {
                    audit::cleanup_failure(&correlation, "teardown after supervisor panic failed");
                }

                RunResult {
                    run_id,
                    status: RunStatus::Errored,
                    exit_code: None,
                    signal: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    truncated: false,
                    error_message: Some(format!("supervisor panicked: {}", message)),
                }
            }
        };

        sink.finish(result.clone());
        result
    })
}

fn supervise(
    job: Supervision,
    spawned: SpawnedContainer,
    chunks: ChunkSender,
    cancel_rx: Receiver<()>,
    latch: &OutcomeLatch<StopCause>,
) -> RunResult {
    let Supervision {
        runtime,
        spec,
        mut handle,
        stdin,
        timeout,
        grace,
        output,
        started,
        correlation,
    } = job;
    let SpawnedContainer {
        container,
        mut child,
    } = spawned;

    if let Some(mut pipe) = child.stdin.take() {
        if let Some(data) = stdin {
            thread::spawn(move || {
                if let Err(e) = pipe.write_all(data.as_bytes()) {
                    if e.kind() != ErrorKind::BrokenPipe {
                        log::debug!("stdin write failed: {}", e);
                    }
                }
            });
        }
        // Without data the pipe is dropped here and the workload sees EOF.
    }

    let (done_tx, done_rx) = bounded::<StreamKind>(2);
    let (stdout_capture, stderr_capture) = (SharedCapture::new(), SharedCapture::new());
    if let Some(out) = child.stdout.take() {
        let (tx, chunks, limit) = (done_tx.clone(), chunks.clone(), output.stdout_limit);
        let capture = stdout_capture.clone();
        thread::spawn(move || {
            pump_into(out, limit, &capture, |chunk| chunks.stdout(chunk));
            let _ = tx.send(StreamKind::Stdout);
        });
    }
    if let Some(err) = child.stderr.take() {
        let (tx, chunks, limit) = (done_tx.clone(), chunks, output.stderr_limit);
        let capture = stderr_capture.clone();
        thread::spawn(move || {
            pump_into(err, limit, &capture, |chunk| chunks.stderr(chunk));
            let _ = tx.send(StreamKind::Stderr);
        });
    }
    drop(done_tx);

    let (exit_tx, exit_rx) = bounded::<ExitMessage>(1);
    thread::spawn(move || {
        let message = child
            .wait()
            .map(ExitInfo::from)
            .map_err(|e| e.to_string());
        let _ = exit_tx.send(message);
    });

    let deadline = started + timeout;
    let never_rx = never();
    let mut cancel_open = true;
    let mut exit: Option<ExitMessage> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let cancel = if cancel_open { &cancel_rx } else { &never_rx };
        select! {
            recv(exit_rx) -> msg => {
                exit = Some(msg.unwrap_or_else(|_| Err("exit waiter vanished".to_string())));
                latch.record(StopCause::Exited);
                break;
            }
            recv(cancel) -> msg => match msg {
                Ok(()) => break,
                // Every cancel handle is gone; only exit or deadline remain.
                Err(_) => cancel_open = false,
            },
            recv(after(remaining)) -> _ => {
                latch.record(StopCause::TimedOut);
                break;
            }
        }
    }

    let cause = latch.get().unwrap_or(StopCause::Exited);
    let mut problems = Vec::new();
    if exit.is_none() {
        let reason = match cause {
            StopCause::TimedOut => format!("deadline of {} ms expired", timeout.as_millis()),
            _ => "cancelled by caller".to_string(),
        };
        let (report, late_exit) =
            terminate(runtime.as_ref(), &container, grace, &exit_rx, &correlation, &reason);
        log::info!(
            "Run {} stopped after {} ms (term_sent={}, kill_sent={}, exited_in_grace={})",
            spec.run_id,
            report.waited_ms,
            report.term_sent,
            report.kill_sent,
            report.exited_in_grace
        );
        problems.extend(report.notes);
        exit = late_exit;
    }
    let duration_ms = started.elapsed().as_millis() as u64;

    // Leftover processes may still hold the output pipes open.
    if let Err(e) = runtime.remove(&container) {
        log::warn!("Failed to remove container {}: {}", container.id, e);
        audit::cleanup_failure(&correlation, &e.to_string());
    }

    let (stdout, stderr) = collect_streams(
        &done_rx,
        &stdout_capture,
        &stderr_capture,
        Duration::from_millis(output.collection_timeout_ms),
    );
    let mut truncated = stdout.truncated || stderr.truncated;
    for (kind, stream) in [("stdout", &stdout), ("stderr", &stderr)] {
        if let Some(e) = &stream.read_error {
            log::warn!("Run {}: {} capture incomplete: {}", spec.run_id, kind, e);
            problems.push(format!("{} capture incomplete: {}", kind, e));
            truncated = true;
        }
    }

    if truncated {
        audit::output_truncated(&correlation);
    }
    let stdout = stdout.into_text();
    let stderr = stderr.into_text();

    let (status, info, error_message) = classify(cause, exit, |code| {
        runtime.runtime_failure(code, &stderr)
    });
    let error_message = error_message
        .into_iter()
        .chain(problems)
        .reduce(|all, next| format!("{}; {}", all, next));

    if let Err(e) = handle.finish(status) {
        log::error!("{}", e);
    }
    audit::run_finished(&correlation, status, duration_ms);
    log::info!(
        "Run {} finished: {} (exit={:?}, signal={:?}) in {} ms",
        spec.run_id,
        status,
        info.code,
        info.signal,
        duration_ms
    );

    RunResult {
        run_id: spec.run_id,
        status,
        exit_code: info.code,
        signal: info.signal,
        stdout,
        stderr,
        duration_ms,
        truncated,
        error_message,
    }
}

/// Map the stop cause and exit observation onto a terminal status.
fn classify<F>(
    cause: StopCause,
    exit: Option<ExitMessage>,
    runtime_failure: F,
) -> (RunStatus, ExitInfo, Option<String>)
where
    F: FnOnce(i32) -> Option<String>,
{
    let unknown = ExitInfo {
        code: None,
        signal: None,
    };
    let (info, wait_error) = match exit {
        Some(Ok(info)) => (info, None),
        Some(Err(e)) => (unknown, Some(format!("waiting for container failed: {}", e))),
        None => (unknown, Some("container did not exit after SIGKILL".to_string())),
    };

    match cause {
        StopCause::TimedOut => (RunStatus::TimedOut, info, wait_error),
        StopCause::Cancelled => (RunStatus::Killed, info, wait_error),
        StopCause::Failed => (
            RunStatus::Errored,
            info,
            wait_error.or_else(|| Some("supervision failed".to_string())),
        ),
        StopCause::Exited => {
            if let Some(e) = wait_error {
                return (RunStatus::Errored, info, Some(e));
            }
            match info.code.and_then(runtime_failure) {
                Some(reason) => (RunStatus::Errored, info, Some(reason)),
                None => (RunStatus::Completed, info, None),
            }
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
fn terminate(
    runtime: &dyn ContainerRuntime,
    container: &ContainerRef,
    grace: Duration,
    exit_rx: &Receiver<ExitMessage>,
    correlation: &Correlation,
    reason: &str,
) -> (KillReport, Option<ExitMessage>) {
    let mut report = KillReport::default();
    let start = Instant::now();

    audit::graceful_stop(correlation, reason);
    match runtime.stop(container, StopSignal::Terminate) {
        Ok(()) => report.term_sent = true,
        Err(e) => report.notes.push(format!("SIGTERM failed: {}", e)),
    }

    if let Ok(exit) = exit_rx.recv_timeout(grace) {
        report.exited_in_grace = true;
        report.waited_ms = start.elapsed().as_millis() as u64;
        return (report, Some(exit));
    }

    audit::forced_kill(
        correlation,
        &format!("still running {} ms after SIGTERM", grace.as_millis()),
    );
    match runtime.stop(container, StopSignal::Kill) {
        Ok(()) => report.kill_sent = true,
        Err(e) => report.notes.push(format!("SIGKILL failed: {}", e)),
    }

    let exit = exit_rx.recv_timeout(KILL_WAIT).ok();
    if exit.is_none() {
        report
            .notes
            .push(format!("no exit within {} ms of SIGKILL", KILL_WAIT.as_millis()));
    }
    report.waited_ms = start.elapsed().as_millis() as u64;
    (report, exit)
}

/// Wait for both pump threads, bounded by `timeout` in total.
///
/// A stream whose pump has not finished keeps the bytes read so far and is
/// marked with a read error.
fn collect_streams(
    done_rx: &Receiver<StreamKind>,
    stdout: &SharedCapture,
    stderr: &SharedCapture,
    timeout: Duration,
) -> (CapturedStream, CapturedStream) {
    let deadline = Instant::now() + timeout;
    let (mut stdout_done, mut stderr_done) = (false, false);

    while !(stdout_done && stderr_done) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(StreamKind::Stdout) => stdout_done = true,
            Ok(StreamKind::Stderr) => stderr_done = true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let finish = |capture: &SharedCapture, done: bool| {
        let mut stream = capture.snapshot();
        if !done && stream.read_error.is_none() {
            stream.read_error = Some("output collection timed out".to_string());
        }
        stream
    };
    (finish(stdout, stdout_done), finish(stderr, stderr_done))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}
