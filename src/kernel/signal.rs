/// Process-group signalling and the CLI's shutdown signal latch
use crossbeam_channel::tick;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::config::types::Result;

/// Last shutdown signal delivered to the process, 0 while none
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Stop phases of cooperative-then-forced termination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM: ask the workload to shut down
    Terminate,
    /// SIGKILL: no further negotiation
    Kill,
}

impl StopSignal {
    pub fn as_signal(self) -> Signal {
        match self {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    /// Name accepted by `docker kill --signal`
    pub fn docker_name(self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// What the stop sequence did for one run
#[derive(Clone, Debug, Default)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Process exited within the grace period
    pub exited_in_grace: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Send `stop` to every process in group `pgid`.
///
/// A group that no longer exists counts as success.
pub fn signal_group(pgid: i32, stop: StopSignal) -> Result<()> {
    if pgid <= 1 {
        // Never broadcast to init or to our own group by accident.
        return Err(crate::config::types::LauncherError::InternalError(format!(
            "refusing to signal process group {}",
            pgid
        )));
    }
    match signal::killpg(Pid::from_raw(pgid), stop.as_signal()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// SIGINT/SIGTERM/SIGHUP latch
pub struct ShutdownSignals;

impl ShutdownSignals {
    /// Install the handlers for the whole process.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler is a single atomic store.
            unsafe { signal::sigaction(sig, &action) }?;
        }
        log::debug!("Shutdown signal handlers installed");
        Ok(Self)
    }

    /// First shutdown signal seen so far
    pub fn received(&self) -> Option<Signal> {
        match SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Block until a shutdown signal arrives.
    pub fn wait(&self) -> Signal {
        let ticker = tick(SIGNAL_POLL);
        loop {
            if let Some(sig) = self.received() {
                return sig;
            }
            let _ = ticker.recv();
        }
    }
}

extern "C" fn record_signal(sig: libc::c_int) {
    let _ = SHUTDOWN_SIGNAL.compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_signal_is_latched() {
        let signals = ShutdownSignals::install().unwrap();
        assert_eq!(signals.received(), None);

        signal::raise(Signal::SIGHUP).unwrap();
        assert_eq!(signals.received(), Some(Signal::SIGHUP));
        assert_eq!(signals.wait(), Signal::SIGHUP);

        // Later signals do not overwrite the first one.
        signal::raise(Signal::SIGINT).unwrap();
        assert_eq!(signals.received(), Some(Signal::SIGHUP));
        SHUTDOWN_SIGNAL.store(0, Ordering::SeqCst);
    }

    #[test]
    fn refuses_to_signal_init_or_own_group_zero() {
        assert!(signal_group(0, StopSignal::Kill).is_err());
        assert!(signal_group(1, StopSignal::Kill).is_err());
    }

    #[test]
    fn missing_group_counts_as_stopped() {
        // pid_max on Linux is at most 2^22, so this group cannot exist.
        assert!(signal_group(i32::MAX - 7, StopSignal::Terminate).is_ok());
    }

    #[test]
    fn stop_signals_map_to_posix_signals() {
        assert_eq!(StopSignal::Terminate.as_signal(), Signal::SIGTERM);
        assert_eq!(StopSignal::Kill.docker_name(), "SIGKILL");
    }
}
