//! Signaling for supervised process trees, and the termination escalator.
//!
//! Signals are addressed to the child's process group (the spawn layer puts
//! every child in its own session), so a misbehaving agent cannot dodge
//! termination by forking. The escalator drives SIGTERM → SIGKILL → abort
//! token; the token is the last resort for processes that survive SIGKILL,
//! e.g. blocked on an unresponsive syscall, and guarantees the awaiting
//! caller resolves anyway.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessSignal {
    Term,
    Kill,
    Stop,
    Cont,
}

impl ProcessSignal {
    pub fn name(self) -> &'static str {
        match self {
            ProcessSignal::Term => "SIGTERM",
            ProcessSignal::Kill => "SIGKILL",
            ProcessSignal::Stop => "SIGSTOP",
            ProcessSignal::Cont => "SIGCONT",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            ProcessSignal::Term => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
            ProcessSignal::Stop => libc::SIGSTOP,
            ProcessSignal::Cont => libc::SIGCONT,
        }
    }
}

impl std::fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// OS abstraction for "signal the supervised process tree".
///
/// Production code uses [`ProcessGroup`]; tests substitute recording fakes so
/// escalation ordering can be asserted without real children.
pub trait SignalTarget: Send + Sync {
    /// Delivers `signal` to the target. An error whose OS code is `ESRCH`
    /// means the target no longer exists.
    fn signal(&self, signal: ProcessSignal) -> io::Result<()>;

    /// Liveness probe. `false` is authoritative; `true` can race with exit.
    fn is_alive(&self) -> bool;
}

/// The process group of one spawned child, addressed through its leader PID.
///
/// Group delivery uses the POSIX negative-PID convention (`killpg`); when the
/// group lookup or group signal fails for a reason other than the process
/// being gone — typically because the child was not spawned into its own
/// session — delivery falls back to the single process, and the fallback is
/// logged rather than silently absorbed. There is no Windows equivalent of
/// process-group signaling; non-Unix builds report `Unsupported`.
#[derive(Clone, Copy, Debug)]
pub struct ProcessGroup {
    pid: Option<i32>,
}

impl ProcessGroup {
    pub fn from_pid(pid: i32) -> Self {
        Self { pid: Some(pid) }
    }

    /// A child that has already been reaped has no PID; such a group reports
    /// itself dead and refuses signals.
    pub fn from_child(child: &tokio::process::Child) -> Self {
        Self {
            pid: child.id().map(|pid| pid as i32),
        }
    }
}

#[cfg(unix)]
fn process_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(unix)]
impl SignalTarget for ProcessGroup {
    fn signal(&self, signal: ProcessSignal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        };
        let raw = signal.raw();

        let pgid = unsafe { libc::getpgid(pid) };
        if pgid >= 0 && unsafe { libc::killpg(pgid, raw) } == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();
        if process_gone(&group_err) {
            return Err(group_err);
        }
        tracing::warn!(
            pid,
            signal = signal.name(),
            error = %group_err,
            "process group signal failed; falling back to single-process signal"
        );

        if unsafe { libc::kill(pid, raw) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn is_alive(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        unsafe { libc::kill(pid, 0) == 0 }
    }
}

#[cfg(not(unix))]
impl SignalTarget for ProcessGroup {
    fn signal(&self, _signal: ProcessSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signaling is only supported on unix",
        ))
    }

    fn is_alive(&self) -> bool {
        false
    }
}

/// Exit flag the spawn layer marks the moment `wait()` returns.
///
/// The escalator polls and waits on this instead of the OS, so an exit
/// observed anywhere in the spawn layer immediately ends the ladder.
#[derive(Clone, Debug, Default)]
pub struct ExitFlag {
    inner: Arc<ExitFlagInner>,
}

#[derive(Debug, Default)]
struct ExitFlagInner {
    exited: AtomicBool,
    notify: Notify,
}

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the exit mark; returns whether it arrived.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        // Register for the notification before checking the flag so an exit
        // marked between the check and the await is not missed.
        let notified = self.inner.notify.notified();
        if self.is_exited() {
            return true;
        }
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => self.is_exited(),
        }
    }
}

/// Drives the termination ladder: SIGTERM, wait `kill_grace`, SIGKILL, wait
/// `hard_abort`, then cancel `abort` so the caller's await force-resolves.
///
/// Every step short-circuits on an observed exit, and the abort token is
/// cancelled at most once, only after the process survived both signals.
pub(crate) async fn escalate(
    target: Arc<dyn SignalTarget>,
    kill_grace: Duration,
    hard_abort: Duration,
    exit: ExitFlag,
    abort: CancellationToken,
) {
    if exit.is_exited() || !target.is_alive() {
        return;
    }

    send_signal(target.as_ref(), ProcessSignal::Term);
    if exit.wait_with_timeout(kill_grace).await {
        return;
    }

    send_signal(target.as_ref(), ProcessSignal::Kill);
    if exit.wait_with_timeout(hard_abort).await {
        return;
    }

    tracing::warn!("process unresponsive to SIGTERM and SIGKILL; forcing resolution");
    abort.cancel();
}

pub(crate) fn send_signal(target: &dyn SignalTarget, signal: ProcessSignal) {
    match target.signal(signal) {
        Ok(()) => tracing::debug!(signal = signal.name(), "signal sent"),
        Err(err) => tracing::debug!(signal = signal.name(), error = %err, "signal not delivered"),
    }
}
