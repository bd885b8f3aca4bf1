//! Launching and supervising a single agent process.
//!
//! [`run_supervised`] owns the full lifecycle: spawn the child in its own
//! process group, pump stdout/stderr through the sink and the watchdog, race
//! child exit against the watchdog's force-abort token, and fold the result
//! into one [`SupervisedOutcome`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WatchdogConfig;
use crate::error::SpawnError;
use crate::process::ProcessGroup;
use crate::process::ProcessSignal;
use crate::process::SignalTarget;
use crate::process::send_signal;
use crate::watchdog::OutputSink;
use crate::watchdog::OutputSource;
use crate::watchdog::Watchdog;
use crate::watchdog::WatchdogEvents;
use crate::watchdog::WatchdogState;

/// Exit code mapping for signal deaths, matching the shell convention of
/// 128 + signal number.
pub const EXIT_CODE_SIGNAL_BASE: i32 = 128;

const READ_CHUNK_SIZE: usize = 8192;

/// After the child exits, grandchildren may still hold the pipe open; stop
/// draining after this long.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_millis(2_000);

/// What to launch. The environment extends the parent's rather than
/// replacing it, so agent CLIs keep PATH and friends.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// How the process resolved.
///
/// `aborted` is only set on the force-abort path: the process survived the
/// whole SIGTERM/SIGKILL escalation and the run was resolved without it.
#[derive(Clone, Debug)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub signal: Option<String>,
    pub aborted: bool,
    pub duration: Duration,
}

/// Process outcome plus the final watchdog latch.
#[derive(Clone, Debug)]
pub struct SupervisedOutcome {
    pub process: ProcessOutcome,
    pub watchdog: WatchdogState,
}

impl SupervisedOutcome {
    /// A run counts as successful only when the process exited zero on its
    /// own and no supervision limit fired.
    pub fn is_success(&self) -> bool {
        self.process.exit_code == 0 && !self.process.aborted && self.watchdog.triggered.is_none()
    }
}

pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

/// Runs `spec` to completion under a watchdog built from `config`.
///
/// Every stdout/stderr chunk goes to `sink` first and the watchdog second,
/// so a trigger banner always lands after the output that caused it. The
/// returned outcome is always produced, even when the process had to be
/// force-aborted; failing to launch the process or observe its exit are the
/// only error paths.
pub async fn run_supervised(
    spec: LaunchSpec,
    config: WatchdogConfig,
    events: Arc<dyn WatchdogEvents>,
    sink: Arc<dyn OutputSink>,
) -> Result<SupervisedOutcome, SpawnError> {
    supervise(spec, config, events, sink, None).await
}

/// Supervision with an injectable signal target.
///
/// [`run_supervised`] always signals the child's own process group; tests
/// substitute a signal-swallowing target here so the force-abort path can be
/// driven without a process that actually survives SIGKILL.
async fn supervise(
    spec: LaunchSpec,
    config: WatchdogConfig,
    events: Arc<dyn WatchdogEvents>,
    sink: Arc<dyn OutputSink>,
    target_override: Option<Arc<dyn SignalTarget>>,
) -> Result<SupervisedOutcome, SpawnError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Detach into its own session so group signals reach the whole tree
    // without touching our own process group.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    tracing::debug!(program = %spec.program, pid = child.id(), "agent process spawned");

    // Pipes are taken before the watchdog exists; every return past this
    // point must tear the watchdog down.
    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingPipe { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::MissingPipe { stream: "stderr" })?;

    let target =
        target_override.unwrap_or_else(|| Arc::new(ProcessGroup::from_child(&child)));
    let watchdog = Watchdog::new(config, Arc::clone(&target), events, Arc::clone(&sink));
    let abort = watchdog.abort_token();

    let pumps = vec![
        tokio::spawn(pump_stream(
            stdout,
            OutputSource::Stdout,
            Arc::clone(&sink),
            watchdog.clone(),
        )),
        tokio::spawn(pump_stream(
            stderr,
            OutputSource::Stderr,
            Arc::clone(&sink),
            watchdog.clone(),
        )),
    ];

    let process = tokio::select! {
        status = child.wait() => {
            watchdog.notify_exited();
            drain_pumps(pumps).await;
            status.map(|status| outcome_from_status(status, started.elapsed()))
        }
        _ = abort.cancelled() => {
            // The process shrugged off the entire escalation. Resolve the
            // run without it; the pipes are still open, so the pumps are
            // stopped rather than drained.
            let _ = child.start_kill();
            for pump in &pumps {
                pump.abort();
            }
            tracing::warn!(program = %spec.program, "abandoning unresponsive process");
            Ok(ProcessOutcome {
                exit_code: 1,
                signal: Some(ProcessSignal::Kill.name().to_string()),
                aborted: true,
                duration: started.elapsed(),
            })
        }
        _ = tokio::signal::ctrl_c() => {
            send_signal(target.as_ref(), ProcessSignal::Kill);
            let _ = child.start_kill();
            watchdog.notify_exited();
            drain_pumps(pumps).await;
            Ok(ProcessOutcome {
                exit_code: EXIT_CODE_SIGNAL_BASE + 2,
                signal: Some(signal_name(2)),
                aborted: false,
                duration: started.elapsed(),
            })
        }
    };

    // Torn down on every path, wait failure included; the monitor must not
    // outlive the run.
    watchdog.cleanup();
    let process = process?;
    Ok(SupervisedOutcome {
        process,
        watchdog: watchdog.state(),
    })
}

async fn pump_stream<R>(
    mut reader: R,
    source: OutputSource,
    sink: Arc<dyn OutputSink>,
    watchdog: Watchdog,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink.write_chunk(source, &buf[..n]);
                watchdog.handle_output(source, &buf[..n]).await;
            }
        }
    }
}

async fn drain_pumps(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(IO_DRAIN_TIMEOUT, pump).await.is_err() {
            abort.abort();
        }
    }
}

#[cfg(unix)]
fn outcome_from_status(status: std::process::ExitStatus, duration: Duration) -> ProcessOutcome {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        return ProcessOutcome {
            exit_code: EXIT_CODE_SIGNAL_BASE + signal,
            signal: Some(signal_name(signal)),
            aborted: false,
            duration,
        };
    }
    ProcessOutcome {
        exit_code: status.code().unwrap_or(-1),
        signal: None,
        aborted: false,
        duration,
    }
}

#[cfg(not(unix))]
fn outcome_from_status(status: std::process::ExitStatus, duration: Duration) -> ProcessOutcome {
    ProcessOutcome {
        exit_code: status.code().unwrap_or(-1),
        signal: None,
        aborted: false,
        duration,
    }
}
