//! Per-process supervision.
//!
//! One [`Watchdog`] owns the safety envelope of one child process: a silence
//! deadline reset by every output chunk, an absolute wall-clock deadline,
//! fatal-output-pattern matching, and the sandbox denial tracker. Whichever
//! source fires first wins the latch; the rest are ignored for the remainder
//! of the process's life. On trigger the watchdog writes a banner to the
//! process's stderr sink, notifies the caller synchronously, and hands the
//! process to the termination escalator.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use regex_lite::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::denial;
use crate::denial::DenialAction;
use crate::denial::DenialDecision;
use crate::denial::DenialInfo;
use crate::denial::DenialTracker;
use crate::process::ExitFlag;
use crate::process::ProcessSignal;
use crate::process::SignalTarget;
use crate::process::escalate;
use crate::process::send_signal;

/// Partial lines held back until their newline arrives are capped at this
/// size; marker lines are short and binary spew is not worth retaining.
const PENDING_LINE_CAP: usize = 8192;

/// Why a supervised process was put down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogTrigger {
    Silence,
    WallClock,
    FatalPattern,
    SandboxDenial,
}

impl WatchdogTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchdogTrigger::Silence => "silence",
            WatchdogTrigger::WallClock => "wall-clock",
            WatchdogTrigger::FatalPattern => "fatal-pattern",
            WatchdogTrigger::SandboxDenial => "sandbox-denial",
        }
    }
}

impl std::fmt::Display for WatchdogTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one watchdog's latch. Mutated only by the watchdog itself.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WatchdogState {
    pub triggered: Option<WatchdogTrigger>,
    pub triggered_reason: Option<String>,
    pub sandbox_fail_fast: Option<DenialInfo>,
}

/// An output pattern that marks the agent as unrecoverable.
///
/// One sighting only arms a timestamp; a second sighting within the retry
/// window trips the watchdog. A sighting outside the window re-arms.
#[derive(Clone, Debug)]
pub struct FatalPattern {
    pub label: String,
    pub regex: Regex,
}

impl FatalPattern {
    pub fn new(label: impl Into<String>, pattern: &str) -> Result<Self, regex_lite::Error> {
        Ok(Self {
            label: label.into(),
            regex: Regex::new(pattern)?,
        })
    }
}

/// Which stream a chunk of output came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Receives everything the supervised process writes. Watchdog banners are
/// delivered here too, always as stderr.
pub trait OutputSink: Send + Sync {
    fn write_chunk(&self, source: OutputSource, chunk: &[u8]);
}

/// Discards all output.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_chunk(&self, _source: OutputSource, _chunk: &[u8]) {}
}

/// Synchronous observer for watchdog triggers.
pub trait WatchdogEvents: Send + Sync {
    /// Fires at trigger time, before the process is terminated, so the
    /// caller can capture "why" while the state is still live. Called at
    /// most once per process.
    fn on_trigger(
        &self,
        _trigger: WatchdogTrigger,
        _reason: &str,
        _fail_fast: Option<&DenialInfo>,
    ) {
    }
}

/// For callers that do not observe the watchdog.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEvents;

impl WatchdogEvents for NoopEvents {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PendingLines {
    stdout: String,
    stderr: String,
}

enum LineScan {
    Ignored,
    Denial(DenialInfo, DenialDecision),
}

struct WatchdogInner {
    config: WatchdogConfig,
    target: Arc<dyn SignalTarget>,
    events: Arc<dyn WatchdogEvents>,
    sink: Arc<dyn OutputSink>,
    started: Instant,
    last_output: Mutex<Instant>,
    state: Mutex<WatchdogState>,
    /// First-sighting timestamp per fatal pattern, index-aligned with
    /// `config.fatal_patterns`.
    fatal_arms: Mutex<Vec<Option<Instant>>>,
    pending_lines: Mutex<PendingLines>,
    denials: Mutex<DenialTracker>,
    torn_down: AtomicBool,
    /// Cancelled on trigger and on cleanup; stops the monitor task and any
    /// in-flight denial pause.
    monitor: CancellationToken,
    /// Cancelled only by the escalator once the process survived SIGKILL.
    abort: CancellationToken,
    exit: ExitFlag,
}

/// Supervisor for one child process. Cheap to clone; all clones share the
/// same latch.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// Arms the silence and wall-clock deadlines immediately.
    pub fn new(
        config: WatchdogConfig,
        target: Arc<dyn SignalTarget>,
        events: Arc<dyn WatchdogEvents>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let now = Instant::now();
        let denials = DenialTracker::new(config.denial.clone());
        let fatal_arms = vec![None; config.fatal_patterns.len()];
        let inner = Arc::new(WatchdogInner {
            config,
            target,
            events,
            sink,
            started: now,
            last_output: Mutex::new(now),
            state: Mutex::new(WatchdogState::default()),
            fatal_arms: Mutex::new(fatal_arms),
            pending_lines: Mutex::new(PendingLines::default()),
            denials: Mutex::new(denials),
            torn_down: AtomicBool::new(false),
            monitor: CancellationToken::new(),
            abort: CancellationToken::new(),
            exit: ExitFlag::new(),
        });
        let watchdog = Self { inner };
        watchdog.spawn_monitor();
        watchdog
    }

    /// Single ingestion point for process output. Resets the silence
    /// deadline, scans for fatal patterns, then line-buffers (per stream, so
    /// interleaved stdout/stderr cannot tear a line) and scans complete
    /// lines for sandbox markers.
    pub async fn handle_output(&self, source: OutputSource, chunk: &[u8]) {
        *lock(&self.inner.last_output) = Instant::now();
        if self.triggered() {
            return;
        }

        let text = String::from_utf8_lossy(chunk);
        self.inner.scan_fatal_patterns(&text);

        let lines = self.inner.buffer_lines(source, &text);
        for line in lines {
            if self.triggered() {
                return;
            }
            if let LineScan::Denial(info, decision) = self.inner.scan_line(&line) {
                self.apply_decision(info, decision).await;
            }
        }
    }

    pub fn state(&self) -> WatchdogState {
        lock(&self.inner.state).clone()
    }

    pub fn triggered(&self) -> bool {
        lock(&self.inner.state).triggered.is_some()
    }

    /// Token the spawn layer races against child exit; cancelled only when
    /// the full kill-grace/hard-abort escalation has been exhausted.
    pub fn abort_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    /// Must be called the moment the child's `wait()` resolves; ends any
    /// in-flight escalation early.
    pub fn notify_exited(&self) {
        self.inner.exit.mark_exited();
    }

    /// Tears down the monitor. Mandatory when the owning execution slot
    /// completes, win or lose; idempotent via the torn-down flag.
    pub fn cleanup(&self) {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.monitor.cancel();
    }

    fn spawn_monitor(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let wall_deadline = inner.started + inner.config.wall_clock_cap;
            loop {
                let silence_deadline = *lock(&inner.last_output) + inner.config.silence_timeout;
                tokio::select! {
                    _ = inner.monitor.cancelled() => return,
                    _ = tokio::time::sleep_until(wall_deadline) => {
                        let reason = format!(
                            "run time exceeded the {}s wall-clock cap",
                            inner.config.wall_clock_cap.as_secs()
                        );
                        inner.trigger(WatchdogTrigger::WallClock, reason, None);
                        return;
                    }
                    _ = tokio::time::sleep_until(silence_deadline) => {
                        // Output may have arrived while this arm slept; only
                        // fire if the recomputed deadline has truly passed.
                        let last = *lock(&inner.last_output);
                        if Instant::now() >= last + inner.config.silence_timeout {
                            let reason = format!(
                                "no output for {}s",
                                inner.config.silence_timeout.as_secs()
                            );
                            inner.trigger(WatchdogTrigger::Silence, reason, None);
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn apply_decision(&self, info: DenialInfo, decision: DenialDecision) {
        let inner = &self.inner;
        match decision.action {
            DenialAction::None => {}
            DenialAction::Warn => {
                tracing::warn!(
                    operation = info.operation.as_str(),
                    target = %info.target,
                    count = decision.count,
                    "repeated sandbox denials"
                );
            }
            DenialAction::Delay => {
                tracing::warn!(
                    operation = info.operation.as_str(),
                    target = %info.target,
                    count = decision.count,
                    pause_ms = inner.config.denial.delay_pause.as_millis() as u64,
                    "suspending process after repeated sandbox denials"
                );
                send_signal(inner.target.as_ref(), ProcessSignal::Stop);
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.denial.delay_pause) => {}
                    _ = inner.monitor.cancelled() => {}
                }
                if lock(&inner.state).triggered.is_none() {
                    send_signal(inner.target.as_ref(), ProcessSignal::Cont);
                }
            }
            DenialAction::FailFast => {
                let reason = format!(
                    "sandbox denials for {} {} reached the fail-fast threshold ({} in window)",
                    info.operation, info.target, decision.count
                );
                inner.trigger(WatchdogTrigger::SandboxDenial, reason, Some(info));
            }
        }
    }
}

impl WatchdogInner {
    /// Sets the latch. First caller wins; everything after the state update
    /// happens exactly once per process.
    fn trigger(&self, trigger: WatchdogTrigger, reason: String, fail_fast: Option<DenialInfo>) {
        {
            let mut state = lock(&self.state);
            if state.triggered.is_some() {
                return;
            }
            state.triggered = Some(trigger);
            state.triggered_reason = Some(reason.clone());
            state.sandbox_fail_fast = fail_fast.clone();
        }
        self.monitor.cancel();
        tracing::warn!(trigger = trigger.as_str(), reason = %reason, "watchdog triggered");

        let banner = format!("\n[watchdog] {reason}; terminating process\n");
        self.sink.write_chunk(OutputSource::Stderr, banner.as_bytes());
        self.events.on_trigger(trigger, &reason, fail_fast.as_ref());

        tokio::spawn(escalate(
            Arc::clone(&self.target),
            self.config.kill_grace,
            self.config.hard_abort,
            self.exit.clone(),
            self.abort.clone(),
        ));
    }

    fn scan_fatal_patterns(&self, text: &str) {
        if self.config.fatal_patterns.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut tripped: Option<String> = None;
        {
            let mut arms = lock(&self.fatal_arms);
            for (pattern, armed) in self.config.fatal_patterns.iter().zip(arms.iter_mut()) {
                if !pattern.regex.is_match(text) {
                    continue;
                }
                match *armed {
                    Some(first)
                        if now.duration_since(first) <= self.config.fatal_retry_window =>
                    {
                        tripped = Some(format!(
                            "fatal output pattern `{}` repeated within {}s",
                            pattern.label,
                            self.config.fatal_retry_window.as_secs()
                        ));
                        break;
                    }
                    _ => *armed = Some(now),
                }
            }
        }
        if let Some(reason) = tripped {
            self.trigger(WatchdogTrigger::FatalPattern, reason, None);
        }
    }

    /// Appends `text` to the stream's pending buffer and drains every
    /// complete line.
    fn buffer_lines(&self, source: OutputSource, text: &str) -> Vec<String> {
        let mut pending = lock(&self.pending_lines);
        let buf = match source {
            OutputSource::Stdout => &mut pending.stdout,
            OutputSource::Stderr => &mut pending.stderr,
        };
        buf.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            lines.push(line);
        }

        if buf.len() > PENDING_LINE_CAP {
            let mut cut = buf.len() - PENDING_LINE_CAP;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
        lines
    }

    fn scan_line(&self, line: &str) -> LineScan {
        let line = line.trim_end_matches(['\n', '\r']);
        if denial::is_operation_start(line) {
            lock(&self.denials).reset_all();
            tracing::debug!("sandbox operation marker observed; denial window reset");
            return LineScan::Ignored;
        }
        let Some(info) = DenialInfo::parse_line(line) else {
            return LineScan::Ignored;
        };
        let now_ms = self.started.elapsed().as_millis() as u64;
        let decision = lock(&self.denials).register(&info, now_ms);
        LineScan::Denial(info, decision)
    }
}
