use std::time::Duration;

use crate::watchdog::FatalPattern;

/// No output for this long and the process is presumed hung.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Absolute lifetime cap, independent of activity.
pub const DEFAULT_WALL_CLOCK_CAP: Duration = Duration::from_secs(120 * 60);

/// A fatal pattern must repeat within this window of its first sighting.
pub const DEFAULT_FATAL_RETRY_WINDOW: Duration = Duration::from_secs(60);

/// Time between SIGTERM and SIGKILL during escalation.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Time between SIGKILL and giving up on the process ever exiting.
pub const DEFAULT_HARD_ABORT: Duration = Duration::from_secs(10);

/// Sliding window over which same-target denials are counted.
pub const DEFAULT_DENIAL_WINDOW: Duration = Duration::from_secs(120);

/// How long the delay action keeps the process stopped.
pub const DEFAULT_DENIAL_DELAY_PAUSE: Duration = Duration::from_secs(2);

pub const DEFAULT_DENIAL_WARNING_THRESHOLD: usize = 3;
pub const DEFAULT_DENIAL_DELAY_THRESHOLD: usize = 5;
pub const DEFAULT_DENIAL_FAIL_FAST_THRESHOLD: usize = 10;

/// Everything one watchdog instance needs, built once at startup and passed
/// in by value — there are no module-level defaults to mutate.
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// Silence trigger threshold; the only timer reset during normal
    /// operation (every output chunk resets it).
    pub silence_timeout: Duration,
    /// Wall-clock trigger threshold, measured from process start.
    pub wall_clock_cap: Duration,
    /// Second sighting of a fatal pattern must land within this window of
    /// the first, otherwise the sighting only re-arms.
    pub fatal_retry_window: Duration,
    pub kill_grace: Duration,
    pub hard_abort: Duration,
    /// Per-agent fatal output patterns; empty disables that trigger source.
    pub fatal_patterns: Vec<FatalPattern>,
    pub denial: DenialConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            wall_clock_cap: DEFAULT_WALL_CLOCK_CAP,
            fatal_retry_window: DEFAULT_FATAL_RETRY_WINDOW,
            kill_grace: DEFAULT_KILL_GRACE,
            hard_abort: DEFAULT_HARD_ABORT,
            fatal_patterns: Vec::new(),
            denial: DenialConfig::default(),
        }
    }
}

/// Thresholds for the denial backoff tracker.
///
/// The warning and delay thresholds are exact-match crossings (the action
/// fires once as the count passes them); fail-fast is a ≥ comparison and
/// wins over both.
#[derive(Clone, Debug)]
pub struct DenialConfig {
    pub window: Duration,
    pub warning_threshold: usize,
    pub delay_threshold: usize,
    pub fail_fast_threshold: usize,
    /// How long the delay action suspends the process group.
    pub delay_pause: Duration,
}

impl Default for DenialConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_DENIAL_WINDOW,
            warning_threshold: DEFAULT_DENIAL_WARNING_THRESHOLD,
            delay_threshold: DEFAULT_DENIAL_DELAY_THRESHOLD,
            fail_fast_threshold: DEFAULT_DENIAL_FAIL_FAST_THRESHOLD,
            delay_pause: DEFAULT_DENIAL_DELAY_PAUSE,
        }
    }
}
