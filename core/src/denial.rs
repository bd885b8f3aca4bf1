//! Sliding-window tracking of sandbox denials observed in process output.
//!
//! The sandbox wrapper around a supervised agent logs one marker line per
//! denied operation. The tracker turns that stream into an escalating
//! response: nothing, a warning, a forcible pause, or a fail-fast kill. It is
//! deliberately clock-free — callers pass a monotonic `now_ms` in — so every
//! decision is reproducible.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::DenialConfig;

/// Marker prefix for a denied operation, e.g. `sandbox: deny file-write /etc/passwd`.
pub const DENIAL_LINE_PREFIX: &str = "sandbox: deny ";

/// Marker prefix announcing a new sub-operation, e.g. `sandbox: begin npm-install`.
/// Seeing it resets the tracker so stale counts from an unrelated action
/// cannot force a false fail-fast.
pub const OPERATION_LINE_PREFIX: &str = "sandbox: begin ";

const MID_WINDOW_MS: u64 = 60_000;
const BURST_WINDOW_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialOperation {
    NetworkConnect,
    FileRead,
    FileWrite,
}

impl DenialOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialOperation::NetworkConnect => "network-connect",
            DenialOperation::FileRead => "file-read",
            DenialOperation::FileWrite => "file-write",
        }
    }
}

impl std::fmt::Display for DenialOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown sandbox operation: {0}")]
pub struct UnknownOperation(String);

impl FromStr for DenialOperation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "network-connect" => Ok(DenialOperation::NetworkConnect),
            "file-read" => Ok(DenialOperation::FileRead),
            "file-write" => Ok(DenialOperation::FileWrite),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

/// One denied operation, parsed from a marker line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialInfo {
    pub operation: DenialOperation,
    pub target: String,
}

impl DenialInfo {
    /// Parses a denial marker line. Returns `None` for anything that is not
    /// a well-formed marker, including unknown operations — the tracker only
    /// ever counts lines it fully understands.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(DENIAL_LINE_PREFIX)?;
        let (operation, target) = rest.split_once(' ')?;
        let operation = operation.parse().ok()?;
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        Some(Self {
            operation,
            target: target.to_string(),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.operation, self.target)
    }
}

/// Whether a line announces the start of a new sub-operation.
pub fn is_operation_start(line: &str) -> bool {
    line.starts_with(OPERATION_LINE_PREFIX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialAction {
    None,
    Warn,
    Delay,
    FailFast,
}

/// Outcome of one registration. `count` is occurrences of this
/// `(operation, target)` within the full window, including the current one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenialDecision {
    pub action: DenialAction,
    pub count: usize,
}

/// Per-key denial history with window-reset semantics.
///
/// A key's history is cleared outright when the gap since its most recent
/// timestamp exceeds the window (the window resets, it does not decay), and
/// is capped at `fail_fast_threshold` retained entries. Warning and delay
/// thresholds are exact-match crossings so each fires once; fail-fast is a
/// `>=` comparison and takes priority over both.
#[derive(Debug)]
pub struct DenialTracker {
    config: DenialConfig,
    history: HashMap<String, Vec<u64>>,
}

impl DenialTracker {
    pub fn new(config: DenialConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Records one denial at `now_ms` (monotonic, caller-defined origin) and
    /// classifies the key's current window.
    pub fn register(&mut self, info: &DenialInfo, now_ms: u64) -> DenialDecision {
        let window_ms = self.config.window.as_millis() as u64;
        let timestamps = self.history.entry(info.key()).or_default();

        if let Some(&last) = timestamps.last()
            && now_ms.saturating_sub(last) > window_ms
        {
            timestamps.clear();
        }
        timestamps.push(now_ms);

        let cap = self.config.fail_fast_threshold.max(1);
        if timestamps.len() > cap {
            let excess = timestamps.len() - cap;
            timestamps.drain(..excess);
        }

        let count_within = |span_ms: u64| {
            timestamps
                .iter()
                .filter(|&&ts| now_ms.saturating_sub(ts) <= span_ms)
                .count()
        };
        let within_window = count_within(window_ms);
        let within_minute = count_within(MID_WINDOW_MS);
        let within_burst = count_within(BURST_WINDOW_MS);

        let action = if within_window >= self.config.fail_fast_threshold {
            DenialAction::FailFast
        } else if within_minute == self.config.delay_threshold {
            DenialAction::Delay
        } else if within_burst == self.config.warning_threshold {
            DenialAction::Warn
        } else {
            DenialAction::None
        };

        DenialDecision {
            action,
            count: within_window,
        }
    }

    /// Clears every key's history. Called when the supervised process logs
    /// the start of an unrelated operation.
    pub fn reset_all(&mut self) {
        self.history.clear();
    }
}
