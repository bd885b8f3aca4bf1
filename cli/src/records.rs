//! Durable per-agent run records.
//!
//! Recording is best-effort telemetry: a failed write is logged and the run
//! carries on. Every status change an agent goes through lands as one JSONL
//! line, so a crashed run still leaves a usable trail.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Context;
use bakeoff_core::WatchdogTrigger;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::driver::AgentOutcome;
use crate::driver::AgentStatus;

/// Sink for per-agent lifecycle records.
pub trait RunRecorder: Send + Sync {
    fn record_queued(&self, agent: &str);
    fn record_running(&self, agent: &str);
    fn record_finished(&self, outcome: &AgentOutcome);
}

/// Recorder used when no record file was requested.
#[derive(Default)]
pub struct NoopRecorder;

impl RunRecorder for NoopRecorder {
    fn record_queued(&self, _agent: &str) {}
    fn record_running(&self, _agent: &str) {}
    fn record_finished(&self, _outcome: &AgentOutcome) {}
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RecordLine<'a> {
    AgentQueued {
        run_id: &'a str,
        at: String,
        agent: &'a str,
    },
    AgentRunning {
        run_id: &'a str,
        at: String,
        agent: &'a str,
    },
    AgentFinished {
        run_id: &'a str,
        at: String,
        agent: &'a str,
        status: &'a AgentStatus,
        exit_code: Option<i32>,
        signal: Option<&'a str>,
        trigger: Option<&'a WatchdogTrigger>,
        error: Option<&'a str>,
        duration_ms: u64,
    },
}

/// Appends one JSON object per line to a record file.
pub struct JsonlRecorder {
    run_id: String,
    file: Mutex<File>,
}

impl JsonlRecorder {
    /// Opens `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open record file at {}", path.display()))?;
        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            file: Mutex::new(file),
        })
    }

    fn append(&self, line: &RecordLine) {
        let serialized = match serde_json::to_string(line) {
            Ok(serialized) => serialized,
            Err(error) => {
                tracing::warn!("failed to serialize run record: {error}");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(error) = writeln!(file, "{serialized}") {
            tracing::warn!("failed to append run record: {error}");
        }
    }

    fn timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl RunRecorder for JsonlRecorder {
    fn record_queued(&self, agent: &str) {
        self.append(&RecordLine::AgentQueued {
            run_id: &self.run_id,
            at: Self::timestamp(),
            agent,
        });
    }

    fn record_running(&self, agent: &str) {
        self.append(&RecordLine::AgentRunning {
            run_id: &self.run_id,
            at: Self::timestamp(),
            agent,
        });
    }

    fn record_finished(&self, outcome: &AgentOutcome) {
        self.append(&RecordLine::AgentFinished {
            run_id: &self.run_id,
            at: Self::timestamp(),
            agent: &outcome.name,
            status: &outcome.status,
            exit_code: outcome.exit_code,
            signal: outcome.signal.as_deref(),
            trigger: outcome.trigger.as_ref(),
            error: outcome.error.as_deref(),
            duration_ms: outcome.duration.as_millis() as u64,
        });
    }
}
