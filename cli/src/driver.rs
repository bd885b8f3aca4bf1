//! Wires roster agents into the competition engine.
//!
//! Each agent gets a private staging directory, a watchdog configured from
//! the CLI flags plus its own fatal patterns, and a line-prefixed view of
//! both output streams. A failed run is still a scoreboard entry: under the
//! continue policy the failure is folded back into the results, under the
//! abort policy it stops the rest of the field.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use bakeoff_core::CompetitionDriver;
use bakeoff_core::DenialInfo;
use bakeoff_core::FatalPattern;
use bakeoff_core::LaunchSpec;
use bakeoff_core::OutputSink;
use bakeoff_core::OutputSource;
use bakeoff_core::PreparedBatch;
use bakeoff_core::ResultComparator;
use bakeoff_core::SupervisedOutcome;
use bakeoff_core::WatchdogConfig;
use bakeoff_core::WatchdogEvents;
use bakeoff_core::WatchdogTrigger;
use bakeoff_core::run_supervised;
use serde::Serialize;
use tempfile::TempDir;

use crate::records::RunRecorder;
use crate::roster::AgentSpec;
use crate::roster::render_args;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where one agent ended up on the scoreboard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    Succeeded,
    Failed,
    /// Turned away during preparation; never ran.
    Rejected,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Succeeded => "succeeded",
            AgentStatus::Failed => "failed",
            AgentStatus::Rejected => "rejected",
        }
    }
}

/// One scoreboard entry.
#[derive(Clone, Debug)]
pub struct AgentOutcome {
    pub name: String,
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub trigger: Option<WatchdogTrigger>,
    /// Human-readable failure detail; `None` for successes.
    pub error: Option<String>,
    pub duration: Duration,
}

impl AgentOutcome {
    fn rejected(name: String, error: &anyhow::Error) -> Self {
        Self {
            name,
            status: AgentStatus::Rejected,
            exit_code: None,
            signal: None,
            trigger: None,
            error: Some(format!("{error:#}")),
            duration: Duration::ZERO,
        }
    }

    fn from_supervised(name: &str, supervised: SupervisedOutcome) -> Self {
        let succeeded = supervised.is_success();
        let SupervisedOutcome { process, watchdog } = supervised;
        let error = if succeeded {
            None
        } else if process.aborted {
            Some("force-aborted after unresponsive to signals".to_string())
        } else if let Some(reason) = watchdog.triggered_reason {
            Some(reason)
        } else if let Some(signal) = &process.signal {
            Some(format!("terminated by signal {signal}"))
        } else {
            Some(format!("exited with code {}", process.exit_code))
        };
        Self {
            name: name.to_string(),
            status: if succeeded {
                AgentStatus::Succeeded
            } else {
                AgentStatus::Failed
            },
            exit_code: Some(process.exit_code),
            signal: process.signal,
            trigger: watchdog.triggered,
            error,
            duration: process.duration,
        }
    }
}

/// A roster agent staged and ready to launch.
pub struct PreparedAgent {
    pub name: String,
    pub launch: LaunchSpec,
    pub fatal_patterns: Vec<FatalPattern>,
}

/// Prints agent output line by line, prefixed with the agent's name so
/// interleaved streams stay attributable. Watchdog banners come through the
/// same path and pick up the same prefix.
struct AgentSink {
    name: String,
    pending: Mutex<PendingLines>,
}

#[derive(Default)]
struct PendingLines {
    stdout: String,
    stderr: String,
}

impl AgentSink {
    fn new(name: String) -> Self {
        Self {
            name,
            pending: Mutex::new(PendingLines::default()),
        }
    }

    /// Appends `text` and returns the lines it completed.
    fn drain(pending: &mut String, text: &str) -> Vec<String> {
        pending.push_str(text);
        let mut lines = Vec::new();
        while let Some(newline) = pending.find('\n') {
            let rest = pending.split_off(newline + 1);
            let mut line = std::mem::replace(pending, rest);
            line.truncate(line.len() - 1);
            if line.ends_with('\r') {
                line.truncate(line.len() - 1);
            }
            lines.push(line);
        }
        lines
    }

    fn emit(&self, source: OutputSource, line: &str) {
        let name = &self.name;
        match source {
            OutputSource::Stdout => println!("[{name}] {line}"),
            OutputSource::Stderr => eprintln!("[{name}] {line}"),
        }
    }

    /// Flushes any unterminated final line once the process is gone.
    fn finish(&self) {
        let mut pending = lock(&self.pending);
        let pending = &mut *pending;
        for (source, buffer) in [
            (OutputSource::Stdout, &mut pending.stdout),
            (OutputSource::Stderr, &mut pending.stderr),
        ] {
            if !buffer.is_empty() {
                let line = std::mem::take(buffer);
                self.emit(source, &line);
            }
        }
    }
}

impl OutputSink for AgentSink {
    fn write_chunk(&self, source: OutputSource, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let lines = {
            let mut pending = lock(&self.pending);
            let buffer = match source {
                OutputSource::Stdout => &mut pending.stdout,
                OutputSource::Stderr => &mut pending.stderr,
            };
            Self::drain(buffer, &text)
        };
        for line in lines {
            self.emit(source, &line);
        }
    }
}

/// Logs watchdog triggers against the agent they belong to.
struct TriggerEvents {
    name: String,
}

impl WatchdogEvents for TriggerEvents {
    fn on_trigger(&self, trigger: WatchdogTrigger, reason: &str, _fail_fast: Option<&DenialInfo>) {
        tracing::warn!(
            agent = %self.name,
            trigger = %trigger,
            reason,
            "agent hit a supervision limit"
        );
    }
}

/// Competition driver for a roster of agent processes.
pub struct BakeoffDriver {
    task: String,
    watchdog: WatchdogConfig,
    staging: TempDir,
    capture_failures: bool,
    recorder: Arc<dyn RunRecorder>,
    /// Full outcomes for failed runs, parked between `execute` returning an
    /// error and the capture hook deciding whether to fold them back in.
    failed: Mutex<HashMap<usize, AgentOutcome>>,
}

impl BakeoffDriver {
    pub fn new(
        task: String,
        watchdog: WatchdogConfig,
        recorder: Arc<dyn RunRecorder>,
        capture_failures: bool,
    ) -> anyhow::Result<Self> {
        let staging = TempDir::new().context("failed to create the staging directory")?;
        Ok(Self {
            task,
            watchdog,
            staging,
            capture_failures,
            recorder,
            failed: Mutex::new(HashMap::new()),
        })
    }

    fn stage_agent(&self, spec: &AgentSpec) -> anyhow::Result<PreparedAgent> {
        // Only explicit paths can be checked cheaply here; bare names go
        // through PATH resolution at spawn time and fail there instead.
        if spec.command.contains('/') && !Path::new(&spec.command).is_file() {
            bail!("command `{}` not found", spec.command);
        }
        let fatal_patterns = spec
            .fatal_patterns
            .iter()
            .map(|pattern| FatalPattern::new(&pattern.label, &pattern.pattern))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid fatal pattern for agent `{}`", spec.name))?;
        let workdir = self.staging.path().join(&spec.name);
        std::fs::create_dir_all(&workdir)
            .with_context(|| format!("failed to stage workdir for agent `{}`", spec.name))?;
        Ok(PreparedAgent {
            name: spec.name.clone(),
            launch: LaunchSpec {
                program: spec.command.clone(),
                args: render_args(&spec.args, &self.task),
                cwd: workdir,
                env: spec.env.clone(),
            },
            fatal_patterns,
        })
    }

    fn agent_config(&self, prepared: &PreparedAgent) -> WatchdogConfig {
        let mut config = self.watchdog.clone();
        config
            .fatal_patterns
            .extend(prepared.fatal_patterns.iter().cloned());
        config
    }
}

fn status_rank(outcome: &AgentOutcome) -> u8 {
    match outcome.status {
        AgentStatus::Succeeded => 0,
        AgentStatus::Failed => 1,
        AgentStatus::Rejected => 2,
    }
}

#[async_trait]
impl CompetitionDriver for BakeoffDriver {
    type Candidate = AgentSpec;
    type Prepared = PreparedAgent;
    type Outcome = AgentOutcome;

    async fn on_queued(&self, _index: usize, candidate: &AgentSpec) {
        self.recorder.record_queued(&candidate.name);
        tracing::info!(agent = %candidate.name, "agent queued");
    }

    async fn prepare(
        &self,
        candidates: Vec<AgentSpec>,
    ) -> anyhow::Result<PreparedBatch<PreparedAgent, AgentOutcome>> {
        let mut batch = PreparedBatch {
            ready: Vec::new(),
            failures: Vec::new(),
        };
        for spec in candidates {
            match self.stage_agent(&spec) {
                Ok(prepared) => batch.ready.push(prepared),
                Err(error) => {
                    tracing::warn!(agent = %spec.name, "agent rejected: {error:#}");
                    let outcome = AgentOutcome::rejected(spec.name, &error);
                    self.recorder.record_finished(&outcome);
                    batch.failures.push(outcome);
                }
            }
        }
        Ok(batch)
    }

    async fn execute(&self, index: usize, prepared: &PreparedAgent) -> anyhow::Result<AgentOutcome> {
        let sink = Arc::new(AgentSink::new(prepared.name.clone()));
        let events = Arc::new(TriggerEvents {
            name: prepared.name.clone(),
        });
        let supervised = run_supervised(
            prepared.launch.clone(),
            self.agent_config(prepared),
            events,
            sink.clone(),
        )
        .await
        .with_context(|| format!("failed to launch agent `{}`", prepared.name))?;
        sink.finish();

        let outcome = AgentOutcome::from_supervised(&prepared.name, supervised);
        if outcome.status == AgentStatus::Succeeded {
            return Ok(outcome);
        }
        let detail = outcome
            .error
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        lock(&self.failed).insert(index, outcome);
        Err(anyhow!("agent `{}` failed: {detail}", prepared.name))
    }

    async fn on_running(&self, _index: usize, prepared: &PreparedAgent) {
        self.recorder.record_running(&prepared.name);
        tracing::info!(agent = %prepared.name, "agent running");
    }

    async fn on_completed(&self, _index: usize, prepared: &PreparedAgent, outcome: &AgentOutcome) {
        self.recorder.record_finished(outcome);
        tracing::info!(
            agent = %prepared.name,
            duration_ms = outcome.duration.as_millis() as u64,
            "agent finished"
        );
    }

    async fn on_execution_failure(
        &self,
        index: usize,
        prepared: &PreparedAgent,
        error: &anyhow::Error,
    ) -> Option<AgentOutcome> {
        let outcome = lock(&self.failed).remove(&index).unwrap_or_else(|| AgentOutcome {
            name: prepared.name.clone(),
            status: AgentStatus::Failed,
            exit_code: None,
            signal: None,
            trigger: None,
            error: Some(format!("{error:#}")),
            duration: Duration::ZERO,
        });
        // Every status change is recorded, even when the abort policy drops
        // the outcome from the returned results.
        self.recorder.record_finished(&outcome);
        if self.capture_failures {
            Some(outcome)
        } else {
            None
        }
    }

    async fn cleanup(&self, _index: usize, prepared: &PreparedAgent) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(&prepared.launch.cwd).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("failed to remove workdir for agent `{}`", prepared.name))),
        }
    }

    /// Fastest clean finisher first, then failures, then rejections.
    fn comparator(&self) -> Option<ResultComparator<AgentOutcome>> {
        Some(Box::new(|a, b| {
            status_rank(a)
                .cmp(&status_rank(b))
                .then_with(|| a.duration.cmp(&b.duration))
        }))
    }
}
