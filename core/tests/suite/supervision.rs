//! Supervision tests against real child processes: each one spawns a shell
//! script engineered to misbehave in a specific way and asserts that the
//! watchdog puts it down, including its whole process group.

#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use bakeoff_core::DenialConfig;
use bakeoff_core::DenialInfo;
use bakeoff_core::DenialOperation;
use bakeoff_core::FatalPattern;
use bakeoff_core::LaunchSpec;
use bakeoff_core::NoopEvents;
use bakeoff_core::OutputSink;
use bakeoff_core::OutputSource;
use bakeoff_core::WatchdogConfig;
use bakeoff_core::WatchdogTrigger;
use bakeoff_core::run_supervised;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[derive(Default)]
struct CollectingSink {
    chunks: Mutex<Vec<(OutputSource, Vec<u8>)>>,
}

impl CollectingSink {
    fn stderr_text(&self) -> String {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(source, _)| *source == OutputSource::Stderr)
            .map(|(_, chunk)| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }
}

impl OutputSink for CollectingSink {
    fn write_chunk(&self, source: OutputSource, chunk: &[u8]) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((source, chunk.to_vec()));
    }
}

fn shell(script: &str) -> LaunchSpec {
    LaunchSpec {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: std::env::temp_dir(),
        env: HashMap::new(),
    }
}

fn quick_config() -> WatchdogConfig {
    WatchdogConfig {
        silence_timeout: Duration::from_millis(400),
        wall_clock_cap: Duration::from_secs(60),
        fatal_retry_window: Duration::from_secs(60),
        kill_grace: Duration::from_secs(2),
        hard_abort: Duration::from_secs(5),
        fatal_patterns: Vec::new(),
        denial: DenialConfig::default(),
    }
}

/// A process that prints once and then hangs is killed by the silence
/// deadline, with the banner on its stderr.
#[tokio::test]
async fn silence_timeout_terminates_a_hung_process() -> anyhow::Result<()> {
    let sink = Arc::new(CollectingSink::default());
    let outcome = run_supervised(
        shell("echo started; sleep 30"),
        quick_config(),
        Arc::new(NoopEvents),
        sink.clone(),
    )
    .await?;

    assert_eq!(outcome.watchdog.triggered, Some(WatchdogTrigger::Silence));
    assert_eq!(outcome.process.signal.as_deref(), Some("SIGTERM"));
    assert_eq!(outcome.process.exit_code, 143);
    assert!(!outcome.process.aborted);
    assert!(!outcome.is_success());
    assert!(outcome.process.duration < Duration::from_secs(10));
    assert!(sink.stderr_text().contains("[watchdog]"));
    Ok(())
}

/// A process that shrugs off SIGTERM gets SIGKILL after the grace period.
#[tokio::test]
async fn sigterm_immune_process_falls_to_sigkill() -> anyhow::Result<()> {
    let mut config = quick_config();
    config.silence_timeout = Duration::from_millis(300);
    config.kill_grace = Duration::from_millis(500);

    let outcome = run_supervised(
        shell("trap '' TERM; echo up; sleep 30"),
        config,
        Arc::new(NoopEvents),
        Arc::new(CollectingSink::default()),
    )
    .await?;

    assert_eq!(outcome.watchdog.triggered, Some(WatchdogTrigger::Silence));
    assert_eq!(outcome.process.signal.as_deref(), Some("SIGKILL"));
    assert_eq!(outcome.process.exit_code, 137);
    assert!(!outcome.process.aborted);
    assert!(outcome.process.duration < Duration::from_secs(10));
    Ok(())
}

/// Constant output does not save a process from the wall-clock cap.
#[tokio::test]
async fn wall_clock_cap_fires_despite_output() -> anyhow::Result<()> {
    let mut config = quick_config();
    config.silence_timeout = Duration::from_secs(30);
    config.wall_clock_cap = Duration::from_millis(600);

    let outcome = run_supervised(
        shell("while true; do echo tick; sleep 0.1; done"),
        config,
        Arc::new(NoopEvents),
        Arc::new(CollectingSink::default()),
    )
    .await?;

    assert_eq!(outcome.watchdog.triggered, Some(WatchdogTrigger::WallClock));
    let reason = outcome.watchdog.triggered_reason.unwrap_or_default();
    assert!(reason.contains("wall-clock cap"), "reason was: {reason}");
    assert!(outcome.process.duration < Duration::from_secs(10));
    Ok(())
}

/// Four denials for the same target within the window trip the fail-fast
/// threshold and the offending operation rides along in the state.
#[tokio::test]
async fn denial_flood_fails_fast() -> anyhow::Result<()> {
    let mut config = quick_config();
    config.silence_timeout = Duration::from_secs(30);
    config.denial = DenialConfig {
        window: Duration::from_secs(120),
        warning_threshold: 2,
        delay_threshold: 3,
        fail_fast_threshold: 4,
        delay_pause: Duration::from_millis(50),
    };

    let script =
        r#"for i in 1 2 3 4; do echo "sandbox: deny file-write /etc/passwd" >&2; done; sleep 30"#;
    let outcome = run_supervised(
        shell(script),
        config,
        Arc::new(NoopEvents),
        Arc::new(CollectingSink::default()),
    )
    .await?;

    assert_eq!(
        outcome.watchdog.triggered,
        Some(WatchdogTrigger::SandboxDenial)
    );
    assert_eq!(
        outcome.watchdog.sandbox_fail_fast,
        Some(DenialInfo {
            operation: DenialOperation::FileWrite,
            target: "/etc/passwd".to_string(),
        })
    );
    assert!(outcome.process.signal.is_some());
    assert!(outcome.process.duration < Duration::from_secs(10));
    Ok(())
}

/// The kill reaches the whole process group: a grandchild that keeps
/// heartbeating to a file must stop when the parent is put down.
#[tokio::test]
async fn group_termination_reaches_grandchildren() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let beats = dir.path().join("beats");
    let script = r#"( while true; do echo beat >> "$BEATS"; sleep 0.05; done ) & sleep 30"#;

    let mut spec = shell(script);
    spec.env.insert(
        "BEATS".to_string(),
        beats.to_string_lossy().into_owned(),
    );

    let outcome = run_supervised(
        spec,
        quick_config(),
        Arc::new(NoopEvents),
        Arc::new(CollectingSink::default()),
    )
    .await?;
    assert_eq!(outcome.watchdog.triggered, Some(WatchdogTrigger::Silence));

    let after_kill = std::fs::read_to_string(&beats).unwrap_or_default();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = std::fs::read_to_string(&beats).unwrap_or_default();
    assert_eq!(after_kill.len(), later.len(), "grandchild kept writing");
    Ok(())
}

/// One sighting of a fatal pattern arms it; the second one, close behind,
/// pulls the trigger with the pattern's label in the reason.
#[tokio::test]
async fn fatal_pattern_needs_two_sightings() -> anyhow::Result<()> {
    let mut config = quick_config();
    config.silence_timeout = Duration::from_secs(30);
    config.fatal_patterns = vec![FatalPattern::new("provider-quota", "quota exhausted")?];

    let script = r#"echo "FATAL: quota exhausted"; sleep 0.2; echo "FATAL: quota exhausted"; sleep 30"#;
    let outcome = run_supervised(
        shell(script),
        config,
        Arc::new(NoopEvents),
        Arc::new(CollectingSink::default()),
    )
    .await?;

    assert_eq!(
        outcome.watchdog.triggered,
        Some(WatchdogTrigger::FatalPattern)
    );
    let reason = outcome.watchdog.triggered_reason.unwrap_or_default();
    assert!(reason.contains("provider-quota"), "reason was: {reason}");
    Ok(())
}
