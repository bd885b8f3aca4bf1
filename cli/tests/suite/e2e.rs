//! Whole-run tests through [`bakeoff_cli::run_main`] with real shell agents.

#![cfg(unix)]

use std::path::Path;
use std::path::PathBuf;

use bakeoff_cli::Cli;
use bakeoff_cli::cli::FailurePolicyArg;
use bakeoff_cli::run_main;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn write_roster(dir: &Path, yaml: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("agents.yaml");
    std::fs::write(&path, yaml)?;
    Ok(path)
}

fn cli(task: &str, roster: PathBuf, record: Option<PathBuf>) -> Cli {
    Cli {
        task: task.to_string(),
        roster,
        max_parallel: 2,
        failure_policy: FailurePolicyArg::Continue,
        record,
        silence_timeout_secs: None,
        wall_clock_cap_secs: None,
    }
}

/// A mixed field resolves with a winner and a complete record trail.
#[tokio::test]
async fn mixed_field_names_a_winner_and_records_everything() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let roster = write_roster(
        dir.path(),
        r#"
agents:
  - name: winner
    command: /bin/sh
    args: ["-c", "echo did {task}"]
  - name: loser
    command: /bin/sh
    args: ["-c", "echo giving up >&2; exit 1"]
  - name: benched
    command: /bin/sh
    enabled: false
"#,
    )?;
    let record = dir.path().join("run.jsonl");

    run_main(cli("the task", roster, Some(record.clone()))).await?;

    let raw = std::fs::read_to_string(&record)?;
    let lines: Vec<serde_json::Value> = raw
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 6);

    let queued: Vec<&str> = lines
        .iter()
        .filter(|line| line["event"] == "agent_queued")
        .filter_map(|line| line["agent"].as_str())
        .collect();
    assert_eq!(queued, vec!["winner", "loser"]);

    let running = lines
        .iter()
        .filter(|line| line["event"] == "agent_running")
        .count();
    assert_eq!(running, 2);

    let mut statuses: Vec<(&str, &str)> = lines
        .iter()
        .filter(|line| line["event"] == "agent_finished")
        .filter_map(|line| Some((line["agent"].as_str()?, line["status"].as_str()?)))
        .collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![("loser", "failed"), ("winner", "succeeded")]);
    Ok(())
}

/// When nobody finishes cleanly the run itself fails.
#[tokio::test]
async fn all_failures_fail_the_run() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let roster = write_roster(
        dir.path(),
        r#"
agents:
  - name: first
    command: /bin/sh
    args: ["-c", "exit 1"]
  - name: second
    command: /bin/sh
    args: ["-c", "exit 2"]
"#,
    )?;

    let result = run_main(cli("the task", roster, None)).await;
    let Err(error) = result else {
        panic!("a field with no finisher should fail the run");
    };
    assert!(error.to_string().contains("no agent completed the task"));
    Ok(())
}

/// An unreadable roster is reported before anything launches.
#[tokio::test]
async fn missing_roster_is_an_error() {
    let result = run_main(cli(
        "the task",
        PathBuf::from("/definitely/not/agents.yaml"),
        None,
    ))
    .await;
    let Err(error) = result else {
        panic!("a missing roster should fail the run");
    };
    assert!(format!("{error:#}").contains("failed to read roster"));
}

/// The abort policy turns the first failure into a run-level error.
#[tokio::test]
async fn abort_policy_surfaces_the_first_failure() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let roster = write_roster(
        dir.path(),
        r#"
agents:
  - name: doomed
    command: /bin/sh
    args: ["-c", "exit 9"]
"#,
    )?;

    let mut cli = cli("the task", roster, None);
    cli.failure_policy = FailurePolicyArg::Abort;
    let result = run_main(cli).await;
    let Err(error) = result else {
        panic!("the abort policy should fail the run");
    };
    assert!(format!("{error:#}").contains("agent `doomed` failed"));
    Ok(())
}
