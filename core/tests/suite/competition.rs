//! End-to-end competition runs against an instrumented driver, exercising
//! the public engine API the way the CLI consumes it.

use std::cmp::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use async_trait::async_trait;
use bakeoff_core::CompetitionDriver;
use bakeoff_core::CompetitionError;
use bakeoff_core::FailurePolicy;
use bakeoff_core::PreparedBatch;
use bakeoff_core::ResultComparator;
use bakeoff_core::run_competition;
use pretty_assertions::assert_eq;

#[derive(Clone, Debug)]
struct AgentPlan {
    name: String,
    work: Duration,
    fails: bool,
}

fn plan(name: &str, work_ms: u64, fails: bool) -> AgentPlan {
    AgentPlan {
        name: name.to_string(),
        work: Duration::from_millis(work_ms),
        fails,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RunReport {
    name: String,
    succeeded: bool,
}

struct InstrumentedDriver {
    capture_failures: bool,
    rank_results: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<String>>,
    cleaned: Mutex<Vec<String>>,
}

impl InstrumentedDriver {
    fn new(capture_failures: bool) -> Self {
        Self {
            capture_failures,
            rank_results: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cleaned(&self) -> Vec<String> {
        let mut names = self
            .cleaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl CompetitionDriver for InstrumentedDriver {
    type Candidate = AgentPlan;
    type Prepared = AgentPlan;
    type Outcome = RunReport;

    async fn prepare(
        &self,
        candidates: Vec<AgentPlan>,
    ) -> anyhow::Result<PreparedBatch<AgentPlan, RunReport>> {
        let mut batch = PreparedBatch {
            ready: Vec::new(),
            failures: Vec::new(),
        };
        for candidate in candidates {
            if candidate.name.contains("unconfigured") {
                batch.failures.push(RunReport {
                    name: candidate.name,
                    succeeded: false,
                });
            } else {
                batch.ready.push(candidate);
            }
        }
        Ok(batch)
    }

    async fn execute(&self, _index: usize, prepared: &AgentPlan) -> anyhow::Result<RunReport> {
        let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, AtomicOrdering::SeqCst);
        tokio::time::sleep(prepared.work).await;
        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);

        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prepared.name.clone());
        if prepared.fails {
            anyhow::bail!("agent {} crashed", prepared.name);
        }
        Ok(RunReport {
            name: prepared.name.clone(),
            succeeded: true,
        })
    }

    async fn on_execution_failure(
        &self,
        _index: usize,
        prepared: &AgentPlan,
        _error: &anyhow::Error,
    ) -> Option<RunReport> {
        if self.capture_failures {
            Some(RunReport {
                name: prepared.name.clone(),
                succeeded: false,
            })
        } else {
            None
        }
    }

    async fn cleanup(&self, _index: usize, prepared: &AgentPlan) -> anyhow::Result<()> {
        self.cleaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prepared.name.clone());
        Ok(())
    }

    fn comparator(&self) -> Option<ResultComparator<RunReport>> {
        if self.rank_results {
            // Successes ahead of failures, names as tie-break.
            Some(Box::new(|a, b| match (a.succeeded, b.succeeded) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => a.name.cmp(&b.name),
            }))
        } else {
            None
        }
    }
}

/// Five agents, two slots, one mid-field crash that the driver captures:
/// the run stays green, reports one entry per agent, and never exceeds the
/// parallelism cap.
#[tokio::test(start_paused = true)]
async fn captured_crash_keeps_a_full_scoreboard() -> anyhow::Result<()> {
    let driver = InstrumentedDriver::new(true);
    let field = vec![
        plan("alpha", 10, false),
        plan("bravo", 10, false),
        plan("charlie", 10, false),
        plan("delta", 10, true),
        plan("echo", 10, false),
    ];

    let results = run_competition(&driver, field, 2, FailurePolicy::Continue).await?;

    assert_eq!(results.len(), 5);
    let delta = results
        .iter()
        .find(|report| report.name == "delta")
        .cloned();
    assert_eq!(
        delta,
        Some(RunReport {
            name: "delta".to_string(),
            succeeded: false,
        })
    );
    assert_eq!(results.iter().filter(|report| report.succeeded).count(), 4);
    assert!(driver.max_in_flight.load(AtomicOrdering::SeqCst) <= 2);
    assert_eq!(
        driver.cleaned(),
        vec!["alpha", "bravo", "charlie", "delta", "echo"]
    );
    Ok(())
}

/// Abort policy with no capture hook: the crash is the run's error, agents
/// not yet claimed never execute, and every started agent is still cleaned.
#[tokio::test(start_paused = true)]
async fn abort_policy_stops_the_rest_of_the_field() {
    let driver = InstrumentedDriver::new(false);
    let field = vec![
        plan("alpha", 30, false),
        plan("bravo", 10, true),
        plan("charlie", 10, false),
        plan("delta", 10, false),
        plan("echo", 10, false),
    ];

    let result = run_competition(&driver, field, 2, FailurePolicy::Abort).await;

    let Err(CompetitionError::Failure(error)) = result else {
        panic!("the crash should surface as the run error");
    };
    assert!(error.to_string().contains("agent bravo crashed"));

    let executed = driver.executed();
    assert!(executed.contains(&"alpha".to_string()));
    assert!(executed.contains(&"bravo".to_string()));
    assert!(!executed.contains(&"charlie".to_string()));
    assert_eq!(driver.cleaned(), vec!["alpha", "bravo"]);
}

/// Preparation rejections and execution results rank together under the
/// driver's comparator, with successes sorted ahead of failures.
#[tokio::test(start_paused = true)]
async fn ranking_covers_preparation_rejections_too() -> anyhow::Result<()> {
    let mut driver = InstrumentedDriver::new(true);
    driver.rank_results = true;
    let field = vec![
        plan("unconfigured-zed", 10, false),
        plan("alpha", 10, true),
        plan("bravo", 10, false),
    ];

    let results = run_competition(&driver, field, 2, FailurePolicy::Continue).await?;

    let names: Vec<&str> = results.iter().map(|report| report.name.as_str()).collect();
    assert_eq!(names, vec!["bravo", "alpha", "unconfigured-zed"]);
    assert!(results[0].succeeded);
    assert!(!results[1].succeeded);
    Ok(())
}
