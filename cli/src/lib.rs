//! Command-line front end for the bake-off engine.
//!
//! Loads an agent roster, competes the agents on one task under process
//! supervision, prints a scoreboard, and names the winner.

use std::sync::Arc;
use std::time::Duration;

use bakeoff_core::FailurePolicy;
use bakeoff_core::WatchdogConfig;
use bakeoff_core::run_competition;
use tracing_subscriber::EnvFilter;

pub mod cli;
pub mod driver;
pub mod records;
pub mod roster;

pub use cli::Cli;

use crate::driver::AgentOutcome;
use crate::driver::AgentStatus;
use crate::driver::BakeoffDriver;
use crate::records::JsonlRecorder;
use crate::records::NoopRecorder;
use crate::records::RunRecorder;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    // try_init keeps embedding callers (and tests) from tripping over an
    // already-installed subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let agents = roster::load_roster(&cli.roster)?;

    let recorder: Arc<dyn RunRecorder> = match &cli.record {
        Some(path) => Arc::new(JsonlRecorder::create(path)?),
        None => Arc::new(NoopRecorder),
    };

    let mut watchdog = WatchdogConfig::default();
    if let Some(secs) = cli.silence_timeout_secs {
        watchdog.silence_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.wall_clock_cap_secs {
        watchdog.wall_clock_cap = Duration::from_secs(secs);
    }

    let policy = FailurePolicy::from(cli.failure_policy);
    // Abort runs treat the first failure as fatal; everything else keeps
    // failures on the scoreboard.
    let capture_failures = policy == FailurePolicy::Continue;
    let driver = BakeoffDriver::new(cli.task, watchdog, recorder, capture_failures)?;

    tracing::info!(
        agents = agents.len(),
        max_parallel = cli.max_parallel,
        "starting bake-off"
    );
    let results = run_competition(&driver, agents, cli.max_parallel, policy).await?;

    print_scoreboard(&results);
    let winner = results
        .first()
        .filter(|outcome| outcome.status == AgentStatus::Succeeded);
    match winner {
        Some(winner) => {
            tracing::info!(
                agent = %winner.name,
                duration_ms = winner.duration.as_millis() as u64,
                "bake-off won"
            );
            println!("winner: {} ({:.1}s)", winner.name, winner.duration.as_secs_f64());
            Ok(())
        }
        None => anyhow::bail!("no agent completed the task"),
    }
}

fn print_scoreboard(results: &[AgentOutcome]) {
    println!();
    println!("{:<20} {:<10} {:>9}  {}", "AGENT", "STATUS", "TIME", "DETAIL");
    for outcome in results {
        let detail = outcome.error.as_deref().unwrap_or("-");
        println!(
            "{:<20} {:<10} {:>8.1}s  {detail}",
            outcome.name,
            outcome.status.as_str(),
            outcome.duration.as_secs_f64(),
        );
    }
    println!();
}
