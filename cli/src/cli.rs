use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

/// Run a roster of sandboxed coding agents against one task and report the
/// first clean finisher.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Task prompt handed to every agent. Roster arguments containing the
    /// `{task}` placeholder receive this text verbatim.
    #[arg(value_name = "TASK")]
    pub task: String,

    /// Path to the agent roster file (YAML).
    #[arg(long, short = 'r', value_name = "FILE", default_value = "agents.yaml")]
    pub roster: PathBuf,

    /// Maximum number of agents running at once.
    #[arg(long, short = 'j', value_name = "N", default_value_t = 2)]
    pub max_parallel: usize,

    /// What the run does after one agent fails: keep the rest going, or stop
    /// admitting new agents while in-flight ones finish.
    #[arg(long, value_enum, default_value_t = FailurePolicyArg::Continue)]
    pub failure_policy: FailurePolicyArg,

    /// Append one JSONL record per agent status change to this file.
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,

    /// Seconds an agent may stay silent before it is presumed hung.
    #[arg(long, value_name = "SECS")]
    pub silence_timeout_secs: Option<u64>,

    /// Hard cap on each agent's total runtime, in seconds.
    #[arg(long, value_name = "SECS")]
    pub wall_clock_cap_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum FailurePolicyArg {
    /// Let every remaining agent run; failures become part of the scoreboard.
    #[default]
    Continue,
    /// Stop claiming queued agents after the first failure.
    Abort,
}

impl From<FailurePolicyArg> for bakeoff_core::FailurePolicy {
    fn from(value: FailurePolicyArg) -> Self {
        match value {
            FailurePolicyArg::Continue => bakeoff_core::FailurePolicy::Continue,
            FailurePolicyArg::Abort => bakeoff_core::FailurePolicy::Abort,
        }
    }
}
