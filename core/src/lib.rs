//! Core engine for running agent competitions.
//!
//! A competition takes N candidate agents, stages them, runs at most
//! `max_parallel` of them concurrently against the same task, and collects
//! one result per candidate no matter how each of them ends. Every running
//! process is supervised: a watchdog kills anything that goes silent, runs
//! past its wall-clock cap, repeats a fatal output pattern, or floods the
//! sandbox with denied operations.
//!
//! # Modules
//!
//! - [`competition`] - Top-level queue/prepare/execute/finalize engine
//! - [`pool`] - Bounded worker pool with atomic index claiming
//! - [`watchdog`] - Per-process supervision and trigger latch
//! - [`denial`] - Sliding-window sandbox denial tracker
//! - [`process`] - Process-group signaling and termination escalation
//! - [`spawn`] - Supervised child process launching
//! - [`config`] - Timing and threshold configuration
//! - [`error`] - Error taxonomy shared across the engine

pub mod competition;
pub mod config;
pub mod denial;
pub mod error;
pub mod pool;
pub mod process;
pub mod spawn;
pub mod watchdog;

pub use competition::CompetitionDriver;
pub use competition::PreparedBatch;
pub use competition::ResultComparator;
pub use competition::run_competition;
pub use config::DenialConfig;
pub use config::WatchdogConfig;
pub use denial::DenialAction;
pub use denial::DenialDecision;
pub use denial::DenialInfo;
pub use denial::DenialOperation;
pub use error::AggregateFailure;
pub use error::CompetitionError;
pub use error::SpawnError;
pub use pool::FailurePolicy;
pub use pool::PoolDriver;
pub use pool::run_pool;
pub use spawn::LaunchSpec;
pub use spawn::ProcessOutcome;
pub use spawn::SupervisedOutcome;
pub use spawn::run_supervised;
pub use watchdog::FatalPattern;
pub use watchdog::NoopEvents;
pub use watchdog::NullSink;
pub use watchdog::OutputSink;
pub use watchdog::OutputSource;
pub use watchdog::Watchdog;
pub use watchdog::WatchdogEvents;
pub use watchdog::WatchdogState;
pub use watchdog::WatchdogTrigger;
