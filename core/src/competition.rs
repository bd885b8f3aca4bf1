//! Competition execution engine.
//!
//! Drives a field of candidates through five strictly ordered phases: queue
//! notifications, one batched preparation call, bounded-parallel execution
//! via [`run_pool`], a finalize hook that runs no matter what happened
//! before it, and final aggregation. Preparation failures skip execution
//! entirely but still appear in the final result list, and an optional
//! comparator orders that list as a whole.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::CompetitionError;
use crate::pool::FailurePolicy;
use crate::pool::PoolDriver;
use crate::pool::run_pool;

/// Total order over final results; smaller sorts first.
pub type ResultComparator<R> = Box<dyn Fn(&R, &R) -> Ordering + Send + Sync>;

/// What the batched preparation phase produced.
pub struct PreparedBatch<P, R> {
    /// Candidates that made it to execution, in competition order.
    pub ready: Vec<P>,
    /// Candidates rejected before execution. They fold straight into the
    /// final results without ever consuming a concurrency slot.
    pub failures: Vec<R>,
}

/// Lifecycle of one competition run.
///
/// `prepare` and `execute` are the required work; every other method is an
/// optional hook with a no-op default.
#[async_trait]
pub trait CompetitionDriver: Send + Sync {
    type Candidate: Send + Sync;
    type Prepared: Send + Sync;
    type Outcome: Send + Sync;

    /// Fires once per candidate, in input order, before any preparation.
    async fn on_queued(&self, _index: usize, _candidate: &Self::Candidate) {}

    /// Stages the whole field in one call. Cheap validation failures belong
    /// in [`PreparedBatch::failures`]; an `Err` here fails the run as a
    /// whole (finalize still runs).
    async fn prepare(
        &self,
        candidates: Vec<Self::Candidate>,
    ) -> anyhow::Result<PreparedBatch<Self::Prepared, Self::Outcome>>;

    /// Runs one prepared candidate to completion.
    async fn execute(
        &self,
        index: usize,
        prepared: &Self::Prepared,
    ) -> anyhow::Result<Self::Outcome>;

    /// Fires when a worker picks up `prepared`.
    async fn on_running(&self, _index: usize, _prepared: &Self::Prepared) {}

    /// Fires after a successful execution.
    async fn on_completed(
        &self,
        _index: usize,
        _prepared: &Self::Prepared,
        _outcome: &Self::Outcome,
    ) {
    }

    /// Offers an execution failure back as a substitute outcome; see
    /// [`PoolDriver::on_execution_failure`].
    async fn on_execution_failure(
        &self,
        _index: usize,
        _prepared: &Self::Prepared,
        _error: &anyhow::Error,
    ) -> Option<Self::Outcome> {
        None
    }

    /// Releases one prepared candidate; called exactly once for every
    /// candidate that started executing.
    async fn cleanup(&self, _index: usize, _prepared: &Self::Prepared) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs exactly once per competition, even when preparation or
    /// execution failed. Its error surfaces alongside any earlier one
    /// rather than replacing it.
    async fn finalize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Order for the final result list. `None` keeps arrival order:
    /// preparation failures first, then execution outcomes in candidate
    /// order.
    fn comparator(&self) -> Option<ResultComparator<Self::Outcome>> {
        None
    }
}

/// Bridges the competition driver onto the pool's per-item interface.
struct PoolAdapter<'a, D: ?Sized> {
    driver: &'a D,
}

#[async_trait]
impl<D> PoolDriver for PoolAdapter<'_, D>
where
    D: CompetitionDriver + ?Sized,
{
    type Item = D::Prepared;
    type Outcome = D::Outcome;

    async fn execute(&self, index: usize, item: &Self::Item) -> anyhow::Result<Self::Outcome> {
        self.driver.execute(index, item).await
    }

    async fn on_running(&self, index: usize, item: &Self::Item) {
        self.driver.on_running(index, item).await;
    }

    async fn on_completed(&self, index: usize, item: &Self::Item, outcome: &Self::Outcome) {
        self.driver.on_completed(index, item, outcome).await;
    }

    async fn on_execution_failure(
        &self,
        index: usize,
        item: &Self::Item,
        error: &anyhow::Error,
    ) -> Option<Self::Outcome> {
        self.driver.on_execution_failure(index, item, error).await
    }

    async fn cleanup(&self, index: usize, item: &Self::Item) -> anyhow::Result<()> {
        self.driver.cleanup(index, item).await
    }
}

/// Runs one full competition.
///
/// Every candidate that reaches "ready" ends up either in the returned
/// results or inside the returned error; nothing is silently dropped. A
/// single failure propagates as-is, several surface as one aggregate with
/// the first as primary.
pub async fn run_competition<D>(
    driver: &D,
    candidates: Vec<D::Candidate>,
    max_parallel: usize,
    policy: FailurePolicy,
) -> Result<Vec<D::Outcome>, CompetitionError>
where
    D: CompetitionDriver + ?Sized,
{
    for (index, candidate) in candidates.iter().enumerate() {
        driver.on_queued(index, candidate).await;
    }

    let mut failures: Vec<anyhow::Error> = Vec::new();
    let mut results: Vec<D::Outcome> = Vec::new();

    match driver.prepare(candidates).await {
        Ok(batch) => {
            results.extend(batch.failures);
            let adapter = PoolAdapter { driver };
            match run_pool(&adapter, &batch.ready, max_parallel, policy).await {
                Ok(outcomes) => results.extend(outcomes),
                Err(error) => failures.extend(error.into_failures()),
            }
        }
        Err(error) => failures.push(error.context("competition preparation failed")),
    }

    if let Err(error) = driver.finalize().await {
        failures.push(error);
    }

    if let Some(error) = CompetitionError::from_failures(failures) {
        return Err(error);
    }

    if let Some(compare) = driver.comparator() {
        results.sort_by(&*compare);
    }
    Ok(results)
}
