//! Bounded worker pool.
//!
//! [`run_pool`] runs a fixed number of logical workers over a shared item
//! list. Workers are symmetric: each repeatedly claims the next unclaimed
//! index from one shared counter, so a slow item never starves the fast
//! workers. Outcomes are written back at the item's own index, preserving
//! input order regardless of completion order.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::CompetitionError;

/// What the pool does after an execution failure that no hook captured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop claiming new items after the first failure. Already-claimed
    /// items still run to completion.
    Abort,
    /// Run every item regardless of earlier failures.
    #[default]
    Continue,
}

/// Work and lifecycle hooks for one pool run.
///
/// Only [`execute`](PoolDriver::execute) is mandatory; every hook defaults
/// to a no-op. Each hook is called at most once per item.
#[async_trait]
pub trait PoolDriver: Send + Sync {
    type Item: Send + Sync;
    type Outcome: Send;

    /// Runs one claimed item to completion.
    async fn execute(&self, index: usize, item: &Self::Item) -> anyhow::Result<Self::Outcome>;

    /// Fires when a worker claims `item`, before `execute`.
    async fn on_running(&self, _index: usize, _item: &Self::Item) {}

    /// Fires after a successful `execute`, before the outcome is stored.
    async fn on_completed(&self, _index: usize, _item: &Self::Item, _outcome: &Self::Outcome) {}

    /// Offers a failed execution back to the driver. Returning a substitute
    /// outcome captures the failure: it is recorded like a success and does
    /// not count against the failure policy.
    async fn on_execution_failure(
        &self,
        _index: usize,
        _item: &Self::Item,
        _error: &anyhow::Error,
    ) -> Option<Self::Outcome> {
        None
    }

    /// Releases whatever `item` holds. Runs exactly once for every item
    /// that was started, whether its execution succeeded, failed, or was
    /// captured.
    async fn cleanup(&self, _index: usize, _item: &Self::Item) -> anyhow::Result<()> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolState<O> {
    slots: Mutex<Vec<Option<O>>>,
    started: Mutex<HashSet<usize>>,
    cleaned: Mutex<HashSet<usize>>,
    failures: Mutex<Vec<anyhow::Error>>,
}

/// Runs every item through `driver` with at most
/// `min(max_parallel, items.len())` executions in flight.
///
/// On success the returned outcomes are index-aligned with `items`. Any
/// uncaptured execution failure, cleanup failure, or both surface together
/// as one [`CompetitionError`]; the first failure recorded is the primary.
pub async fn run_pool<D>(
    driver: &D,
    items: &[D::Item],
    max_parallel: usize,
    policy: FailurePolicy,
) -> Result<Vec<D::Outcome>, CompetitionError>
where
    D: PoolDriver + ?Sized,
{
    if items.is_empty() || max_parallel == 0 {
        return Ok(Vec::new());
    }

    let worker_count = max_parallel.min(items.len()).max(1);
    let next = AtomicUsize::new(0);
    let halted = AtomicBool::new(false);
    let state = PoolState {
        slots: Mutex::new((0..items.len()).map(|_| None).collect()),
        started: Mutex::new(HashSet::new()),
        cleaned: Mutex::new(HashSet::new()),
        failures: Mutex::new(Vec::new()),
    };

    let workers = (0..worker_count).map(|_| async {
        loop {
            if halted.load(Ordering::SeqCst) {
                return;
            }
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(item) = items.get(index) else {
                return;
            };

            lock(&state.started).insert(index);
            driver.on_running(index, item).await;

            match driver.execute(index, item).await {
                Ok(outcome) => {
                    driver.on_completed(index, item, &outcome).await;
                    lock(&state.slots)[index] = Some(outcome);
                }
                Err(error) => {
                    if let Some(substitute) =
                        driver.on_execution_failure(index, item, &error).await
                    {
                        lock(&state.slots)[index] = Some(substitute);
                    } else {
                        lock(&state.failures).push(error);
                        if policy == FailurePolicy::Abort {
                            halted.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }

            cleanup_item(driver, &state, index, item).await;
        }
    });
    join_all(workers).await;

    // Defensive sweep: a worker that died between start and cleanup (out of
    // contract, but cheap to cover) leaves its item uncleaned.
    let leftover: Vec<usize> = {
        let started = lock(&state.started);
        let cleaned = lock(&state.cleaned);
        let mut missing: Vec<usize> = started.difference(&cleaned).copied().collect();
        missing.sort_unstable();
        missing
    };
    for index in leftover {
        if let Some(item) = items.get(index) {
            cleanup_item(driver, &state, index, item).await;
        }
    }

    let failures = state.failures.into_inner().unwrap_or_else(PoisonError::into_inner);
    if let Some(error) = CompetitionError::from_failures(failures) {
        return Err(error);
    }

    let slots = state.slots.into_inner().unwrap_or_else(PoisonError::into_inner);
    let mut outcomes = Vec::with_capacity(slots.len());
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(outcome) => outcomes.push(outcome),
            None => return Err(CompetitionError::MissingSlotResult { index }),
        }
    }
    Ok(outcomes)
}

/// Cleanup with an at-most-once guard, so the post-run sweep cannot double
/// up with the worker's own call.
async fn cleanup_item<D>(driver: &D, state: &PoolState<D::Outcome>, index: usize, item: &D::Item)
where
    D: PoolDriver + ?Sized,
{
    {
        let mut cleaned = lock(&state.cleaned);
        if !cleaned.insert(index) {
            return;
        }
    }
    if let Err(error) = driver.cleanup(index, item).await {
        lock(&state.failures).push(error.context(format!("cleanup for candidate {index} failed")));
    }
}
