//! The invalidation engine.
//!
//! An operator stores a match rule as an invalidation record; executing it
//! flips every matching validated signature to `Invalidated` and decrements
//! the affected petitions' aggregates in the same transaction, so no reader
//! observes a count that disagrees with the flipped rows. A record executes
//! at most once.
//!
//! Executions serialise behind the reconciler's aggregate lock. A rule that
//! flipped rows between a reconcile run's window fetch and its delta
//! application would leave the run applying a stale delta for rows that are
//! no longer `validated`; holding the lock means an execution runs entirely
//! before or entirely after any reconciliation pass.

use chrono::{DateTime, Utc};
use tally_core::{
  config::PipelineConfig,
  store::{LedgerStore, TaskQueue},
  task::{NewTask, NotificationKind, Task},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Error, Result, reconciler::RECONCILER_LOCK};

/// Execute a stored invalidation record and queue per-petition
/// notifications for the affected signers. While a reconciliation run holds
/// the aggregate lock, the task re-enqueues itself instead.
pub async fn execute_invalidation<S>(
  store: &S,
  cfg: &PipelineConfig,
  invalidation_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  if !store
    .try_acquire_lock(RECONCILER_LOCK, now)
    .await
    .map_err(Error::store)?
  {
    warn!(%invalidation_id, "aggregate lock held; re-queueing invalidation");
    store
      .enqueue(NewTask::new(
        now + cfg.queue_poll_interval(),
        Task::ExecuteInvalidation { invalidation_id },
      ))
      .await
      .map_err(Error::store)?;
    return Ok(());
  }

  let outcome = run_record(store, invalidation_id, now).await;
  store
    .release_lock(RECONCILER_LOCK)
    .await
    .map_err(Error::store)?;
  outcome
}

async fn run_record<S>(
  store: &S,
  invalidation_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  let Some(outcome) = store
    .run_invalidation(invalidation_id, now)
    .await
    .map_err(Error::store)?
  else {
    // Distinguish "already done" from a stale task for a deleted record.
    match store
      .get_invalidation(invalidation_id)
      .await
      .map_err(Error::store)?
    {
      Some(_) => {
        debug!(%invalidation_id, "invalidation already executed; no-op")
      }
      None => warn!(%invalidation_id, "stale task for unknown invalidation"),
    }
    return Ok(());
  };

  info!(
    %invalidation_id,
    matching = outcome.matching_count,
    invalidated = outcome.invalidated_count,
    petitions = outcome.petitions.len(),
    "invalidation executed"
  );

  for impact in outcome.petitions {
    store
      .enqueue(NewTask::new(now, Task::Notify {
        kind: NotificationKind::SignaturesInvalidated {
          petition_id: impact.petition_id,
          invalidated: impact.invalidated,
        },
      }))
      .await
      .map_err(Error::store)?;
  }

  Ok(())
}
