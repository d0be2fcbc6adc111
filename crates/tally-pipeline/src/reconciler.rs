//! The counter reconciler.
//!
//! Signature validation never touches aggregates; this job periodically
//! folds newly-validated signatures into petition counts and journals. The
//! window it processes is `[watermark, now - interval)`: the upper bound
//! deliberately lags `now` so that in-flight validations with slightly-past
//! timestamps cannot land inside an already-processed window. Each validated
//! signature therefore falls into exactly one window.

use chrono::{DateTime, Utc};
use tally_core::{
  config::PipelineConfig,
  journal::CountDelta,
  store::{LedgerStore, TaskQueue},
  task::{NewTask, Task},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Name of the single-writer lock serialising every aggregate writer:
/// reconciliation runs, invalidation executions, and count resets. A writer
/// that cannot take it defers; none of them ever runs concurrently with a
/// reconcile pass, whose window fetch and delta application must observe the
/// same signature states throughout.
pub const RECONCILER_LOCK: &str = "counter-reconciler";

/// One reconciliation run.
///
/// The successor task is enqueued before any window work, so a failed run
/// never stalls the cadence. If the lock is held by another run the whole
/// pass is skipped; the skipped window is simply picked up next time.
pub async fn reconcile<S>(
  store: &S,
  cfg: &PipelineConfig,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  store
    .enqueue(NewTask::new(
      now + cfg.reconcile_interval(),
      Task::ReconcileCounts,
    ))
    .await
    .map_err(Error::store)?;

  if !store
    .try_acquire_lock(RECONCILER_LOCK, now)
    .await
    .map_err(Error::store)?
  {
    warn!("reconciler lock held; skipping this run");
    return Ok(());
  }

  let outcome = advance_window(store, cfg, now).await;
  store
    .release_lock(RECONCILER_LOCK)
    .await
    .map_err(Error::store)?;
  outcome
}

async fn advance_window<S>(
  store: &S,
  cfg: &PipelineConfig,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore,
{
  let from = store.watermark().await.map_err(Error::store)?;
  let to   = now - cfg.reconcile_interval();

  if let Some(from) = from
    && from >= to
  {
    debug!("reconciliation window empty; watermark already at {from}");
    return Ok(());
  }

  let window = store
    .signatures_validated_between(from, to)
    .await
    .map_err(Error::store)?;
  let deltas = CountDelta::group(&window);

  let mut applied = 0usize;
  for (petition_id, delta) in deltas {
    let Some(petition) =
      store.get_petition(petition_id).await.map_err(Error::store)?
    else {
      warn!(%petition_id, "window references a deleted petition; skipping");
      continue;
    };

    // A pending count reset owns this petition's aggregates: the recompute
    // covers everything below the watermark, so applying the delta here
    // would double it.
    if let Some(reset_at) = petition.count_reset_at {
      if now - reset_at > cfg.reset_stuck_threshold() {
        warn!(
          %petition_id,
          %reset_at,
          "count reset pending past the stuck threshold"
        );
      } else {
        debug!(%petition_id, "count reset pending; deferring delta");
      }
      continue;
    }

    if let Err(err) = store.apply_count_delta(petition_id, delta, now).await {
      error!(%petition_id, %err, "failed to apply count delta");
      continue;
    }
    applied += 1;
  }

  store.set_watermark(to).await.map_err(Error::store)?;
  info!(
    window_signatures = window.len(),
    petitions_updated = applied,
    watermark = %to,
    "reconciliation window advanced"
  );
  Ok(())
}

/// Recompute one petition's aggregates from the ledger and clear its reset
/// flag. Only signatures below the current watermark are counted; rows above
/// it will be folded in by the reconciler as usual.
///
/// Takes the aggregate lock so the recompute can never read a watermark that
/// a reconcile run is about to advance past a deferred delta. When a run is
/// in flight the task re-enqueues itself instead.
pub async fn reset_count<S>(
  store: &S,
  cfg: &PipelineConfig,
  petition_id: Uuid,
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
    warn!(%petition_id, "aggregate lock held; re-queueing count reset");
    store
      .enqueue(NewTask::new(
        now + cfg.queue_poll_interval(),
        Task::ResetPetitionCount { petition_id },
      ))
      .await
      .map_err(Error::store)?;
    return Ok(());
  }

  let outcome = recompute(store, petition_id, now).await;
  store
    .release_lock(RECONCILER_LOCK)
    .await
    .map_err(Error::store)?;
  outcome
}

async fn recompute<S>(
  store: &S,
  petition_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore,
{
  let upto = store.watermark().await.map_err(Error::store)?;
  store
    .reset_petition_count(petition_id, upto, now)
    .await
    .map_err(Error::store)?;
  info!(%petition_id, "petition count recomputed from ledger");
  Ok(())
}
