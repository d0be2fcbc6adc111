//! The anonymization batcher.
//!
//! A periodic sweep enumerates petitions whose terminal transition is older
//! than the retention period and schedules one redaction run per petition.
//! A redaction run clears personal fields in bounded batches, re-enqueueing
//! itself with identical arguments until a pass finds nothing left, and only
//! then stamps the petition's `anonymized_at`. Because the eligibility
//! predicate excludes already-redacted rows, re-running any step is a no-op
//! for the rows it has already covered.

use chrono::{DateTime, Utc};
use tally_core::{
  config::PipelineConfig,
  store::{LedgerStore, TaskQueue},
  task::{NewTask, Task},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{Error, Result};

/// One sweep pass. Re-enqueues the next sweep first so a failure mid-pass
/// never stops the cadence; a petition skipped by an enqueue error is picked
/// up again next sweep.
pub async fn sweep<S>(
  store: &S,
  cfg: &PipelineConfig,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  store
    .enqueue(NewTask::new(
      now + cfg.anonymize_sweep_interval(),
      Task::AnonymizationSweep,
    ))
    .await
    .map_err(Error::store)?;

  let cutoff = now - cfg.retention_period();
  let due = store
    .petitions_past_retention(cutoff)
    .await
    .map_err(Error::store)?;

  let mut scheduled = 0usize;
  for petition in &due {
    let enqueued = store
      .enqueue(NewTask::new(now, Task::AnonymizePetition {
        petition_id: petition.petition_id,
        timestamp:   now,
        limit:       cfg.anonymize_batch_limit,
      }))
      .await;
    match enqueued {
      Ok(_) => scheduled += 1,
      Err(err) => {
        error!(
          petition_id = %petition.petition_id,
          %err,
          "failed to schedule anonymization"
        );
      }
    }
  }

  info!(cutoff = %cutoff, scheduled, "anonymization sweep complete");
  Ok(())
}

/// One redaction pass over a petition.
///
/// The `timestamp` is fixed at scheduling time and serves as both the
/// eligibility bound (`created_at < timestamp`) and the stamped
/// `anonymized_at`, so every pass of one run sees the same eligible set and
/// all redacted rows carry the same stamp.
pub async fn anonymize_petition<S>(
  store: &S,
  petition_id: Uuid,
  timestamp: DateTime<Utc>,
  limit: Option<u32>,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  let eligible = store
    .unanonymized_count(petition_id, timestamp)
    .await
    .map_err(Error::store)?;

  if eligible == 0 {
    store
      .set_petition_anonymized_at(petition_id, timestamp)
      .await
      .map_err(Error::store)?;
    info!(%petition_id, "petition anonymization complete");
    return Ok(());
  }

  let redacted = store
    .anonymize_signatures(petition_id, timestamp, limit)
    .await
    .map_err(Error::store)?;
  debug!(%petition_id, redacted, remaining = eligible as usize - redacted,
    "anonymization batch applied");

  // Tail-recursive submission: same arguments, so the run converges on the
  // fixed eligible set regardless of how many passes it takes.
  store
    .enqueue(NewTask::new(now, Task::AnonymizePetition {
      petition_id,
      timestamp,
      limit,
    }))
    .await
    .map_err(Error::store)?;
  Ok(())
}
