//! The archival migrator.
//!
//! Migration of a terminal petition is a fan-out of queue tasks: one
//! `CopyPetition` copies the header and dependent records and slices the
//! signatures into disjoint `seq` ranges, one `CopySignatureBatch` per range
//! copies its rows and flips their `archived` markers, and a
//! `CheckArchiveComplete` polls until no un-migrated rows remain, then
//! stamps `archived_at`. All archive writes are idempotent, so any task can
//! be re-run after a crash, and the batches commute.
//!
//! Deletion is never part of this flow. It is a separately-triggered,
//! verified operation: [`delete_petitions`].

use chrono::{DateTime, Utc};
use tally_core::{
  config::PipelineConfig,
  store::{ArchiveStore, LedgerStore, TaskQueue},
  task::{NewTask, Task},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Schedule a petition for migration after the configured delay. Called when
/// a petition reaches a terminal state; the delay leaves a window for
/// last-minute moderation reversals.
pub async fn schedule_archival<Q>(
  queue: &Q,
  cfg: &PipelineConfig,
  petition_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  Q: TaskQueue,
{
  queue
    .enqueue(NewTask::new(
      now + cfg.archive_delay(),
      Task::CopyPetition { petition_id },
    ))
    .await
    .map_err(Error::store)?;
  Ok(())
}

/// Copy the petition header and records into the archive, then fan out the
/// signature batches and the completion check.
pub async fn copy_petition<S, A>(
  store: &S,
  archive: &A,
  cfg: &PipelineConfig,
  petition_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
  A: ArchiveStore,
{
  let Some(petition) =
    store.get_petition(petition_id).await.map_err(Error::store)?
  else {
    warn!(%petition_id, "archival task for a deleted petition; dropping");
    return Ok(());
  };

  if !petition.state.is_terminal() {
    // The terminal transition was reversed during the archival delay.
    return Err(tally_core::Error::NotTerminal(petition_id).into());
  }
  if petition.archived_at.is_some() {
    debug!(%petition_id, "petition already archived; nothing to copy");
    return Ok(());
  }

  let records = store
    .petition_records(petition_id)
    .await
    .map_err(Error::store)?;
  archive
    .copy_petition(&petition, &records)
    .await
    .map_err(Error::store)?;

  let seqs = store
    .unarchived_signature_seqs(petition_id)
    .await
    .map_err(Error::store)?;
  let batches = seqs.chunks(cfg.signature_batch_size.max(1)).count();
  for chunk in seqs.chunks(cfg.signature_batch_size.max(1)) {
    // Chunks of an ascending seq list give disjoint inclusive ranges.
    store
      .enqueue(NewTask::high(now, Task::CopySignatureBatch {
        petition_id,
        from_seq: chunk[0],
        to_seq: chunk[chunk.len() - 1],
      }))
      .await
      .map_err(Error::store)?;
  }

  store
    .enqueue(NewTask::new(
      now + cfg.archive_poll_interval(),
      Task::CheckArchiveComplete { petition_id },
    ))
    .await
    .map_err(Error::store)?;

  info!(
    %petition_id,
    records = records.len(),
    signatures = seqs.len(),
    batches,
    "petition copy started"
  );
  Ok(())
}

/// Copy one batch of signatures and flip their `archived` markers. The rows
/// are re-read from the live store, so a re-run after a partial failure
/// copies only what is still marked un-migrated.
pub async fn copy_signature_batch<S, A>(
  store: &S,
  archive: &A,
  petition_id: Uuid,
  from_seq: i64,
  to_seq: i64,
) -> Result<()>
where
  S: LedgerStore,
  A: ArchiveStore,
{
  let signatures = store
    .unarchived_signatures_in_range(petition_id, from_seq, to_seq)
    .await
    .map_err(Error::store)?;
  if signatures.is_empty() {
    debug!(%petition_id, from_seq, to_seq, "batch already migrated");
    return Ok(());
  }

  archive
    .copy_signatures(&signatures)
    .await
    .map_err(Error::store)?;

  let seqs: Vec<i64> = signatures.iter().map(|s| s.seq).collect();
  store
    .mark_signatures_archived(petition_id, seqs)
    .await
    .map_err(Error::store)?;

  debug!(
    %petition_id,
    from_seq,
    to_seq,
    copied = signatures.len(),
    "signature batch migrated"
  );
  Ok(())
}

/// Poll for migration completion. Re-enqueues itself while batches are still
/// in flight; stamps `archived_at` once the un-migrated count reaches zero.
pub async fn check_archive_complete<S>(
  store: &S,
  cfg: &PipelineConfig,
  petition_id: Uuid,
  now: DateTime<Utc>,
) -> Result<()>
where
  S: LedgerStore + TaskQueue,
{
  let remaining = store
    .unarchived_signature_count(petition_id)
    .await
    .map_err(Error::store)?;

  if remaining > 0 {
    debug!(%petition_id, remaining, "migration still in flight");
    store
      .enqueue(NewTask::new(
        now + cfg.archive_poll_interval(),
        Task::CheckArchiveComplete { petition_id },
      ))
      .await
      .map_err(Error::store)?;
    return Ok(());
  }

  store
    .set_archived_at(petition_id, now)
    .await
    .map_err(Error::store)?;
  info!(%petition_id, "petition migration complete");
  Ok(())
}

/// Verified deletion of fully-archived petitions.
///
/// Before any row is removed, every petition in the batch is checked against
/// the archive: the header must be present and no live signature may remain
/// un-migrated. The store additionally refuses the whole batch unless every
/// petition carries an `archived_at` stamp. Nothing is deleted on any
/// failure.
pub async fn delete_petitions<S, A>(
  store: &S,
  archive: &A,
  ids: &[Uuid],
) -> Result<()>
where
  S: LedgerStore,
  A: ArchiveStore,
{
  for &id in ids {
    if archive.get_petition(id).await.map_err(Error::store)?.is_none() {
      return Err(tally_core::Error::NotArchived(id).into());
    }
    let remaining = store
      .unarchived_signature_count(id)
      .await
      .map_err(Error::store)?;
    if remaining > 0 {
      return Err(tally_core::Error::NotArchived(id).into());
    }
  }

  store.delete_petitions(ids).await.map_err(Error::store)?;
  info!(petitions = ids.len(), "archived petitions deleted");
  Ok(())
}
