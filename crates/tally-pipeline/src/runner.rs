//! The [`Runner`]: worker loops over the durable task queue.
//!
//! A worker pops the next due task and dispatches it to the matching job. A
//! task that fails is logged and dropped — the jobs are written so that the
//! periodic ones re-enqueue their successor before doing any work, and the
//! multi-step ones are idempotent, so a dropped task costs at most one step
//! of one operation.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Utc};
use tally_core::{
  config::PipelineConfig,
  store::{ArchiveStore, LedgerStore, TaskQueue},
  task::{NewTask, Task, TaskEnvelope},
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
  Result, anonymizer, archiver, invalidator,
  notify::{Delivery, Notifier, resolve},
  reconciler,
};

/// Wires the stores, the notifier, and the configuration to the job
/// functions. Cheap to clone; one clone per worker loop.
pub struct Runner<S, A, N> {
  store:    S,
  archive:  A,
  notifier: N,
  cfg:      Arc<PipelineConfig>,
}

impl<S: Clone, A: Clone, N: Clone> Clone for Runner<S, A, N> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      archive:  self.archive.clone(),
      notifier: self.notifier.clone(),
      cfg:      Arc::clone(&self.cfg),
    }
  }
}

impl<S, A, N> Runner<S, A, N>
where
  S: LedgerStore + TaskQueue,
  A: ArchiveStore,
  N: Notifier,
{
  pub fn new(store: S, archive: A, notifier: N, cfg: PipelineConfig) -> Self {
    Self {
      store,
      archive,
      notifier,
      cfg: Arc::new(cfg),
    }
  }

  pub fn config(&self) -> &PipelineConfig { &self.cfg }

  pub fn store(&self) -> &S { &self.store }

  pub fn archive(&self) -> &A { &self.archive }

  /// Enqueue the periodic tasks that keep the pipeline alive. Idempotent
  /// enough for a restart: duplicate periodic tasks collapse to extra
  /// no-op runs behind the reconciler lock and the anonymizer predicate.
  pub async fn seed(&self, now: DateTime<Utc>) -> Result<()> {
    self
      .store
      .enqueue(NewTask::new(now, Task::ReconcileCounts))
      .await
      .map_err(crate::Error::store)?;
    self
      .store
      .enqueue(NewTask::new(now, Task::AnonymizationSweep))
      .await
      .map_err(crate::Error::store)?;
    Ok(())
  }

  /// Drain every task due at `now`, dispatching each in turn. Returns the
  /// number of tasks processed. Deterministic, so tests drive the pipeline
  /// by calling this with fixed clocks.
  pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
    let mut processed = 0usize;
    while let Some(envelope) =
      self.store.pop_due(now).await.map_err(crate::Error::store)?
    {
      let kind = envelope.task.discriminant();
      if let Err(err) = self.dispatch(envelope, now).await {
        error!(task = kind, %err, "task failed");
      }
      processed += 1;
    }
    Ok(processed)
  }

  /// The long-running worker loop: drain due tasks, sleep, repeat.
  pub async fn run(&self) -> Result<()> {
    let poll = StdDuration::from_secs(self.cfg.queue_poll_interval_secs);
    loop {
      self.tick(Utc::now()).await?;
      tokio::time::sleep(poll).await;
    }
  }

  /// Schedule archival for a petition that has reached a terminal state.
  pub async fn schedule_archival(
    &self,
    petition_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<()> {
    archiver::schedule_archival(&self.store, &self.cfg, petition_id, now).await
  }

  /// Verified deletion of fully-archived petitions. Deletion is a direct
  /// call, never a queue task: the `NotArchived` safety fault propagates to
  /// the caller instead of being logged and dropped by a worker loop.
  pub async fn delete_petitions(&self, ids: &[Uuid]) -> Result<()> {
    archiver::delete_petitions(&self.store, &self.archive, ids).await
  }

  async fn dispatch(
    &self,
    envelope: TaskEnvelope,
    now: DateTime<Utc>,
  ) -> Result<()> {
    match envelope.task {
      Task::ReconcileCounts => {
        reconciler::reconcile(&self.store, &self.cfg, now).await
      }
      Task::ResetPetitionCount { petition_id } => {
        reconciler::reset_count(&self.store, &self.cfg, petition_id, now).await
      }
      Task::CopyPetition { petition_id } => {
        archiver::copy_petition(
          &self.store,
          &self.archive,
          &self.cfg,
          petition_id,
          now,
        )
        .await
      }
      Task::CopySignatureBatch {
        petition_id,
        from_seq,
        to_seq,
      } => {
        archiver::copy_signature_batch(
          &self.store,
          &self.archive,
          petition_id,
          from_seq,
          to_seq,
        )
        .await
      }
      Task::CheckArchiveComplete { petition_id } => {
        archiver::check_archive_complete(
          &self.store,
          &self.cfg,
          petition_id,
          now,
        )
        .await
      }
      Task::AnonymizationSweep => {
        anonymizer::sweep(&self.store, &self.cfg, now).await
      }
      Task::AnonymizePetition {
        petition_id,
        timestamp,
        limit,
      } => {
        anonymizer::anonymize_petition(
          &self.store,
          petition_id,
          timestamp,
          limit,
          now,
        )
        .await
      }
      Task::ExecuteInvalidation { invalidation_id } => {
        invalidator::execute_invalidation(
          &self.store,
          &self.cfg,
          invalidation_id,
          now,
        )
        .await
      }
      Task::Notify { kind } => {
        let notification = resolve(kind.clone());
        match self.notifier.deliver(notification).await {
          Delivery::Delivered => Ok(()),
          Delivery::RetryLater => {
            let retry_at = now
              + chrono::Duration::seconds(
                self.cfg.queue_poll_interval_secs as i64,
              );
            self
              .store
              .enqueue(NewTask::new(retry_at, Task::Notify { kind }))
              .await
              .map_err(crate::Error::store)?;
            Ok(())
          }
          Delivery::Failed => {
            warn!(?kind, "notification delivery failed permanently; dropped");
            Ok(())
          }
        }
      }
    }
  }
}
