//! Durable-queue task types.
//!
//! Every background operation is a serialisable [`Task`] on a durable queue.
//! Multi-step operations are expressed as tail-recursive submission: a task's
//! terminal action is "enqueue myself (or my successor) again with updated
//! arguments", never an in-process loop or callback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of background work.
///
/// The serde tag is `"task"` rather than `"kind"` so it cannot collide with
/// variant fields (`Notify` carries a `kind` of its own).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
  /// Advance the reconciliation window; re-enqueues itself every interval.
  ReconcileCounts,
  /// Recompute one petition's aggregates from the ledger and clear its
  /// count-reset flag.
  ResetPetitionCount { petition_id: Uuid },
  /// Copy a terminal petition's header and dependent records into the
  /// archive store; fans out signature batches.
  CopyPetition { petition_id: Uuid },
  /// Copy the un-migrated signatures in `[from_seq, to_seq]` into the
  /// archive. Batches operate on disjoint ranges and commute.
  CopySignatureBatch {
    petition_id: Uuid,
    from_seq:    i64,
    to_seq:      i64,
  },
  /// Poll for migration completion; stamps `archived_at` when the
  /// un-migrated count reaches zero.
  CheckArchiveComplete { petition_id: Uuid },
  /// Enumerate petitions past their retention cutoff and schedule one
  /// anonymization run per petition.
  AnonymizationSweep,
  /// Redact up to `limit` signatures; re-enqueues itself with identical
  /// arguments until a pass finds nothing left to redact.
  AnonymizePetition {
    petition_id: Uuid,
    timestamp:   DateTime<Utc>,
    limit:       Option<u32>,
  },
  /// Execute a stored invalidation record.
  ExecuteInvalidation { invalidation_id: Uuid },
  /// Hand a notification to the delivery sink.
  Notify { kind: NotificationKind },
}

impl Task {
  /// The discriminant string stored in the `task_kind` column.
  /// Must match the `rename_all = "snake_case"` serde tags above.
  pub fn discriminant(&self) -> &'static str {
    match self {
      Self::ReconcileCounts => "reconcile_counts",
      Self::ResetPetitionCount { .. } => "reset_petition_count",
      Self::CopyPetition { .. } => "copy_petition",
      Self::CopySignatureBatch { .. } => "copy_signature_batch",
      Self::CheckArchiveComplete { .. } => "check_archive_complete",
      Self::AnonymizationSweep => "anonymization_sweep",
      Self::AnonymizePetition { .. } => "anonymize_petition",
      Self::ExecuteInvalidation { .. } => "execute_invalidation",
      Self::Notify { .. } => "notify",
    }
  }
}

/// Queue priority. `High` is reserved for signature-copy batches so that
/// large petitions parallelise without starving the periodic jobs.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Normal,
  High,
}

/// Input to [`crate::store::TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct NewTask {
  pub run_at:   DateTime<Utc>,
  pub priority: Priority,
  pub task:     Task,
}

impl NewTask {
  pub fn new(run_at: DateTime<Utc>, task: Task) -> Self {
    Self {
      run_at,
      priority: Priority::Normal,
      task,
    }
  }

  pub fn high(run_at: DateTime<Utc>, task: Task) -> Self {
    Self {
      run_at,
      priority: Priority::High,
      task,
    }
  }
}

/// A persisted task as returned by the queue.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
  pub task_id:  Uuid,
  pub run_at:   DateTime<Utc>,
  pub priority: Priority,
  pub task:     Task,
}

/// The user-visible events the pipeline (or the web layer) can ask the
/// delivery sink to announce. One generic task parameterised by this enum
/// replaces a class per email variant; the template and recipient strategy
/// are resolved from the kind at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationKind {
  SignaturesInvalidated {
    petition_id: Uuid,
    invalidated: i64,
  },
  PetitionClosed { petition_id: Uuid },
  GovernmentResponseReceived { petition_id: Uuid },
  DebateOutcomeRecorded { petition_id: Uuid },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_payloads_round_trip_through_json() {
    let tasks = [
      Task::ReconcileCounts,
      Task::AnonymizePetition {
        petition_id: Uuid::nil(),
        timestamp:   Utc::now(),
        limit:       Some(500),
      },
      // The variant whose field shares a name with a natural tag choice.
      Task::Notify {
        kind: NotificationKind::SignaturesInvalidated {
          petition_id: Uuid::nil(),
          invalidated: 2,
        },
      },
    ];

    for task in tasks {
      let json = serde_json::to_string(&task).unwrap();
      assert!(json.contains(&format!("\"task\":\"{}\"", task.discriminant())));
      let back: Task = serde_json::from_str(&json).unwrap();
      assert_eq!(back, task);
    }
  }
}
