//! The `LedgerStore`, `TaskQueue`, and `ArchiveStore` traits.
//!
//! The traits are implemented by storage backends (e.g.
//! `tally-store-sqlite`). The pipeline crate depends on these abstractions,
//! not on any concrete backend.
//!
//! Mutation discipline across components: the counter reconciler and the
//! invalidation engine are the only writers of aggregate columns; the
//! archival migrator only copies and flips `archived` markers; the
//! anonymization batcher only touches redaction fields. Composite operations
//! (`apply_count_delta`, `run_invalidation`, `delete_petitions`) must be
//! executed as a single transaction by the backend.
//!
//! All methods return `Send` futures so the traits can be used from
//! multi-threaded async runtimes.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  invalidation::{InvalidationOutcome, InvalidationRecord, MatchRule},
  journal::{CountDelta, Journal},
  petition::{NewPetition, Petition, PetitionState},
  record::{NewPetitionRecord, PetitionRecord},
  signature::{NewSignature, Signature},
  task::{NewTask, TaskEnvelope},
};

// ─── LedgerStore ─────────────────────────────────────────────────────────────

/// The live store: the authoritative signature ledger, its aggregates, and
/// the pipeline's bookkeeping singletons (watermark, locks).
pub trait LedgerStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Petitions ─────────────────────────────────────────────────────────

  fn create_petition(
    &self,
    input: NewPetition,
  ) -> impl Future<Output = Result<Petition, Self::Error>> + Send + '_;

  /// Retrieve a petition. Returns `None` if not found.
  fn get_petition(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Petition>, Self::Error>> + Send + '_;

  /// Transition a petition's state, stamping `state_changed_at` for
  /// terminal transitions.
  fn set_petition_state(
    &self,
    id: Uuid,
    state: PetitionState,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Set (`Some`) or clear (`None`) the count-reset flag.
  fn set_count_reset(
    &self,
    id: Uuid,
    at: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Petitions whose terminal transition happened before `terminal_before`
  /// and which have not yet been anonymized.
  fn petitions_past_retention(
    &self,
    terminal_before: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Petition>, Self::Error>> + Send + '_;

  // ── Signatures ────────────────────────────────────────────────────────

  /// Record a new pending signature. `seq`, id, and `created_at` are
  /// assigned by the store.
  fn record_signature(
    &self,
    input: NewSignature,
  ) -> impl Future<Output = Result<Signature, Self::Error>> + Send + '_;

  fn get_signature(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Signature>, Self::Error>> + Send + '_;

  /// Transition a pending signature to `Validated` at `at`.
  fn validate_signature(
    &self,
    id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// All `Validated` signatures with `validated_at` in `[from, to)`.
  /// An unset `from` means "since the beginning of time".
  fn signatures_validated_between(
    &self,
    from: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Signature>, Self::Error>> + Send + '_;

  // ── Aggregates ────────────────────────────────────────────────────────

  /// Apply one window's contribution to a petition's `signature_count`,
  /// `last_signed_at`, `updated_at`, and journals. One transaction.
  fn apply_count_delta(
    &self,
    petition_id: Uuid,
    delta: CountDelta,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Recompute `signature_count`, `last_signed_at`, and all journals from
  /// the ledger, counting only signatures validated before `upto` (the
  /// reconciled horizon), then clear the count-reset flag. One transaction.
  fn reset_petition_count(
    &self,
    petition_id: Uuid,
    upto: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn petition_journals(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Journal>, Self::Error>> + Send + '_;

  // ── Watermark & single-writer lock ────────────────────────────────────

  /// The persisted "last reconciled" watermark. `None` before the first
  /// completed run.
  fn watermark(
    &self,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_;

  fn set_watermark(
    &self,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Non-blocking acquisition of the named single-writer lock. Returns
  /// `false` if another holder is in flight.
  fn try_acquire_lock<'a>(
    &'a self,
    name: &'a str,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  fn release_lock<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Petition records ──────────────────────────────────────────────────

  fn add_petition_record(
    &self,
    input: NewPetitionRecord,
  ) -> impl Future<Output = Result<PetitionRecord, Self::Error>> + Send + '_;

  fn petition_records(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<Vec<PetitionRecord>, Self::Error>> + Send + '_;

  // ── Archival bookkeeping ──────────────────────────────────────────────

  /// `seq`s of this petition's not-yet-migrated signatures, ascending.
  fn unarchived_signature_seqs(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<Vec<i64>, Self::Error>> + Send + '_;

  /// Not-yet-migrated signatures with `seq` in `[from_seq, to_seq]`.
  fn unarchived_signatures_in_range(
    &self,
    petition_id: Uuid,
    from_seq: i64,
    to_seq: i64,
  ) -> impl Future<Output = Result<Vec<Signature>, Self::Error>> + Send + '_;

  /// Flip the `archived` marker on the given rows after they have been
  /// copied into the archive store.
  fn mark_signatures_archived(
    &self,
    petition_id: Uuid,
    seqs: Vec<i64>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn unarchived_signature_count(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Stamp `archived_at`. Only the completion check may call this, and only
  /// once the un-migrated count has reached zero.
  fn set_archived_at(
    &self,
    petition_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Destroy the given petitions and their signatures, journals, and
  /// records — never their invalidation records. Must first verify every
  /// petition carries `archived_at` and fail the whole batch (deleting
  /// nothing) if any does not.
  fn delete_petitions<'a>(
    &'a self,
    ids: &'a [Uuid],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Anonymization ─────────────────────────────────────────────────────

  /// Redact up to `limit` signatures created before `timestamp` and not yet
  /// anonymized, setting their `anonymized_at = timestamp`. Returns the
  /// number of rows redacted.
  fn anonymize_signatures(
    &self,
    petition_id: Uuid,
    timestamp: DateTime<Utc>,
    limit: Option<u32>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Count of signatures still eligible for redaction under `timestamp`.
  fn unanonymized_count(
    &self,
    petition_id: Uuid,
    timestamp: DateTime<Utc>,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Stamp the petition's `anonymized_at`, if not already set (monotonic).
  fn set_petition_anonymized_at(
    &self,
    petition_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Invalidations ─────────────────────────────────────────────────────

  /// Persist a new invalidation record. Returns an error for an empty rule.
  fn create_invalidation(
    &self,
    rule: MatchRule,
  ) -> impl Future<Output = Result<InvalidationRecord, Self::Error>> + Send + '_;

  fn get_invalidation(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<InvalidationRecord>, Self::Error>> + Send + '_;

  /// Execute an invalidation record: flip matching validated signatures to
  /// `Invalidated`, decrement each affected petition's aggregates, and
  /// stamp the record's counters and `executed_at` — all in one
  /// transaction. Returns `None` if the record is missing or was already
  /// executed.
  fn run_invalidation(
    &self,
    id: Uuid,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<InvalidationOutcome>, Self::Error>> + Send + '_;
}

// ─── TaskQueue ───────────────────────────────────────────────────────────────

/// The durable task queue backing the worker pool.
pub trait TaskQueue: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn enqueue(
    &self,
    task: NewTask,
  ) -> impl Future<Output = Result<TaskEnvelope, Self::Error>> + Send + '_;

  /// Atomically pop the next due task (highest priority first, then
  /// earliest `run_at`). A popped task is never re-delivered: a job that
  /// starts always runs to completion or failure.
  fn pop_due(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<TaskEnvelope>, Self::Error>> + Send + '_;

  /// All queued tasks, in pop order. For operators and tests.
  fn pending_tasks(
    &self,
  ) -> impl Future<Output = Result<Vec<TaskEnvelope>, Self::Error>> + Send + '_;
}

// ─── ArchiveStore ────────────────────────────────────────────────────────────

/// The long-term archive store. Only ever written by the archival migrator;
/// writes are idempotent so that batch tasks can be re-run and reordered.
pub trait ArchiveStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Copy a petition header and its dependent records, preserving original
  /// timestamps exactly. Idempotent.
  fn copy_petition<'a>(
    &'a self,
    petition: &'a Petition,
    records: &'a [PetitionRecord],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Copy signature rows, preserving `seq` and all timestamps. Idempotent.
  fn copy_signatures<'a>(
    &'a self,
    signatures: &'a [Signature],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_petition(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Petition>, Self::Error>> + Send + '_;

  /// Number of archived signatures under a petition; compared against the
  /// live ledger before deletion is allowed.
  fn signature_count(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn signatures(
    &self,
    petition_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Signature>, Self::Error>> + Send + '_;
}
