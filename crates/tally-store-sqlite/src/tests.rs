//! Integration tests for `SqliteStore` and `SqliteArchive` against in-memory
//! databases.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tally_core::{
  invalidation::MatchRule,
  journal::{CountDelta, JournalDimension},
  petition::{NewPetition, PetitionState},
  record::{NewPetitionRecord, RecordValue},
  signature::{NewSignature, SignatureState},
  store::{ArchiveStore, LedgerStore, TaskQueue},
  task::{NewTask, Task},
};
use uuid::Uuid;

use crate::{SqliteArchive, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory().await.expect("in-memory store")
}

async fn archive() -> SqliteArchive {
  SqliteArchive::open_in_memory()
    .await
    .expect("in-memory archive")
}

fn at(hour: u32, min: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 6, 1, hour, min, 0).unwrap()
}

fn new_signature(petition_id: Uuid, n: u32) -> NewSignature {
  NewSignature {
    petition_id,
    name:              format!("Signer {n}"),
    email:             format!("signer{n}@example.com"),
    postcode:          "SW1A 1AA".into(),
    ip_address:        "10.0.1.1".into(),
    location_code:     "GB".into(),
    constituency_code: format!("E{:05}", n % 3),
  }
}

async fn petition(s: &SqliteStore) -> Uuid {
  s.create_petition(NewPetition {
    action: "Repeal the widget tax".into(),
  })
  .await
  .unwrap()
  .petition_id
}

/// Record and validate `n` signatures at `validated_at`.
async fn sign_and_validate(
  s: &SqliteStore,
  petition_id: Uuid,
  n: u32,
  validated_at: DateTime<Utc>,
) -> Vec<Uuid> {
  let mut ids = Vec::new();
  for i in 0..n {
    let sig = s
      .record_signature(new_signature(petition_id, i))
      .await
      .unwrap();
    s.validate_signature(sig.signature_id, validated_at)
      .await
      .unwrap();
    ids.push(sig.signature_id);
  }
  ids
}

// ─── Petitions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_petition() {
  let s = store().await;
  let id = petition(&s).await;

  let fetched = s.get_petition(id).await.unwrap().unwrap();
  assert_eq!(fetched.petition_id, id);
  assert_eq!(fetched.state, PetitionState::Open);
  assert_eq!(fetched.signature_count, 0);
  assert!(fetched.archived_at.is_none());
}

#[tokio::test]
async fn get_petition_missing_returns_none() {
  let s = store().await;
  assert!(s.get_petition(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_transition_stamps_state_changed_at() {
  let s = store().await;
  let id = petition(&s).await;

  s.set_petition_state(id, PetitionState::Closed, at(12, 0))
    .await
    .unwrap();

  let p = s.get_petition(id).await.unwrap().unwrap();
  assert_eq!(p.state, PetitionState::Closed);
  assert_eq!(p.state_changed_at, Some(at(12, 0)));
  assert_eq!(p.terminal_at(), Some(at(12, 0)));
}

// ─── Signatures ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn record_and_validate_signature() {
  let s = store().await;
  let pid = petition(&s).await;

  let sig = s.record_signature(new_signature(pid, 1)).await.unwrap();
  assert_eq!(sig.state, SignatureState::Pending);
  assert!(sig.seq > 0);

  s.validate_signature(sig.signature_id, at(9, 0)).await.unwrap();

  let fetched = s.get_signature(sig.signature_id).await.unwrap().unwrap();
  assert_eq!(fetched.state, SignatureState::Validated);
  assert_eq!(fetched.validated_at, Some(at(9, 0)));
}

#[tokio::test]
async fn validate_twice_keeps_first_timestamp() {
  let s = store().await;
  let pid = petition(&s).await;

  let sig = s.record_signature(new_signature(pid, 1)).await.unwrap();
  s.validate_signature(sig.signature_id, at(9, 0)).await.unwrap();
  s.validate_signature(sig.signature_id, at(10, 0)).await.unwrap();

  let fetched = s.get_signature(sig.signature_id).await.unwrap().unwrap();
  assert_eq!(fetched.validated_at, Some(at(9, 0)));
}

#[tokio::test]
async fn validate_missing_signature_errors() {
  let s = store().await;
  let err = s.validate_signature(Uuid::new_v4(), at(9, 0)).await.unwrap_err();
  assert!(matches!(err, crate::Error::SignatureNotFound(_)));
}

#[tokio::test]
async fn validated_between_is_half_open() {
  let s = store().await;
  let pid = petition(&s).await;

  sign_and_validate(&s, pid, 1, at(9, 0)).await;
  sign_and_validate(&s, pid, 1, at(10, 0)).await;
  sign_and_validate(&s, pid, 1, at(11, 0)).await;

  // [09:30, 11:00) — only the 10:00 signature.
  let window = s
    .signatures_validated_between(Some(at(9, 30)), at(11, 0))
    .await
    .unwrap();
  assert_eq!(window.len(), 1);
  assert_eq!(window[0].validated_at, Some(at(10, 0)));

  // Unbounded start.
  let window = s
    .signatures_validated_between(None, at(10, 30))
    .await
    .unwrap();
  assert_eq!(window.len(), 2);
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_count_delta_updates_petition_and_journals() {
  let s = store().await;
  let pid = petition(&s).await;

  sign_and_validate(&s, pid, 3, at(9, 0)).await;
  let window = s
    .signatures_validated_between(None, at(10, 0))
    .await
    .unwrap();
  let deltas = CountDelta::group(&window);
  let delta = deltas.get(&pid).unwrap().clone();

  s.apply_count_delta(pid, delta, at(10, 0)).await.unwrap();

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.signature_count, 3);
  assert_eq!(p.last_signed_at, Some(at(9, 0)));

  let journals = s.petition_journals(pid).await.unwrap();
  let constituency_total: i64 = journals
    .iter()
    .filter(|j| j.dimension == JournalDimension::Constituency)
    .map(|j| j.signature_count)
    .sum();
  let country_total: i64 = journals
    .iter()
    .filter(|j| j.dimension == JournalDimension::Country)
    .map(|j| j.signature_count)
    .sum();
  assert_eq!(constituency_total, 3);
  assert_eq!(country_total, 3);
}

#[tokio::test]
async fn reset_petition_count_recomputes_from_ledger() {
  let s = store().await;
  let pid = petition(&s).await;

  sign_and_validate(&s, pid, 4, at(9, 0)).await;
  // Aggregates deliberately wrong.
  s.apply_count_delta(
    pid,
    CountDelta {
      signatures:     10,
      last_signed_at: Some(at(9, 0)),
      journals:       vec![],
    },
    at(10, 0),
  )
  .await
  .unwrap();
  s.set_count_reset(pid, Some(at(10, 0))).await.unwrap();

  // Horizon covers the four validated signatures.
  s.reset_petition_count(pid, Some(at(9, 30)), at(10, 5))
    .await
    .unwrap();

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.signature_count, 4);
  assert!(p.count_reset_at.is_none());

  let journals = s.petition_journals(pid).await.unwrap();
  let total: i64 = journals
    .iter()
    .filter(|j| j.dimension == JournalDimension::Country)
    .map(|j| j.signature_count)
    .sum();
  assert_eq!(total, 4);
}

// ─── Watermark & locks ───────────────────────────────────────────────────────

#[tokio::test]
async fn watermark_round_trip() {
  let s = store().await;
  assert!(s.watermark().await.unwrap().is_none());

  s.set_watermark(at(9, 0)).await.unwrap();
  assert_eq!(s.watermark().await.unwrap(), Some(at(9, 0)));

  s.set_watermark(at(10, 0)).await.unwrap();
  assert_eq!(s.watermark().await.unwrap(), Some(at(10, 0)));
}

#[tokio::test]
async fn lock_is_exclusive_until_released() {
  let s = store().await;

  assert!(s.try_acquire_lock("reconciler", at(9, 0)).await.unwrap());
  assert!(!s.try_acquire_lock("reconciler", at(9, 1)).await.unwrap());
  // A differently-named lock is independent.
  assert!(s.try_acquire_lock("other", at(9, 1)).await.unwrap());

  s.release_lock("reconciler").await.unwrap();
  assert!(s.try_acquire_lock("reconciler", at(9, 2)).await.unwrap());
}

// ─── Petition records ────────────────────────────────────────────────────────

#[tokio::test]
async fn petition_record_round_trip() {
  let s = store().await;
  let pid = petition(&s).await;

  s.add_petition_record(NewPetitionRecord {
    petition_id: pid,
    value:       RecordValue::RejectionReason {
      code:    "duplicate".into(),
      details: Some("Already raised as petition 42".into()),
    },
  })
  .await
  .unwrap();
  s.add_petition_record(NewPetitionRecord {
    petition_id: pid,
    value:       RecordValue::Note("Checked by moderation".into()),
  })
  .await
  .unwrap();

  let records = s.petition_records(pid).await.unwrap();
  assert_eq!(records.len(), 2);
  assert!(records.iter().any(|r| matches!(
    &r.value,
    RecordValue::RejectionReason { code, .. } if code == "duplicate"
  )));
}

// ─── Task queue ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn queue_pops_in_priority_then_time_order() {
  let s = store().await;

  s.enqueue(NewTask::new(at(9, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  s.enqueue(NewTask::high(
    at(9, 30),
    Task::CopySignatureBatch {
      petition_id: Uuid::new_v4(),
      from_seq:    1,
      to_seq:      100,
    },
  ))
  .await
  .unwrap();
  s.enqueue(NewTask::new(at(8, 0), Task::AnonymizationSweep))
    .await
    .unwrap();

  // High priority wins even though it was due later.
  let first = s.pop_due(at(10, 0)).await.unwrap().unwrap();
  assert!(matches!(first.task, Task::CopySignatureBatch { .. }));

  let second = s.pop_due(at(10, 0)).await.unwrap().unwrap();
  assert_eq!(second.task, Task::AnonymizationSweep);

  let third = s.pop_due(at(10, 0)).await.unwrap().unwrap();
  assert_eq!(third.task, Task::ReconcileCounts);

  assert!(s.pop_due(at(10, 0)).await.unwrap().is_none());
}

#[tokio::test]
async fn queue_ignores_tasks_not_yet_due() {
  let s = store().await;

  s.enqueue(NewTask::new(at(11, 0), Task::ReconcileCounts))
    .await
    .unwrap();

  assert!(s.pop_due(at(10, 0)).await.unwrap().is_none());
  assert_eq!(s.pending_tasks().await.unwrap().len(), 1);

  assert!(s.pop_due(at(11, 0)).await.unwrap().is_some());
  assert!(s.pending_tasks().await.unwrap().is_empty());
}

// ─── Anonymization ───────────────────────────────────────────────────────────

#[tokio::test]
async fn anonymize_batch_respects_limit_and_is_idempotent() {
  let s = store().await;
  let pid = petition(&s).await;
  sign_and_validate(&s, pid, 5, at(9, 0)).await;

  let ts = Utc::now() + Duration::hours(1);

  let first = s.anonymize_signatures(pid, ts, Some(2)).await.unwrap();
  assert_eq!(first, 2);
  assert_eq!(s.unanonymized_count(pid, ts).await.unwrap(), 3);

  let second = s.anonymize_signatures(pid, ts, None).await.unwrap();
  assert_eq!(second, 3);
  assert_eq!(s.unanonymized_count(pid, ts).await.unwrap(), 0);

  // Already-redacted rows are never touched again.
  let third = s.anonymize_signatures(pid, ts, None).await.unwrap();
  assert_eq!(third, 0);
}

#[tokio::test]
async fn anonymized_at_is_monotonic() {
  let s = store().await;
  let pid = petition(&s).await;

  s.set_petition_anonymized_at(pid, at(9, 0)).await.unwrap();
  s.set_petition_anonymized_at(pid, at(10, 0)).await.unwrap();

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.anonymized_at, Some(at(9, 0)));
}

#[tokio::test]
async fn anonymize_nulls_personal_fields() {
  let s = store().await;
  let pid = petition(&s).await;
  let ids = sign_and_validate(&s, pid, 1, at(9, 0)).await;

  let ts = Utc::now() + Duration::hours(1);
  s.anonymize_signatures(pid, ts, None).await.unwrap();

  let sig = s.get_signature(ids[0]).await.unwrap().unwrap();
  assert!(sig.name.is_none());
  assert!(sig.email.is_none());
  assert!(sig.postcode.is_none());
  assert!(sig.ip_address.is_none());
  assert_eq!(sig.anonymized_at, Some(ts));
  // Non-personal attribution survives redaction.
  assert_eq!(sig.location_code, "GB");
}

// ─── Archival & deletion ─────────────────────────────────────────────────────

#[tokio::test]
async fn archive_copy_preserves_rows_and_is_idempotent() {
  let s = store().await;
  let a = archive().await;
  let pid = petition(&s).await;
  sign_and_validate(&s, pid, 3, at(9, 0)).await;

  let p = s.get_petition(pid).await.unwrap().unwrap();
  let records = s.petition_records(pid).await.unwrap();
  a.copy_petition(&p, &records).await.unwrap();

  let seqs = s.unarchived_signature_seqs(pid).await.unwrap();
  assert_eq!(seqs.len(), 3);

  let sigs = s
    .unarchived_signatures_in_range(pid, seqs[0], seqs[2])
    .await
    .unwrap();
  a.copy_signatures(&sigs).await.unwrap();
  // Re-running the same batch copies nothing new.
  a.copy_signatures(&sigs).await.unwrap();
  assert_eq!(a.signature_count(pid).await.unwrap(), 3);

  s.mark_signatures_archived(pid, seqs).await.unwrap();
  assert_eq!(s.unarchived_signature_count(pid).await.unwrap(), 0);

  let archived = a.signatures(pid).await.unwrap();
  assert_eq!(archived.len(), 3);
  assert_eq!(archived[0].validated_at, Some(at(9, 0)));
}

#[tokio::test]
async fn delete_refuses_unarchived_petition_and_deletes_nothing() {
  let s = store().await;
  let archived_pid = petition(&s).await;
  let live_pid = petition(&s).await;
  sign_and_validate(&s, live_pid, 2, at(9, 0)).await;

  s.set_archived_at(archived_pid, at(12, 0)).await.unwrap();

  let err = s
    .delete_petitions(&[archived_pid, live_pid])
    .await
    .unwrap_err();
  assert!(matches!(err, crate::Error::NotArchived(id) if id == live_pid));

  // All-or-nothing: the archived petition survived too.
  assert!(s.get_petition(archived_pid).await.unwrap().is_some());
  assert!(s.get_petition(live_pid).await.unwrap().is_some());
  assert_eq!(s.unarchived_signature_count(live_pid).await.unwrap(), 2);
}

#[tokio::test]
async fn delete_cascades_but_keeps_invalidations() {
  let s = store().await;
  let pid = petition(&s).await;
  sign_and_validate(&s, pid, 2, at(9, 0)).await;
  s.add_petition_record(NewPetitionRecord {
    petition_id: pid,
    value:       RecordValue::Note("note".into()),
  })
  .await
  .unwrap();

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("10.0.1.1".into()),
      ..Default::default()
    })
    .await
    .unwrap();

  s.set_archived_at(pid, at(12, 0)).await.unwrap();
  s.delete_petitions(&[pid]).await.unwrap();

  assert!(s.get_petition(pid).await.unwrap().is_none());
  assert!(s.petition_records(pid).await.unwrap().is_empty());
  assert_eq!(s.unarchived_signature_count(pid).await.unwrap(), 0);
  // The audit trail is retained.
  assert!(
    s.get_invalidation(record.invalidation_id)
      .await
      .unwrap()
      .is_some()
  );
}

// ─── Invalidations ───────────────────────────────────────────────────────────

#[tokio::test]
async fn create_invalidation_rejects_empty_rule() {
  let s = store().await;
  let err = s.create_invalidation(MatchRule::default()).await.unwrap_err();
  assert!(matches!(
    err,
    crate::Error::Core(tally_core::Error::EmptyMatchRule)
  ));
}

#[tokio::test]
async fn run_invalidation_flips_rows_and_decrements_counted() {
  let s = store().await;
  let pid = petition(&s).await;
  sign_and_validate(&s, pid, 2, at(9, 0)).await;

  // Reflect the two signatures in the aggregates, then move the horizon
  // past them.
  let window = s
    .signatures_validated_between(None, at(10, 0))
    .await
    .unwrap();
  let delta = CountDelta::group(&window).remove(&pid).unwrap();
  s.apply_count_delta(pid, delta, at(10, 0)).await.unwrap();
  s.set_watermark(at(10, 0)).await.unwrap();

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("10.0.1.1".into()),
      ..Default::default()
    })
    .await
    .unwrap();

  let outcome = s
    .run_invalidation(record.invalidation_id, at(11, 0))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(outcome.matching_count, 2);
  assert_eq!(outcome.invalidated_count, 2);

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.signature_count, 0);

  let stored = s
    .get_invalidation(record.invalidation_id)
    .await
    .unwrap()
    .unwrap();
  assert!(stored.is_executed());
  assert_eq!(stored.matching_count, 2);
  assert_eq!(stored.invalidated_count, 2);

  // A second run is skipped: the record is already executed.
  let rerun = s
    .run_invalidation(record.invalidation_id, at(12, 0))
    .await
    .unwrap();
  assert!(rerun.is_none());
}

#[tokio::test]
async fn run_invalidation_skips_uncounted_signatures() {
  let s = store().await;
  let pid = petition(&s).await;
  sign_and_validate(&s, pid, 2, at(9, 0)).await;
  // No reconciliation has happened: watermark unset, count still zero.

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("10.0.1.1".into()),
      ..Default::default()
    })
    .await
    .unwrap();

  let outcome = s
    .run_invalidation(record.invalidation_id, at(11, 0))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(outcome.invalidated_count, 2);

  // The rows were never counted, so nothing is decremented.
  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.signature_count, 0);
}

#[tokio::test]
async fn run_invalidation_missing_record_returns_none() {
  let s = store().await;
  let outcome = s.run_invalidation(Uuid::new_v4(), at(11, 0)).await.unwrap();
  assert!(outcome.is_none());
}
