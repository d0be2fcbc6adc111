//! End-to-end pipeline tests over in-memory SQLite stores.
//!
//! Tests drive the pipeline deterministically: jobs are triggered by
//! enqueueing their tasks and calling [`Runner::tick`] with fixed clocks.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tally_core::{
  config::PipelineConfig,
  invalidation::MatchRule,
  petition::{NewPetition, PetitionState},
  signature::{NewSignature, SignatureState},
  store::{ArchiveStore, LedgerStore, TaskQueue},
  task::{NewTask, Task},
};
use tally_store_sqlite::{SqliteArchive, SqliteStore};
use uuid::Uuid;

use crate::{
  notify::{LogNotifier, Recipient, resolve},
  reconciler, Runner,
};

fn cfg() -> PipelineConfig {
  PipelineConfig {
    archive_delay_secs: 0,
    archive_poll_interval_secs: 0,
    signature_batch_size: 2,
    ..PipelineConfig::default()
  }
}

async fn runner() -> Runner<SqliteStore, SqliteArchive, LogNotifier> {
  let store = SqliteStore::open_in_memory().await.expect("in-memory store");
  let archive = SqliteArchive::open_in_memory()
    .await
    .expect("in-memory archive");
  Runner::new(store, archive, LogNotifier, cfg())
}

/// Handles onto the runner's stores; the connections are reference-counted.
fn stores(
  runner: &Runner<SqliteStore, SqliteArchive, LogNotifier>,
) -> (SqliteStore, SqliteArchive) {
  (runner.store().clone(), runner.archive().clone())
}

fn at(hour: u32, min: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 6, 1, hour, min, 0).unwrap()
}

async fn petition(s: &SqliteStore) -> Uuid {
  s.create_petition(NewPetition {
    action: "Ban the gadget levy".into(),
  })
  .await
  .unwrap()
  .petition_id
}

fn new_signature(petition_id: Uuid, n: u32, ip: &str) -> NewSignature {
  NewSignature {
    petition_id,
    name:              format!("Signer {n}"),
    email:             format!("signer{n}@example.com"),
    postcode:          "SW1A 1AA".into(),
    ip_address:        ip.into(),
    location_code:     "GB".into(),
    constituency_code: "E00001".into(),
  }
}

async fn sign_validated(
  s: &SqliteStore,
  petition_id: Uuid,
  n: u32,
  ip: &str,
  validated_at: DateTime<Utc>,
) {
  for i in 0..n {
    let sig = s
      .record_signature(new_signature(petition_id, i, ip))
      .await
      .unwrap();
    s.validate_signature(sig.signature_id, validated_at)
      .await
      .unwrap();
  }
}

async fn sign_pending(s: &SqliteStore, petition_id: Uuid, n: u32) {
  for i in 0..n {
    s.record_signature(new_signature(petition_id, 100 + i, "10.9.9.9"))
      .await
      .unwrap();
  }
}

async fn count(s: &SqliteStore, petition_id: Uuid) -> i64 {
  s.get_petition(petition_id)
    .await
    .unwrap()
    .unwrap()
    .signature_count
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reconcile_counts_each_signature_exactly_once() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 3, "10.0.0.1", at(9, 0)).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();
  assert_eq!(count(&s, pid).await, 3);

  // The reconciler re-enqueued itself; the next run sees an empty window.
  r.tick(at(10, 1)).await.unwrap();
  assert_eq!(count(&s, pid).await, 3);
}

#[tokio::test]
async fn reconcile_window_lags_now_by_one_interval() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;

  sign_validated(&s, pid, 1, "10.0.0.1", at(9, 0)).await;
  // Validated 10 seconds before the run: inside the lag, outside the window.
  let late = at(10, 0) - Duration::seconds(10);
  sign_validated(&s, pid, 1, "10.0.0.2", late).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();
  assert_eq!(count(&s, pid).await, 1);

  // The next window picks up the late signature. Exactly once overall.
  r.tick(at(10, 1)).await.unwrap();
  assert_eq!(count(&s, pid).await, 2);
}

#[tokio::test]
async fn reconcile_ignores_pending_signatures() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;

  sign_pending(&s, pid, 4).await;
  sign_validated(&s, pid, 2, "10.0.0.1", at(9, 0)).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();
  assert_eq!(count(&s, pid).await, 2);
}

#[tokio::test]
async fn reconcile_skips_while_lock_held() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 2, "10.0.0.1", at(9, 0)).await;

  s.try_acquire_lock(reconciler::RECONCILER_LOCK, at(9, 59))
    .await
    .unwrap();
  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();

  // The run was skipped but the cadence was preserved.
  assert_eq!(count(&s, pid).await, 0);
  assert!(s.watermark().await.unwrap().is_none());
  assert_eq!(s.pending_tasks().await.unwrap().len(), 1);

  s.release_lock(reconciler::RECONCILER_LOCK).await.unwrap();
  r.tick(at(10, 1)).await.unwrap();
  assert_eq!(count(&s, pid).await, 2);
}

#[tokio::test]
async fn reconcile_defers_petition_with_pending_reset() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 3, "10.0.0.1", at(9, 0)).await;
  s.set_count_reset(pid, Some(at(9, 30))).await.unwrap();

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();

  // The delta was deferred but the watermark still advanced.
  assert_eq!(count(&s, pid).await, 0);
  assert!(s.watermark().await.unwrap().is_some());

  // The recompute covers everything below the watermark and clears the
  // flag; nothing is counted twice afterwards.
  s.enqueue(NewTask::new(
    at(10, 1),
    Task::ResetPetitionCount { petition_id: pid },
  ))
  .await
  .unwrap();
  r.tick(at(10, 1)).await.unwrap();
  assert_eq!(count(&s, pid).await, 3);
  assert!(
    s.get_petition(pid)
      .await
      .unwrap()
      .unwrap()
      .count_reset_at
      .is_none()
  );

  r.tick(at(10, 2)).await.unwrap();
  assert_eq!(count(&s, pid).await, 3);
}

// ─── Archival ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn archival_copies_everything_and_stamps_archived_at() {
  let r = runner().await;
  let (s, a) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 5, "10.0.0.1", at(9, 0)).await;
  s.set_petition_state(pid, PetitionState::Closed, at(9, 30))
    .await
    .unwrap();

  let now = at(10, 0);
  r.schedule_archival(pid, now).await.unwrap();
  r.tick(now).await.unwrap();

  // Batch size 2 over 5 signatures: three disjoint batches, all drained.
  assert_eq!(a.signature_count(pid).await.unwrap(), 5);
  assert_eq!(s.unarchived_signature_count(pid).await.unwrap(), 0);

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.archived_at, Some(now));

  let archived = a.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(archived.state, PetitionState::Closed);
  assert_eq!(archived.created_at, p.created_at);
}

#[tokio::test]
async fn archival_refuses_non_terminal_petition() {
  let r = runner().await;
  let (s, a) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 2, "10.0.0.1", at(9, 0)).await;

  // Still open: the copy task fails and nothing reaches the archive.
  let now = at(10, 0);
  r.schedule_archival(pid, now).await.unwrap();
  r.tick(now).await.unwrap();

  assert!(a.get_petition(pid).await.unwrap().is_none());
  assert!(s.get_petition(pid).await.unwrap().unwrap().archived_at.is_none());
}

#[tokio::test]
async fn archived_at_requires_zero_unmigrated_signatures() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 3, "10.0.0.1", at(9, 0)).await;

  // A completion check with batches still in flight re-enqueues itself
  // instead of stamping.
  crate::archiver::check_archive_complete(&s, r.config(), pid, at(10, 0))
    .await
    .unwrap();

  assert!(s.get_petition(pid).await.unwrap().unwrap().archived_at.is_none());
  assert_eq!(s.pending_tasks().await.unwrap().len(), 1);
}

#[tokio::test]
async fn deletion_is_all_or_nothing() {
  let r = runner().await;
  let (s, _) = stores(&r);

  // One fully-archived petition...
  let done = petition(&s).await;
  sign_validated(&s, done, 2, "10.0.0.1", at(9, 0)).await;
  s.set_petition_state(done, PetitionState::Closed, at(9, 30))
    .await
    .unwrap();
  r.schedule_archival(done, at(10, 0)).await.unwrap();
  r.tick(at(10, 0)).await.unwrap();

  // ...and one that never went through migration.
  let live = petition(&s).await;
  sign_validated(&s, live, 2, "10.0.0.2", at(9, 0)).await;

  assert!(r.delete_petitions(&[done, live]).await.is_err());
  assert!(s.get_petition(done).await.unwrap().is_some());
  assert!(s.get_petition(live).await.unwrap().is_some());

  // The archived one alone deletes cleanly.
  r.delete_petitions(&[done]).await.unwrap();
  assert!(s.get_petition(done).await.unwrap().is_none());
  assert!(s.get_petition(live).await.unwrap().is_some());
}

// ─── Anonymization ───────────────────────────────────────────────────────────

#[tokio::test]
async fn anonymization_redacts_in_batches_then_stamps() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 5, "10.0.0.1", Utc::now()).await;

  let now = Utc::now() + Duration::hours(1);
  s.enqueue(NewTask::new(now, Task::AnonymizePetition {
    petition_id: pid,
    timestamp:   now,
    limit:       Some(2),
  }))
  .await
  .unwrap();
  // One tick drains the whole tail-recursive run: three redaction passes
  // and the final stamping pass.
  r.tick(now).await.unwrap();

  assert_eq!(s.unanonymized_count(pid, now).await.unwrap(), 0);
  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.anonymized_at, Some(now));

  // Re-running the task with a later timestamp redacts nothing further and
  // keeps the original stamp.
  let later = now + Duration::hours(1);
  s.enqueue(NewTask::new(later, Task::AnonymizePetition {
    petition_id: pid,
    timestamp:   later,
    limit:       Some(2),
  }))
  .await
  .unwrap();
  r.tick(later).await.unwrap();

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.anonymized_at, Some(now));
}

#[tokio::test]
async fn sweep_schedules_runs_for_petitions_past_retention() {
  let r = runner().await;
  let (s, _) = stores(&r);

  let old = petition(&s).await;
  sign_validated(&s, old, 2, "10.0.0.1", Utc::now()).await;
  s.set_petition_state(
    old,
    PetitionState::Closed,
    Utc::now() - Duration::days(200),
  )
  .await
  .unwrap();

  let fresh = petition(&s).await;
  sign_validated(&s, fresh, 2, "10.0.0.2", Utc::now()).await;
  s.set_petition_state(
    fresh,
    PetitionState::Closed,
    Utc::now() - Duration::days(10),
  )
  .await
  .unwrap();

  let now = Utc::now() + Duration::hours(1);
  s.enqueue(NewTask::new(now, Task::AnonymizationSweep))
    .await
    .unwrap();
  r.tick(now).await.unwrap();

  // Only the petition past the 183-day retention period was redacted.
  let old_p = s.get_petition(old).await.unwrap().unwrap();
  assert_eq!(old_p.anonymized_at, Some(now));
  let fresh_p = s.get_petition(fresh).await.unwrap().unwrap();
  assert!(fresh_p.anonymized_at.is_none());

  let sig = s
    .signatures_validated_between(None, now)
    .await
    .unwrap()
    .into_iter()
    .find(|sig| sig.petition_id == old)
    .unwrap();
  assert!(sig.name.is_none());
  assert!(sig.email.is_none());
}

// ─── Invalidation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalidation_decrements_counted_signatures() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 4, "10.0.0.1", at(9, 0)).await;
  sign_validated(&s, pid, 2, "192.168.1.1", at(9, 0)).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();
  assert_eq!(count(&s, pid).await, 6);

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("192.168.1.1".into()),
      ..Default::default()
    })
    .await
    .unwrap();
  s.enqueue(NewTask::new(at(10, 1), Task::ExecuteInvalidation {
    invalidation_id: record.invalidation_id,
  }))
  .await
  .unwrap();
  r.tick(at(10, 1)).await.unwrap();

  assert_eq!(count(&s, pid).await, 4);
  let stored = s
    .get_invalidation(record.invalidation_id)
    .await
    .unwrap()
    .unwrap();
  assert!(stored.is_executed());
  assert_eq!(stored.matching_count, 2);
  assert_eq!(stored.invalidated_count, 2);

  // Running the task again is a no-op.
  s.enqueue(NewTask::new(at(10, 2), Task::ExecuteInvalidation {
    invalidation_id: record.invalidation_id,
  }))
  .await
  .unwrap();
  r.tick(at(10, 2)).await.unwrap();
  assert_eq!(count(&s, pid).await, 4);
}

#[tokio::test]
async fn invalidation_spans_petitions_atomically() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let first = petition(&s).await;
  let second = petition(&s).await;
  sign_validated(&s, first, 3, "172.16.0.9", at(9, 0)).await;
  sign_validated(&s, second, 1, "172.16.0.9", at(9, 0)).await;
  sign_validated(&s, second, 2, "10.0.0.1", at(9, 0)).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("172.16.0.9".into()),
      ..Default::default()
    })
    .await
    .unwrap();
  s.enqueue(NewTask::new(at(10, 1), Task::ExecuteInvalidation {
    invalidation_id: record.invalidation_id,
  }))
  .await
  .unwrap();
  r.tick(at(10, 1)).await.unwrap();

  assert_eq!(count(&s, first).await, 0);
  assert_eq!(count(&s, second).await, 2);

  let stored = s
    .get_invalidation(record.invalidation_id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(stored.invalidated_count, 4);

  // Invalidated rows really changed state, and nothing the rule did not
  // match was touched.
  let remaining = s
    .signatures_validated_between(None, at(10, 0))
    .await
    .unwrap();
  assert_eq!(remaining.len(), 2);
  assert!(remaining.iter().all(|sig| sig.state == SignatureState::Validated));
  assert!(remaining.iter().all(|sig| !stored.rule.matches(sig)));
}

#[tokio::test]
async fn invalidation_defers_while_aggregate_lock_held() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 2, "192.168.1.1", at(9, 0)).await;

  s.enqueue(NewTask::new(at(10, 0), Task::ReconcileCounts))
    .await
    .unwrap();
  r.tick(at(10, 0)).await.unwrap();
  assert_eq!(count(&s, pid).await, 2);

  let record = s
    .create_invalidation(MatchRule {
      ip_address: Some("192.168.1.1".into()),
      ..Default::default()
    })
    .await
    .unwrap();

  // While another aggregate writer holds the lock the execution task
  // re-queues itself rather than racing the reconciler.
  s.try_acquire_lock(reconciler::RECONCILER_LOCK, at(10, 0))
    .await
    .unwrap();
  s.enqueue(NewTask::new(at(10, 1), Task::ExecuteInvalidation {
    invalidation_id: record.invalidation_id,
  }))
  .await
  .unwrap();
  r.tick(at(10, 1)).await.unwrap();

  assert_eq!(count(&s, pid).await, 2);
  let stored = s
    .get_invalidation(record.invalidation_id)
    .await
    .unwrap()
    .unwrap();
  assert!(!stored.is_executed());

  s.release_lock(reconciler::RECONCILER_LOCK).await.unwrap();
  r.tick(at(10, 2)).await.unwrap();

  assert_eq!(count(&s, pid).await, 0);
  let stored = s
    .get_invalidation(record.invalidation_id)
    .await
    .unwrap()
    .unwrap();
  assert!(stored.is_executed());
  assert_eq!(stored.invalidated_count, 2);
}

#[tokio::test]
async fn count_reset_defers_while_aggregate_lock_held() {
  let r = runner().await;
  let (s, _) = stores(&r);
  let pid = petition(&s).await;
  sign_validated(&s, pid, 3, "10.0.0.1", at(9, 0)).await;
  s.set_count_reset(pid, Some(at(9, 30))).await.unwrap();
  s.set_watermark(at(9, 45)).await.unwrap();

  s.try_acquire_lock(reconciler::RECONCILER_LOCK, at(9, 59))
    .await
    .unwrap();
  s.enqueue(NewTask::new(
    at(10, 0),
    Task::ResetPetitionCount { petition_id: pid },
  ))
  .await
  .unwrap();
  r.tick(at(10, 0)).await.unwrap();

  // Deferred: the flag is still set and no recompute ran.
  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert_eq!(p.count_reset_at, Some(at(9, 30)));
  assert_eq!(p.signature_count, 0);

  s.release_lock(reconciler::RECONCILER_LOCK).await.unwrap();
  r.tick(at(10, 1)).await.unwrap();

  let p = s.get_petition(pid).await.unwrap().unwrap();
  assert!(p.count_reset_at.is_none());
  assert_eq!(p.signature_count, 3);
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[test]
fn notification_kinds_resolve_to_templates() {
  let pid = Uuid::new_v4();
  let n = resolve(tally_core::task::NotificationKind::SignaturesInvalidated {
    petition_id: pid,
    invalidated: 3,
  });
  assert_eq!(n.template, "signatures_invalidated");
  assert_eq!(n.recipient, Recipient::Creator);

  let n = resolve(tally_core::task::NotificationKind::PetitionClosed {
    petition_id: pid,
  });
  assert_eq!(n.template, "petition_closed");
  assert_eq!(n.recipient, Recipient::Signers);
}
