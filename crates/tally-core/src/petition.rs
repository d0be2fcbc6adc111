//! Petition — the aggregate root of the signature ledger.
//!
//! A petition carries denormalized aggregate state (`signature_count`,
//! `last_signed_at`) that is advanced by the counter reconciler and only ever
//! decremented by the invalidation engine. The `archived_at` and
//! `anonymized_at` stamps are the durable audit trail of the archival and
//! anonymization pipelines; no other path may set them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a petition. Everything except `Open` is terminal; the
/// timestamp of the terminal transition lives in
/// [`Petition::state_changed_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PetitionState {
  Open,
  Closed,
  Rejected,
  Hidden,
}

impl PetitionState {
  pub fn is_terminal(self) -> bool { !matches!(self, Self::Open) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Petition {
  pub petition_id:      Uuid,
  /// The petition's headline request, e.g. "Repeal the widget tax".
  pub action:           String,
  pub state:            PetitionState,
  /// When the petition entered its terminal state. `None` while open.
  pub state_changed_at: Option<DateTime<Utc>>,
  /// Denormalized count of validated signatures, eventually consistent with
  /// the ledger.
  pub signature_count:  i64,
  pub last_signed_at:   Option<DateTime<Utc>>,
  pub created_at:       DateTime<Utc>,
  pub updated_at:       DateTime<Utc>,
  /// Set exactly once, when migration to the archive store is verified
  /// complete (zero un-migrated signatures remain).
  pub archived_at:      Option<DateTime<Utc>>,
  /// Set exactly once, when zero un-anonymized signatures remain.
  pub anonymized_at:    Option<DateTime<Utc>>,
  /// While set, a count reset is in flight and the counter reconciler must
  /// not touch this petition's aggregates.
  pub count_reset_at:   Option<DateTime<Utc>>,
}

impl Petition {
  /// The moment this petition's retention clock started ticking.
  pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
    self.state.is_terminal().then_some(self.state_changed_at).flatten()
  }
}

/// Input to [`crate::store::LedgerStore::create_petition`].
/// Timestamps and the zeroed aggregate fields are set by the store.
#[derive(Debug, Clone)]
pub struct NewPetition {
  pub action: String,
}
