//! Signature — one row of the authoritative ledger.
//!
//! Signatures move `pending → validated → {invalidated, fraudulent}` and are
//! never deleted individually; they are copied into the archive store and
//! removed only when their petition is deleted. Personal fields become
//! nullable so that anonymization can redact them in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureState {
  Pending,
  Validated,
  Invalidated,
  Fraudulent,
}

impl SignatureState {
  pub fn is_validated(self) -> bool { matches!(self, Self::Validated) }
}

/// One citizen's support for a petition. Immutable once archived, except for
/// the redaction fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
  pub signature_id:      Uuid,
  /// Store-assigned monotonic sequence number. Archival batches partition
  /// the ledger into disjoint `seq` ranges, so batch tasks commute.
  pub seq:               i64,
  pub petition_id:       Uuid,
  pub name:              Option<String>,
  pub email:             Option<String>,
  pub postcode:          Option<String>,
  pub ip_address:        Option<String>,
  /// Country code derived from the postcode at submission.
  pub location_code:     String,
  pub constituency_code: String,
  pub state:             SignatureState,
  pub created_at:        DateTime<Utc>,
  pub validated_at:      Option<DateTime<Utc>>,
  pub invalidated_at:    Option<DateTime<Utc>>,
  /// Monotonic: once set, never cleared.
  pub anonymized_at:     Option<DateTime<Utc>>,
  /// Set once this row has been copied into the archive store.
  pub archived:          bool,
}

/// Input to [`crate::store::LedgerStore::record_signature`].
/// `seq`, `signature_id`, and `created_at` are assigned by the store; the
/// signature starts out `Pending`.
#[derive(Debug, Clone)]
pub struct NewSignature {
  pub petition_id:       Uuid,
  pub name:              String,
  pub email:             String,
  pub postcode:          String,
  pub ip_address:        String,
  pub location_code:     String,
  pub constituency_code: String,
}
