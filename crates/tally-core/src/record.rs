//! Petition records — the petition's dependent associations.
//!
//! Rejection reasons, government responses, debate outcomes, notes, petition
//! emails, and per-channel email receipts are near-identical rows: a typed
//! payload hanging off a petition. They are modelled as one table with a
//! discriminant column and a JSON payload. All of them are copied verbatim
//! during archival and deleted with the petition.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// The typed payload of a petition record. The variant name serves as the
/// `record_kind` discriminant stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RecordValue {
  RejectionReason {
    code:    String,
    details: Option<String>,
  },
  GovernmentResponse {
    summary:      String,
    details:      String,
    responded_at: DateTime<Utc>,
  },
  DebateOutcome {
    debated_on:     NaiveDate,
    overview:       Option<String>,
    transcript_url: Option<String>,
    video_url:      Option<String>,
  },
  /// Free-text moderator note.
  Note(String),
  /// A petition-level email sent to signers.
  Email {
    subject: String,
    body:    String,
    sent_at: Option<DateTime<Utc>>,
  },
  /// A per-channel "email me about this" receipt.
  EmailReceipt {
    channel:      String,
    requested_at: DateTime<Utc>,
  },
}

impl RecordValue {
  /// The discriminant string stored in the `record_kind` column.
  /// Must match the `rename_all = "snake_case"` serde tags above.
  pub fn discriminant(&self) -> &'static str {
    match self {
      Self::RejectionReason { .. } => "rejection_reason",
      Self::GovernmentResponse { .. } => "government_response",
      Self::DebateOutcome { .. } => "debate_outcome",
      Self::Note(_) => "note",
      Self::Email { .. } => "email",
      Self::EmailReceipt { .. } => "email_receipt",
    }
  }

  /// Serialise the inner payload (without the type tag) for the `value_json`
  /// database column.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    // The full serialised form is `{"type": "...", "data": <payload>}`.
    // We want only the payload.
    let full = serde_json::to_value(self)?;
    Ok(full.get("data").cloned().unwrap_or(serde_json::Value::Null))
  }

  /// Deserialise from the discriminant string and JSON payload stored in the
  /// database.
  pub fn from_parts(
    discriminant: &str,
    data: serde_json::Value,
  ) -> Result<Self> {
    let wrapped = serde_json::json!({ "type": discriminant, "data": data });
    Ok(serde_json::from_value(wrapped)?)
  }
}

/// A dependent record owned by exactly one petition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PetitionRecord {
  pub record_id:   Uuid,
  pub petition_id: Uuid,
  pub value:       RecordValue,
  /// Preserved exactly (no precision loss) when copied to the archive.
  pub created_at:  DateTime<Utc>,
}

/// Input to [`crate::store::LedgerStore::add_petition_record`].
#[derive(Debug, Clone)]
pub struct NewPetitionRecord {
  pub petition_id: Uuid,
  pub value:       RecordValue,
}
