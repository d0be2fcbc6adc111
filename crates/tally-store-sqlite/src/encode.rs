//! Encoding and decoding helpers between Rust domain types and the
//! plain-text representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings (always UTC, so string
//! comparison preserves ordering). UUIDs are stored as hyphenated lowercase
//! strings. Typed payloads (record values, task payloads) are stored as
//! compact JSON next to their discriminant column.

use chrono::{DateTime, Utc};
use tally_core::{
  invalidation::{InvalidationRecord, MatchRule},
  journal::{Journal, JournalDimension},
  petition::{Petition, PetitionState},
  record::{PetitionRecord, RecordValue},
  signature::{Signature, SignatureState},
  task::{Priority, Task, TaskEnvelope},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_opt_dt(dt: Option<DateTime<Utc>>) -> Option<String> {
  dt.map(encode_dt)
}

pub fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── PetitionState ───────────────────────────────────────────────────────────

pub fn encode_petition_state(s: PetitionState) -> &'static str {
  match s {
    PetitionState::Open => "open",
    PetitionState::Closed => "closed",
    PetitionState::Rejected => "rejected",
    PetitionState::Hidden => "hidden",
  }
}

pub fn decode_petition_state(s: &str) -> Result<PetitionState> {
  match s {
    "open" => Ok(PetitionState::Open),
    "closed" => Ok(PetitionState::Closed),
    "rejected" => Ok(PetitionState::Rejected),
    "hidden" => Ok(PetitionState::Hidden),
    other => Err(Error::Decode(format!("unknown petition state: {other:?}"))),
  }
}

// ─── SignatureState ──────────────────────────────────────────────────────────

pub fn encode_signature_state(s: SignatureState) -> &'static str {
  match s {
    SignatureState::Pending => "pending",
    SignatureState::Validated => "validated",
    SignatureState::Invalidated => "invalidated",
    SignatureState::Fraudulent => "fraudulent",
  }
}

pub fn decode_signature_state(s: &str) -> Result<SignatureState> {
  match s {
    "pending" => Ok(SignatureState::Pending),
    "validated" => Ok(SignatureState::Validated),
    "invalidated" => Ok(SignatureState::Invalidated),
    "fraudulent" => Ok(SignatureState::Fraudulent),
    other => Err(Error::Decode(format!("unknown signature state: {other:?}"))),
  }
}

// ─── JournalDimension ────────────────────────────────────────────────────────

pub fn encode_dimension(d: JournalDimension) -> &'static str {
  match d {
    JournalDimension::Constituency => "constituency",
    JournalDimension::Country => "country",
  }
}

pub fn decode_dimension(s: &str) -> Result<JournalDimension> {
  match s {
    "constituency" => Ok(JournalDimension::Constituency),
    "country" => Ok(JournalDimension::Country),
    other => Err(Error::Decode(format!("unknown journal dimension: {other:?}"))),
  }
}

// ─── Priority ────────────────────────────────────────────────────────────────

pub fn encode_priority(p: Priority) -> i64 {
  match p {
    Priority::Normal => 0,
    Priority::High => 1,
  }
}

pub fn decode_priority(v: i64) -> Result<Priority> {
  match v {
    0 => Ok(Priority::Normal),
    1 => Ok(Priority::High),
    other => Err(Error::Decode(format!("unknown task priority: {other}"))),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `petitions` row.
pub struct RawPetition {
  pub petition_id:      String,
  pub action:           String,
  pub state:            String,
  pub state_changed_at: Option<String>,
  pub signature_count:  i64,
  pub last_signed_at:   Option<String>,
  pub created_at:       String,
  pub updated_at:       String,
  pub archived_at:      Option<String>,
  pub anonymized_at:    Option<String>,
  pub count_reset_at:   Option<String>,
}

impl RawPetition {
  pub fn into_petition(self) -> Result<Petition> {
    Ok(Petition {
      petition_id:      decode_uuid(&self.petition_id)?,
      action:           self.action,
      state:            decode_petition_state(&self.state)?,
      state_changed_at: decode_opt_dt(self.state_changed_at.as_deref())?,
      signature_count:  self.signature_count,
      last_signed_at:   decode_opt_dt(self.last_signed_at.as_deref())?,
      created_at:       decode_dt(&self.created_at)?,
      updated_at:       decode_dt(&self.updated_at)?,
      archived_at:      decode_opt_dt(self.archived_at.as_deref())?,
      anonymized_at:    decode_opt_dt(self.anonymized_at.as_deref())?,
      count_reset_at:   decode_opt_dt(self.count_reset_at.as_deref())?,
    })
  }
}

/// Raw strings read directly from a `signatures` row.
pub struct RawSignature {
  pub seq:               i64,
  pub signature_id:      String,
  pub petition_id:       String,
  pub name:              Option<String>,
  pub email:             Option<String>,
  pub postcode:          Option<String>,
  pub ip_address:        Option<String>,
  pub location_code:     String,
  pub constituency_code: String,
  pub state:             String,
  pub created_at:        String,
  pub validated_at:      Option<String>,
  pub invalidated_at:    Option<String>,
  pub anonymized_at:     Option<String>,
  pub archived:          bool,
}

impl RawSignature {
  pub fn into_signature(self) -> Result<Signature> {
    Ok(Signature {
      signature_id:      decode_uuid(&self.signature_id)?,
      seq:               self.seq,
      petition_id:       decode_uuid(&self.petition_id)?,
      name:              self.name,
      email:             self.email,
      postcode:          self.postcode,
      ip_address:        self.ip_address,
      location_code:     self.location_code,
      constituency_code: self.constituency_code,
      state:             decode_signature_state(&self.state)?,
      created_at:        decode_dt(&self.created_at)?,
      validated_at:      decode_opt_dt(self.validated_at.as_deref())?,
      invalidated_at:    decode_opt_dt(self.invalidated_at.as_deref())?,
      anonymized_at:     decode_opt_dt(self.anonymized_at.as_deref())?,
      archived:          self.archived,
    })
  }
}

/// Raw strings read directly from a `journals` row.
pub struct RawJournal {
  pub petition_id:     String,
  pub dimension:       String,
  pub key:             String,
  pub signature_count: i64,
  pub last_signed_at:  Option<String>,
}

impl RawJournal {
  pub fn into_journal(self) -> Result<Journal> {
    Ok(Journal {
      petition_id:     decode_uuid(&self.petition_id)?,
      dimension:       decode_dimension(&self.dimension)?,
      key:             self.key,
      signature_count: self.signature_count,
      last_signed_at:  decode_opt_dt(self.last_signed_at.as_deref())?,
    })
  }
}

/// Raw strings read directly from a `petition_records` row.
pub struct RawRecord {
  pub record_id:   String,
  pub petition_id: String,
  pub record_kind: String,
  pub value_json:  String,
  pub created_at:  String,
}

impl RawRecord {
  pub fn into_record(self) -> Result<PetitionRecord> {
    let data: serde_json::Value = serde_json::from_str(&self.value_json)?;
    Ok(PetitionRecord {
      record_id:   decode_uuid(&self.record_id)?,
      petition_id: decode_uuid(&self.petition_id)?,
      value:       RecordValue::from_parts(&self.record_kind, data)?,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from an `invalidations` row.
pub struct RawInvalidation {
  pub invalidation_id:   String,
  pub ip_address:        Option<String>,
  pub email:             Option<String>,
  pub name:              Option<String>,
  pub postcode:          Option<String>,
  pub created_at:        String,
  pub executed_at:       Option<String>,
  pub matching_count:    i64,
  pub invalidated_count: i64,
}

impl RawInvalidation {
  pub fn into_record(self) -> Result<InvalidationRecord> {
    Ok(InvalidationRecord {
      invalidation_id:   decode_uuid(&self.invalidation_id)?,
      rule:              MatchRule {
        ip_address: self.ip_address,
        email:      self.email,
        name:       self.name,
        postcode:   self.postcode,
      },
      created_at:        decode_dt(&self.created_at)?,
      executed_at:       decode_opt_dt(self.executed_at.as_deref())?,
      matching_count:    self.matching_count,
      invalidated_count: self.invalidated_count,
    })
  }
}

/// Raw strings read directly from a `tasks` row.
pub struct RawTask {
  pub task_id:  String,
  pub payload:  String,
  pub priority: i64,
  pub run_at:   String,
}

impl RawTask {
  pub fn into_envelope(self) -> Result<TaskEnvelope> {
    let task: Task = serde_json::from_str(&self.payload)?;
    Ok(TaskEnvelope {
      task_id:  decode_uuid(&self.task_id)?,
      run_at:   decode_dt(&self.run_at)?,
      priority: decode_priority(self.priority)?,
      task,
    })
  }
}
