//! Invalidation records — operator-supplied match rules and their outcomes.
//!
//! An invalidation record is executed at most once. After execution it is
//! immutable and survives petition deletion as a standing audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, signature::Signature};

/// The match rule of an invalidation: any combination of fields, at least one
/// required. A signature matches when every set field matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRule {
  pub ip_address: Option<String>,
  pub email:      Option<String>,
  pub name:       Option<String>,
  pub postcode:   Option<String>,
}

impl MatchRule {
  /// Reject rules with no fields set — an empty rule would match the entire
  /// ledger.
  pub fn validate(&self) -> Result<()> {
    if self.ip_address.is_none()
      && self.email.is_none()
      && self.name.is_none()
      && self.postcode.is_none()
    {
      return Err(Error::EmptyMatchRule);
    }
    Ok(())
  }

  /// Whether `signature` matches every set field of this rule.
  pub fn matches(&self, signature: &Signature) -> bool {
    fn field_matches(want: &Option<String>, have: &Option<String>) -> bool {
      match want {
        Some(w) => have.as_deref() == Some(w.as_str()),
        None => true,
      }
    }

    field_matches(&self.ip_address, &signature.ip_address)
      && field_matches(&self.email, &signature.email)
      && field_matches(&self.name, &signature.name)
      && field_matches(&self.postcode, &signature.postcode)
  }
}

/// A stored match rule plus outcome counters, recorded once execution
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRecord {
  pub invalidation_id:   Uuid,
  pub rule:              MatchRule,
  pub created_at:        DateTime<Utc>,
  pub executed_at:       Option<DateTime<Utc>>,
  /// Validated rows found by the rule at execution time.
  pub matching_count:    i64,
  /// Rows actually transitioned to `Invalidated`.
  pub invalidated_count: i64,
}

impl InvalidationRecord {
  pub fn is_executed(&self) -> bool { self.executed_at.is_some() }
}

/// The aggregate decrement applied to one petition by an invalidation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PetitionImpact {
  pub petition_id: Uuid,
  pub invalidated: i64,
}

/// The outcome of executing an invalidation record.
#[derive(Debug, Clone)]
pub struct InvalidationOutcome {
  pub matching_count:    i64,
  pub invalidated_count: i64,
  pub petitions:         Vec<PetitionImpact>,
}
