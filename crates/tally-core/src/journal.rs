//! Per-dimension journals and the reconciliation delta applied to them.
//!
//! A journal is a running count keyed by `(petition, dimension, key)`. Per
//! petition and dimension, the sum of journal counts equals
//! `signature_count` once reconciliation has caught up.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signature::Signature;

/// The dimension a journal row aggregates over.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JournalDimension {
  Constituency,
  Country,
}

/// A per-petition, per-dimension running count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
  pub petition_id:     Uuid,
  pub dimension:       JournalDimension,
  pub key:             String,
  pub signature_count: i64,
  pub last_signed_at:  Option<DateTime<Utc>>,
}

/// A single journal row's increment within a [`CountDelta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalIncrement {
  pub dimension: JournalDimension,
  pub key:       String,
  pub count:     i64,
}

/// One petition's contribution from a reconciliation window. Applied to the
/// petition row and its journals as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct CountDelta {
  pub signatures:     i64,
  pub last_signed_at: Option<DateTime<Utc>>,
  pub journals:       Vec<JournalIncrement>,
}

impl CountDelta {
  /// Fold a window of validated signatures into per-petition deltas.
  ///
  /// The input need not be sorted; rows that are not currently `Validated`
  /// or carry no `validated_at` are ignored (they cannot belong to any
  /// window).
  pub fn group(signatures: &[Signature]) -> BTreeMap<Uuid, CountDelta> {
    let mut deltas: BTreeMap<Uuid, CountDelta> = BTreeMap::new();
    let mut journals: BTreeMap<Uuid, BTreeMap<(JournalDimension, String), i64>> =
      BTreeMap::new();

    for signature in signatures {
      if !signature.state.is_validated() {
        continue;
      }
      let Some(validated_at) = signature.validated_at else {
        continue;
      };

      let delta = deltas.entry(signature.petition_id).or_default();
      delta.signatures += 1;
      delta.last_signed_at = Some(match delta.last_signed_at {
        Some(prev) => prev.max(validated_at),
        None => validated_at,
      });

      let by_key = journals.entry(signature.petition_id).or_default();
      *by_key
        .entry((
          JournalDimension::Constituency,
          signature.constituency_code.clone(),
        ))
        .or_default() += 1;
      *by_key
        .entry((JournalDimension::Country, signature.location_code.clone()))
        .or_default() += 1;
    }

    for (petition_id, by_key) in journals {
      let delta = deltas.entry(petition_id).or_default();
      delta.journals = by_key
        .into_iter()
        .map(|((dimension, key), count)| JournalIncrement {
          dimension,
          key,
          count,
        })
        .collect();
    }

    deltas
  }
}
