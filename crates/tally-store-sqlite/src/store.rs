//! [`SqliteStore`] — the SQLite implementation of [`LedgerStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use tally_core::{
  invalidation::{
    InvalidationOutcome, InvalidationRecord, MatchRule, PetitionImpact,
  },
  journal::{CountDelta, Journal},
  petition::{NewPetition, Petition, PetitionState},
  record::{NewPetitionRecord, PetitionRecord},
  signature::{NewSignature, Signature, SignatureState},
  store::LedgerStore,
};

use crate::{
  Error, Result,
  encode::{
    RawJournal, RawPetition, RawRecord, RawSignature, encode_dimension,
    encode_dt, encode_opt_dt, encode_petition_state, encode_signature_state,
    encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// The live ledger store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Row mappers ─────────────────────────────────────────────────────────────

pub(crate) fn petition_from_row(
  row: &rusqlite::Row<'_>,
) -> rusqlite::Result<RawPetition> {
  Ok(RawPetition {
    petition_id:      row.get(0)?,
    action:           row.get(1)?,
    state:            row.get(2)?,
    state_changed_at: row.get(3)?,
    signature_count:  row.get(4)?,
    last_signed_at:   row.get(5)?,
    created_at:       row.get(6)?,
    updated_at:       row.get(7)?,
    archived_at:      row.get(8)?,
    anonymized_at:    row.get(9)?,
    count_reset_at:   row.get(10)?,
  })
}

pub(crate) const PETITION_COLUMNS: &str = "petition_id, action, state, \
   state_changed_at, signature_count, last_signed_at, created_at, \
   updated_at, archived_at, anonymized_at, count_reset_at";

pub(crate) fn signature_from_row(
  row: &rusqlite::Row<'_>,
) -> rusqlite::Result<RawSignature> {
  Ok(RawSignature {
    seq:               row.get(0)?,
    signature_id:      row.get(1)?,
    petition_id:       row.get(2)?,
    name:              row.get(3)?,
    email:             row.get(4)?,
    postcode:          row.get(5)?,
    ip_address:        row.get(6)?,
    location_code:     row.get(7)?,
    constituency_code: row.get(8)?,
    state:             row.get(9)?,
    created_at:        row.get(10)?,
    validated_at:      row.get(11)?,
    invalidated_at:    row.get(12)?,
    anonymized_at:     row.get(13)?,
    archived:          row.get(14)?,
  })
}

pub(crate) const SIGNATURE_COLUMNS: &str = "seq, signature_id, petition_id, \
   name, email, postcode, ip_address, location_code, constituency_code, \
   state, created_at, validated_at, invalidated_at, anonymized_at, archived";

/// The outcome of the invalidation transaction, before decoding.
enum InvalidationRun {
  /// Record missing or already executed; nothing changed.
  Skipped,
  Done {
    matching_count:    i64,
    invalidated_count: i64,
    petitions:         Vec<(String, i64)>,
  },
}

// ─── LedgerStore impl ────────────────────────────────────────────────────────

impl LedgerStore for SqliteStore {
  type Error = Error;

  // ── Petitions ─────────────────────────────────────────────────────────────

  async fn create_petition(&self, input: NewPetition) -> Result<Petition> {
    let now = Utc::now();
    let petition = Petition {
      petition_id:      Uuid::new_v4(),
      action:           input.action,
      state:            PetitionState::Open,
      state_changed_at: None,
      signature_count:  0,
      last_signed_at:   None,
      created_at:       now,
      updated_at:       now,
      archived_at:      None,
      anonymized_at:    None,
      count_reset_at:   None,
    };

    let id_str     = encode_uuid(petition.petition_id);
    let action     = petition.action.clone();
    let state_str  = encode_petition_state(petition.state).to_owned();
    let at_str     = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO petitions (petition_id, action, state, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)",
          rusqlite::params![id_str, action, state_str, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(petition)
  }

  async fn get_petition(&self, id: Uuid) -> Result<Option<Petition>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawPetition> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {PETITION_COLUMNS} FROM petitions WHERE petition_id = ?1"
              ),
              rusqlite::params![id_str],
              petition_from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPetition::into_petition).transpose()
  }

  async fn set_petition_state(
    &self,
    id: Uuid,
    state: PetitionState,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let id_str    = encode_uuid(id);
    let state_str = encode_petition_state(state).to_owned();
    let at_str    = encode_dt(at);
    let terminal  = state.is_terminal();

    let changed = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE petitions
           SET state            = ?2,
               state_changed_at = CASE WHEN ?3 THEN ?4 ELSE NULL END,
               updated_at       = ?4
           WHERE petition_id = ?1",
          rusqlite::params![id_str, state_str, terminal, at_str],
        )?;
        Ok(changed)
      })
      .await?;

    if changed == 0 {
      return Err(Error::PetitionNotFound(id));
    }
    Ok(())
  }

  async fn set_count_reset(
    &self,
    id: Uuid,
    at: Option<DateTime<Utc>>,
  ) -> Result<()> {
    let id_str = encode_uuid(id);
    let at_str = encode_opt_dt(at);

    let changed = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE petitions SET count_reset_at = ?2 WHERE petition_id = ?1",
          rusqlite::params![id_str, at_str],
        )?;
        Ok(changed)
      })
      .await?;

    if changed == 0 {
      return Err(Error::PetitionNotFound(id));
    }
    Ok(())
  }

  async fn petitions_past_retention(
    &self,
    terminal_before: DateTime<Utc>,
  ) -> Result<Vec<Petition>> {
    let before_str = encode_dt(terminal_before);

    let raws: Vec<RawPetition> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PETITION_COLUMNS} FROM petitions
           WHERE state != 'open'
             AND state_changed_at IS NOT NULL
             AND state_changed_at < ?1
             AND anonymized_at IS NULL
           ORDER BY state_changed_at"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![before_str], petition_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPetition::into_petition).collect()
  }

  // ── Signatures ────────────────────────────────────────────────────────────

  async fn record_signature(&self, input: NewSignature) -> Result<Signature> {
    let now = Utc::now();
    let signature_id = Uuid::new_v4();

    let id_str       = encode_uuid(signature_id);
    let petition_str = encode_uuid(input.petition_id);
    let at_str       = encode_dt(now);
    let state_str    = encode_signature_state(SignatureState::Pending).to_owned();
    let input_moved  = input.clone();

    let seq: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO signatures (
             signature_id, petition_id, name, email, postcode, ip_address,
             location_code, constituency_code, state, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
          rusqlite::params![
            id_str,
            petition_str,
            input_moved.name,
            input_moved.email,
            input_moved.postcode,
            input_moved.ip_address,
            input_moved.location_code,
            input_moved.constituency_code,
            state_str,
            at_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Signature {
      signature_id,
      seq,
      petition_id:       input.petition_id,
      name:              Some(input.name),
      email:             Some(input.email),
      postcode:          Some(input.postcode),
      ip_address:        Some(input.ip_address),
      location_code:     input.location_code,
      constituency_code: input.constituency_code,
      state:             SignatureState::Pending,
      created_at:        now,
      validated_at:      None,
      invalidated_at:    None,
      anonymized_at:     None,
      archived:          false,
    })
  }

  async fn get_signature(&self, id: Uuid) -> Result<Option<Signature>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawSignature> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE signature_id = ?1"
              ),
              rusqlite::params![id_str],
              signature_from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawSignature::into_signature).transpose()
  }

  async fn validate_signature(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    let id_str = encode_uuid(id);
    let at_str = encode_dt(at);

    let (changed, exists) = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE signatures
           SET state = 'validated', validated_at = ?2
           WHERE signature_id = ?1 AND state = 'pending'",
          rusqlite::params![id_str, at_str],
        )?;

        let exists: bool = conn
          .query_row(
            "SELECT 1 FROM signatures WHERE signature_id = ?1",
            rusqlite::params![id_str],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);

        Ok((changed, exists))
      })
      .await?;

    // Validating an already-validated signature is a no-op, not an error.
    if changed == 0 && !exists {
      return Err(Error::SignatureNotFound(id));
    }
    Ok(())
  }

  async fn signatures_validated_between(
    &self,
    from: Option<DateTime<Utc>>,
    to: DateTime<Utc>,
  ) -> Result<Vec<Signature>> {
    let from_str = encode_opt_dt(from);
    let to_str   = encode_dt(to);

    let raws: Vec<RawSignature> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SIGNATURE_COLUMNS} FROM signatures
           WHERE state = 'validated'
             AND (?1 IS NULL OR validated_at >= ?1)
             AND validated_at < ?2
           ORDER BY seq"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![from_str.as_deref(), to_str],
            signature_from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSignature::into_signature).collect()
  }

  // ── Aggregates ────────────────────────────────────────────────────────────

  async fn apply_count_delta(
    &self,
    petition_id: Uuid,
    delta: CountDelta,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let id_str      = encode_uuid(petition_id);
    let now_str     = encode_dt(now);
    let signed_str  = encode_opt_dt(delta.last_signed_at);
    let count       = delta.signatures;
    let journals: Vec<(String, String, i64)> = delta
      .journals
      .into_iter()
      .map(|j| (encode_dimension(j.dimension).to_owned(), j.key, j.count))
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.execute(
          "UPDATE petitions
           SET signature_count = signature_count + ?2,
               last_signed_at  = CASE
                 WHEN ?3 IS NOT NULL
                  AND (last_signed_at IS NULL OR last_signed_at < ?3)
                 THEN ?3 ELSE last_signed_at END,
               updated_at      = ?4
           WHERE petition_id = ?1",
          rusqlite::params![id_str, count, signed_str.as_deref(), now_str],
        )?;

        {
          let mut stmt = tx.prepare(
            "INSERT INTO journals
               (petition_id, dimension, key, signature_count, last_signed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (petition_id, dimension, key) DO UPDATE SET
               signature_count = signature_count + excluded.signature_count,
               last_signed_at  = CASE
                 WHEN excluded.last_signed_at IS NOT NULL
                  AND (last_signed_at IS NULL
                       OR last_signed_at < excluded.last_signed_at)
                 THEN excluded.last_signed_at ELSE last_signed_at END",
          )?;
          for (dimension, key, count) in &journals {
            stmt.execute(rusqlite::params![
              id_str,
              dimension,
              key,
              count,
              signed_str.as_deref(),
            ])?;
          }
        }

        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn reset_petition_count(
    &self,
    petition_id: Uuid,
    upto: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let id_str   = encode_uuid(petition_id);
    let upto_str = encode_opt_dt(upto);
    let now_str  = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        // Only signatures validated before the reconciled horizon count;
        // everything later belongs to a future reconciliation window.
        tx.execute(
          "UPDATE petitions
           SET signature_count = (
                 SELECT COUNT(*) FROM signatures
                 WHERE petition_id = ?1
                   AND state = 'validated'
                   AND ?2 IS NOT NULL AND validated_at < ?2
               ),
               last_signed_at  = (
                 SELECT MAX(validated_at) FROM signatures
                 WHERE petition_id = ?1
                   AND state = 'validated'
                   AND ?2 IS NOT NULL AND validated_at < ?2
               ),
               updated_at      = ?3,
               count_reset_at  = NULL
           WHERE petition_id = ?1",
          rusqlite::params![id_str, upto_str.as_deref(), now_str],
        )?;

        tx.execute(
          "DELETE FROM journals WHERE petition_id = ?1",
          rusqlite::params![id_str],
        )?;

        {
          let mut stmt = tx.prepare(
            "INSERT INTO journals
               (petition_id, dimension, key, signature_count, last_signed_at)
             SELECT petition_id, ?2, grouping, COUNT(*), MAX(validated_at)
             FROM (
               SELECT petition_id,
                      CASE ?2
                        WHEN 'constituency' THEN constituency_code
                        ELSE location_code
                      END AS grouping,
                      validated_at
               FROM signatures
               WHERE petition_id = ?1
                 AND state = 'validated'
                 AND ?3 IS NOT NULL AND validated_at < ?3
             )
             GROUP BY petition_id, grouping",
          )?;
          for dimension in ["constituency", "country"] {
            stmt.execute(rusqlite::params![
              id_str,
              dimension,
              upto_str.as_deref(),
            ])?;
          }
        }

        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn petition_journals(&self, petition_id: Uuid) -> Result<Vec<Journal>> {
    let id_str = encode_uuid(petition_id);

    let raws: Vec<RawJournal> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT petition_id, dimension, key, signature_count, last_signed_at
           FROM journals
           WHERE petition_id = ?1
           ORDER BY dimension, key",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawJournal {
              petition_id:     row.get(0)?,
              dimension:       row.get(1)?,
              key:             row.get(2)?,
              signature_count: row.get(3)?,
              last_signed_at:  row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawJournal::into_journal).collect()
  }

  // ── Watermark & single-writer lock ────────────────────────────────────────

  async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          "SELECT last_reconciled_at FROM reconciliation_state WHERE id = 1",
          [],
          |row| row.get(0),
        )?)
      })
      .await?;

    raw
      .as_deref()
      .map(crate::encode::decode_dt)
      .transpose()
  }

  async fn set_watermark(&self, at: DateTime<Utc>) -> Result<()> {
    let at_str = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE reconciliation_state SET last_reconciled_at = ?1 WHERE id = 1",
          rusqlite::params![at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn try_acquire_lock(&self, name: &str, at: DateTime<Utc>) -> Result<bool> {
    let name   = name.to_owned();
    let at_str = encode_dt(at);

    let changed = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "INSERT OR IGNORE INTO locks (name, acquired_at) VALUES (?1, ?2)",
          rusqlite::params![name, at_str],
        )?;
        Ok(changed)
      })
      .await?;

    Ok(changed == 1)
  }

  async fn release_lock(&self, name: &str) -> Result<()> {
    let name = name.to_owned();

    self
      .conn
      .call(move |conn| {
        conn.execute("DELETE FROM locks WHERE name = ?1", rusqlite::params![name])?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Petition records ──────────────────────────────────────────────────────

  async fn add_petition_record(
    &self,
    input: NewPetitionRecord,
  ) -> Result<PetitionRecord> {
    let record = PetitionRecord {
      record_id:   Uuid::new_v4(),
      petition_id: input.petition_id,
      value:       input.value,
      created_at:  Utc::now(),
    };

    let id_str       = encode_uuid(record.record_id);
    let petition_str = encode_uuid(record.petition_id);
    let kind         = record.value.discriminant().to_owned();
    let value_str    = record.value.to_json().map_err(Error::Core)?.to_string();
    let at_str       = encode_dt(record.created_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO petition_records
             (record_id, petition_id, record_kind, value_json, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, petition_str, kind, value_str, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(record)
  }

  async fn petition_records(
    &self,
    petition_id: Uuid,
  ) -> Result<Vec<PetitionRecord>> {
    let id_str = encode_uuid(petition_id);

    let raws: Vec<RawRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT record_id, petition_id, record_kind, value_json, created_at
           FROM petition_records
           WHERE petition_id = ?1
           ORDER BY created_at",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawRecord {
              record_id:   row.get(0)?,
              petition_id: row.get(1)?,
              record_kind: row.get(2)?,
              value_json:  row.get(3)?,
              created_at:  row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecord::into_record).collect()
  }

  // ── Archival bookkeeping ──────────────────────────────────────────────────

  async fn unarchived_signature_seqs(&self, petition_id: Uuid) -> Result<Vec<i64>> {
    let id_str = encode_uuid(petition_id);

    let seqs = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT seq FROM signatures
           WHERE petition_id = ?1 AND archived = 0
           ORDER BY seq",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(seqs)
  }

  async fn unarchived_signatures_in_range(
    &self,
    petition_id: Uuid,
    from_seq: i64,
    to_seq: i64,
  ) -> Result<Vec<Signature>> {
    let id_str = encode_uuid(petition_id);

    let raws: Vec<RawSignature> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SIGNATURE_COLUMNS} FROM signatures
           WHERE petition_id = ?1 AND archived = 0
             AND seq >= ?2 AND seq <= ?3
           ORDER BY seq"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![id_str, from_seq, to_seq],
            signature_from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSignature::into_signature).collect()
  }

  async fn mark_signatures_archived(
    &self,
    petition_id: Uuid,
    seqs: Vec<i64>,
  ) -> Result<()> {
    let id_str = encode_uuid(petition_id);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "UPDATE signatures SET archived = 1
             WHERE petition_id = ?1 AND seq = ?2",
          )?;
          for seq in &seqs {
            stmt.execute(rusqlite::params![id_str, seq])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn unarchived_signature_count(&self, petition_id: Uuid) -> Result<i64> {
    let id_str = encode_uuid(petition_id);

    let count = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM signatures WHERE petition_id = ?1 AND archived = 0",
          rusqlite::params![id_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count)
  }

  async fn set_archived_at(&self, petition_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    let id_str = encode_uuid(petition_id);
    let at_str = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE petitions SET archived_at = ?2
           WHERE petition_id = ?1 AND archived_at IS NULL",
          rusqlite::params![id_str, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn delete_petitions(&self, ids: &[Uuid]) -> Result<()> {
    let id_strs: Vec<String> = ids.iter().copied().map(encode_uuid).collect();

    let offender: Option<String> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        // Safety boundary: verify the whole batch before touching any row.
        {
          let mut stmt = tx.prepare(
            "SELECT archived_at FROM petitions WHERE petition_id = ?1",
          )?;
          for id_str in &id_strs {
            let archived_at: Option<Option<String>> = stmt
              .query_row(rusqlite::params![id_str], |row| row.get(0))
              .optional()?;
            if let Some(None) = archived_at {
              // Not archived: abort the whole run, deleting nothing.
              return Ok(Some(id_str.clone()));
            }
          }
        }

        {
          let mut journals = tx.prepare(
            "DELETE FROM journals WHERE petition_id = ?1",
          )?;
          let mut records = tx.prepare(
            "DELETE FROM petition_records WHERE petition_id = ?1",
          )?;
          let mut signatures = tx.prepare(
            "DELETE FROM signatures WHERE petition_id = ?1",
          )?;
          let mut petitions = tx.prepare(
            "DELETE FROM petitions WHERE petition_id = ?1",
          )?;
          for id_str in &id_strs {
            journals.execute(rusqlite::params![id_str])?;
            records.execute(rusqlite::params![id_str])?;
            signatures.execute(rusqlite::params![id_str])?;
            petitions.execute(rusqlite::params![id_str])?;
          }
        }

        tx.commit()?;
        Ok(None)
      })
      .await?;

    match offender {
      Some(id_str) => {
        let id = Uuid::parse_str(&id_str).map_err(Error::Uuid)?;
        Err(Error::NotArchived(id))
      }
      None => Ok(()),
    }
  }

  // ── Anonymization ─────────────────────────────────────────────────────────

  async fn anonymize_signatures(
    &self,
    petition_id: Uuid,
    timestamp: DateTime<Utc>,
    limit: Option<u32>,
  ) -> Result<usize> {
    let id_str    = encode_uuid(petition_id);
    let ts_str    = encode_dt(timestamp);
    let limit_val = limit.map(i64::from).unwrap_or(-1);

    let changed = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE signatures
           SET name = NULL, email = NULL, postcode = NULL, ip_address = NULL,
               anonymized_at = ?2
           WHERE signature_id IN (
             SELECT signature_id FROM signatures
             WHERE petition_id = ?1
               AND anonymized_at IS NULL
               AND created_at < ?2
             ORDER BY seq
             LIMIT ?3
           )",
          rusqlite::params![id_str, ts_str, limit_val],
        )?;
        Ok(changed)
      })
      .await?;

    Ok(changed)
  }

  async fn unanonymized_count(
    &self,
    petition_id: Uuid,
    timestamp: DateTime<Utc>,
  ) -> Result<i64> {
    let id_str = encode_uuid(petition_id);
    let ts_str = encode_dt(timestamp);

    let count = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM signatures
           WHERE petition_id = ?1
             AND anonymized_at IS NULL
             AND created_at < ?2",
          rusqlite::params![id_str, ts_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count)
  }

  async fn set_petition_anonymized_at(
    &self,
    petition_id: Uuid,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let id_str = encode_uuid(petition_id);
    let at_str = encode_dt(at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE petitions SET anonymized_at = ?2
           WHERE petition_id = ?1 AND anonymized_at IS NULL",
          rusqlite::params![id_str, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Invalidations ─────────────────────────────────────────────────────────

  async fn create_invalidation(&self, rule: MatchRule) -> Result<InvalidationRecord> {
    rule.validate().map_err(Error::Core)?;

    let record = InvalidationRecord {
      invalidation_id:   Uuid::new_v4(),
      rule,
      created_at:        Utc::now(),
      executed_at:       None,
      matching_count:    0,
      invalidated_count: 0,
    };

    let id_str = encode_uuid(record.invalidation_id);
    let at_str = encode_dt(record.created_at);
    let rule   = record.rule.clone();

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO invalidations
             (invalidation_id, ip_address, email, name, postcode, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![
            id_str,
            rule.ip_address,
            rule.email,
            rule.name,
            rule.postcode,
            at_str,
          ],
        )?;
        Ok(())
      })
      .await?;

    Ok(record)
  }

  async fn get_invalidation(&self, id: Uuid) -> Result<Option<InvalidationRecord>> {
    let id_str = encode_uuid(id);

    let raw: Option<crate::encode::RawInvalidation> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT invalidation_id, ip_address, email, name, postcode,
                      created_at, executed_at, matching_count, invalidated_count
               FROM invalidations WHERE invalidation_id = ?1",
              rusqlite::params![id_str],
              |row| {
                Ok(crate::encode::RawInvalidation {
                  invalidation_id:   row.get(0)?,
                  ip_address:        row.get(1)?,
                  email:             row.get(2)?,
                  name:              row.get(3)?,
                  postcode:          row.get(4)?,
                  created_at:        row.get(5)?,
                  executed_at:       row.get(6)?,
                  matching_count:    row.get(7)?,
                  invalidated_count: row.get(8)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw
      .map(crate::encode::RawInvalidation::into_record)
      .transpose()
  }

  async fn run_invalidation(
    &self,
    id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<Option<InvalidationOutcome>> {
    let id_str  = encode_uuid(id);
    let now_str = encode_dt(now);

    let run: InvalidationRun = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let rule: Option<(Option<String>, Option<String>, Option<String>, Option<String>, Option<String>)> =
          tx.query_row(
            "SELECT ip_address, email, name, postcode, executed_at
             FROM invalidations WHERE invalidation_id = ?1",
            rusqlite::params![id_str],
            |row| {
              Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
          )
          .optional()?;

        let Some((ip_address, email, name, postcode, executed_at)) = rule else {
          return Ok(InvalidationRun::Skipped);
        };
        if executed_at.is_some() {
          return Ok(InvalidationRun::Skipped);
        }

        // The reconciled horizon: only signatures already reflected in the
        // aggregates get decremented. Later ones simply never get counted,
        // because their state is no longer 'validated' when their window
        // is reconciled.
        let watermark: Option<String> = tx.query_row(
          "SELECT last_reconciled_at FROM reconciliation_state WHERE id = 1",
          [],
          |row| row.get(0),
        )?;

        let rule_clause = "state = 'validated'
             AND (?1 IS NULL OR ip_address = ?1)
             AND (?2 IS NULL OR email = ?2)
             AND (?3 IS NULL OR name = ?3)
             AND (?4 IS NULL OR postcode = ?4)";

        // Petition-level decrements, grouped over already-counted rows.
        let counted: Vec<(String, i64)> = {
          let mut stmt = tx.prepare(&format!(
            "SELECT petition_id, COUNT(*) FROM signatures
             WHERE {rule_clause}
               AND ?5 IS NOT NULL AND validated_at < ?5
             GROUP BY petition_id"
          ))?;
          stmt
            .query_map(
              rusqlite::params![ip_address, email, name, postcode, watermark],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        // Journal decrements for the same rows.
        let journal_hits: Vec<(String, String, String, i64)> = {
          let mut stmt = tx.prepare(&format!(
            "SELECT petition_id, constituency_code, location_code, COUNT(*)
             FROM signatures
             WHERE {rule_clause}
               AND ?5 IS NOT NULL AND validated_at < ?5
             GROUP BY petition_id, constituency_code, location_code"
          ))?;
          stmt
            .query_map(
              rusqlite::params![ip_address, email, name, postcode, watermark],
              |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
              },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        // Every affected petition, counted or not, for the outcome report.
        let all_matches: Vec<(String, i64)> = {
          let mut stmt = tx.prepare(&format!(
            "SELECT petition_id, COUNT(*) FROM signatures
             WHERE {rule_clause}
             GROUP BY petition_id"
          ))?;
          stmt
            .query_map(
              rusqlite::params![ip_address, email, name, postcode],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let matching_count: i64 = all_matches.iter().map(|(_, n)| n).sum();

        let invalidated_count = tx.execute(
          &format!(
            "UPDATE signatures
             SET state = 'invalidated', invalidated_at = ?5
             WHERE {rule_clause}"
          ),
          rusqlite::params![ip_address, email, name, postcode, now_str],
        )? as i64;

        {
          let mut stmt = tx.prepare(
            "UPDATE petitions
             SET signature_count = signature_count - ?2, updated_at = ?3
             WHERE petition_id = ?1",
          )?;
          for (petition_id, n) in &counted {
            stmt.execute(rusqlite::params![petition_id, n, now_str])?;
          }
        }

        {
          let mut stmt = tx.prepare(
            "UPDATE journals SET signature_count = signature_count - ?4
             WHERE petition_id = ?1 AND dimension = ?2 AND key = ?3",
          )?;
          for (petition_id, constituency, location, n) in &journal_hits {
            stmt.execute(rusqlite::params![
              petition_id,
              "constituency",
              constituency,
              n
            ])?;
            stmt.execute(rusqlite::params![petition_id, "country", location, n])?;
          }
        }

        tx.execute(
          "UPDATE invalidations
           SET executed_at = ?2, matching_count = ?3, invalidated_count = ?4
           WHERE invalidation_id = ?1",
          rusqlite::params![id_str, now_str, matching_count, invalidated_count],
        )?;

        tx.commit()?;
        Ok(InvalidationRun::Done {
          matching_count,
          invalidated_count,
          petitions: all_matches,
        })
      })
      .await?;

    match run {
      InvalidationRun::Skipped => Ok(None),
      InvalidationRun::Done {
        matching_count,
        invalidated_count,
        petitions,
      } => {
        let petitions = petitions
          .into_iter()
          .map(|(id_str, invalidated)| {
            Ok(PetitionImpact {
              petition_id: Uuid::parse_str(&id_str).map_err(Error::Uuid)?,
              invalidated,
            })
          })
          .collect::<Result<Vec<_>>>()?;

        Ok(Some(InvalidationOutcome {
          matching_count,
          invalidated_count,
          petitions,
        }))
      }
    }
  }
}
