//! [`SqliteArchive`] — the SQLite implementation of [`ArchiveStore`].
//!
//! Writes use `INSERT OR IGNORE` so that copy tasks can be re-run and
//! reordered freely; original timestamps and `seq` values are carried over
//! verbatim.

use std::path::Path;

use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use tally_core::{
  petition::Petition,
  record::PetitionRecord,
  signature::Signature,
  store::ArchiveStore,
};

use crate::{
  Error, Result,
  encode::{
    RawPetition, RawSignature, encode_dt, encode_opt_dt,
    encode_petition_state, encode_signature_state, encode_uuid,
  },
  schema::ARCHIVE_SCHEMA,
};

/// The long-term archive backed by its own SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteArchive {
  conn: tokio_rusqlite::Connection,
}

impl SqliteArchive {
  /// Open (or create) an archive at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let archive = Self { conn };
    archive.init_schema().await?;
    Ok(archive)
  }

  /// Open an in-memory archive — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let archive = Self { conn };
    archive.init_schema().await?;
    Ok(archive)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(ARCHIVE_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl ArchiveStore for SqliteArchive {
  type Error = Error;

  async fn copy_petition(
    &self,
    petition: &Petition,
    records: &[PetitionRecord],
  ) -> Result<()> {
    let id_str      = encode_uuid(petition.petition_id);
    let action      = petition.action.clone();
    let state_str   = encode_petition_state(petition.state).to_owned();
    let changed_str = encode_opt_dt(petition.state_changed_at);
    let count       = petition.signature_count;
    let signed_str  = encode_opt_dt(petition.last_signed_at);
    let created_str = encode_dt(petition.created_at);
    let updated_str = encode_dt(petition.updated_at);
    let anon_str    = encode_opt_dt(petition.anonymized_at);

    let mut record_rows = Vec::with_capacity(records.len());
    for record in records {
      record_rows.push((
        encode_uuid(record.record_id),
        encode_uuid(record.petition_id),
        record.value.discriminant().to_owned(),
        record.value.to_json().map_err(Error::Core)?.to_string(),
        encode_dt(record.created_at),
      ));
    }

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.execute(
          "INSERT OR IGNORE INTO petitions (
             petition_id, action, state, state_changed_at, signature_count,
             last_signed_at, created_at, updated_at, anonymized_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          rusqlite::params![
            id_str,
            action,
            state_str,
            changed_str,
            count,
            signed_str,
            created_str,
            updated_str,
            anon_str,
          ],
        )?;

        {
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO petition_records
               (record_id, petition_id, record_kind, value_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
          )?;
          for (record_id, petition_id, kind, value_json, created_at) in
            &record_rows
          {
            stmt.execute(rusqlite::params![
              record_id,
              petition_id,
              kind,
              value_json,
              created_at,
            ])?;
          }
        }

        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn copy_signatures(&self, signatures: &[Signature]) -> Result<()> {
    let rows: Vec<_> = signatures
      .iter()
      .map(|s| {
        (
          s.seq,
          encode_uuid(s.signature_id),
          encode_uuid(s.petition_id),
          s.name.clone(),
          s.email.clone(),
          s.postcode.clone(),
          s.ip_address.clone(),
          s.location_code.clone(),
          s.constituency_code.clone(),
          encode_signature_state(s.state).to_owned(),
          encode_dt(s.created_at),
          encode_opt_dt(s.validated_at),
          encode_opt_dt(s.invalidated_at),
          encode_opt_dt(s.anonymized_at),
        )
      })
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO signatures (
               seq, signature_id, petition_id, name, email, postcode,
               ip_address, location_code, constituency_code, state,
               created_at, validated_at, invalidated_at, anonymized_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
          )?;
          for row in &rows {
            stmt.execute(rusqlite::params![
              row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8,
              row.9, row.10, row.11, row.12, row.13,
            ])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_petition(&self, id: Uuid) -> Result<Option<Petition>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawPetition> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT petition_id, action, state, state_changed_at,
                      signature_count, last_signed_at, created_at, updated_at,
                      anonymized_at
               FROM petitions WHERE petition_id = ?1",
              rusqlite::params![id_str],
              |row| {
                Ok(RawPetition {
                  petition_id:      row.get(0)?,
                  action:           row.get(1)?,
                  state:            row.get(2)?,
                  state_changed_at: row.get(3)?,
                  signature_count:  row.get(4)?,
                  last_signed_at:   row.get(5)?,
                  created_at:       row.get(6)?,
                  updated_at:       row.get(7)?,
                  archived_at:      None,
                  anonymized_at:    row.get(8)?,
                  count_reset_at:   None,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawPetition::into_petition).transpose()
  }

  async fn signature_count(&self, petition_id: Uuid) -> Result<i64> {
    let id_str = encode_uuid(petition_id);

    let count = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM signatures WHERE petition_id = ?1",
          rusqlite::params![id_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count)
  }

  async fn signatures(&self, petition_id: Uuid) -> Result<Vec<Signature>> {
    let id_str = encode_uuid(petition_id);

    let raws: Vec<RawSignature> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT seq, signature_id, petition_id, name, email, postcode,
                  ip_address, location_code, constituency_code, state,
                  created_at, validated_at, invalidated_at, anonymized_at
           FROM signatures
           WHERE petition_id = ?1
           ORDER BY seq",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
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
              archived:          true,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSignature::into_signature).collect()
  }
}
