//! Error type for `tally-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] tally_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("column decode error: {0}")]
  Decode(String),

  #[error("petition not found: {0}")]
  PetitionNotFound(uuid::Uuid),

  #[error("signature not found: {0}")]
  SignatureNotFound(uuid::Uuid),

  /// The deletion safety boundary — surfaced, never swallowed.
  #[error("petition {0} has no archived_at stamp; deletion run aborted")]
  NotArchived(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
