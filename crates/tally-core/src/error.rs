//! Error types for `tally-core`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("petition not found: {0}")]
  PetitionNotFound(Uuid),

  #[error("signature not found: {0}")]
  SignatureNotFound(Uuid),

  /// The deletion safety boundary: raised before any row is removed when a
  /// batch contains a petition whose migration was never verified complete.
  #[error("petition {0} has no archived_at stamp; deletion run aborted")]
  NotArchived(Uuid),

  #[error("petition {0} is not in a terminal state")]
  NotTerminal(Uuid),

  #[error(
    "invalidation rule must set at least one of ip_address, email, name, postcode"
  )]
  EmptyMatchRule,

  #[error("unknown record kind discriminant: {0:?}")]
  UnknownRecordKind(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
