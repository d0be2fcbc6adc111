//! Error types for `tally-pipeline`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("domain error: {0}")]
  Core(#[from] tally_core::Error),

  /// An error surfaced by a storage backend. Boxed because the pipeline is
  /// generic over the store implementations.
  #[error("store error: {0}")]
  Store(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
