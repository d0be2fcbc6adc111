//! SQLite backends for the tally signature ledger pipeline.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Two stores live here: [`SqliteStore`]
//! (the live ledger, aggregates, watermark, locks, and the durable task
//! queue) and [`SqliteArchive`] (the long-term archive the migrator copies
//! into).

mod archive;
mod encode;
mod queue;
mod schema;
mod store;

pub mod error;

pub use archive::SqliteArchive;
pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
