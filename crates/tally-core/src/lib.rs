//! Core types and trait definitions for the tally signature ledger pipeline.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! All other crates depend on it.

pub mod config;
pub mod error;
pub mod invalidation;
pub mod journal;
pub mod petition;
pub mod record;
pub mod signature;
pub mod store;
pub mod task;

pub use error::{Error, Result};
