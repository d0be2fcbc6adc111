//! The background pipeline: counter reconciliation, archival migration,
//! anonymization, and bulk invalidation.
//!
//! Every job here is a small async function generic over the store traits
//! from `tally-core`. The [`Runner`] wires them to the durable task queue:
//! it pops due tasks and dispatches them, and multi-step jobs advance by
//! enqueueing their successor task rather than looping in-process, so any
//! worker crash loses at most one in-flight step.

pub mod anonymizer;
pub mod archiver;
pub mod error;
pub mod invalidator;
pub mod notify;
pub mod reconciler;
pub mod runner;

#[cfg(test)] mod tests;

pub use error::{Error, Result};
pub use runner::Runner;
