//! Durable checkpoint persistence.
//!
//! Runs, review assignments, and the notification ledger all commit through
//! this module. Every state mutation in the engine and the review scheduler
//! is considered tentative until the corresponding save succeeds.

mod db;

pub use db::{CheckpointStore, StoreHandle};
