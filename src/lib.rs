//! Narrow-to-wide time-series synchronization engine.
//!
//! The source holds one row per (entity, attribute, timestamp); the
//! destination holds one wide table per entity and destination group, one
//! column per attribute, keyed by timestamp. The engine backfills history in
//! bounded windows while a live loop follows the edge, with a persisted
//! per-entity ledger keeping the two ranges disjoint.

pub mod backfill;
pub mod config;
pub mod error;
pub mod ledger;
pub mod live;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod reprocess;
pub mod reshape;
pub mod router;
pub mod scheduler;
pub mod store;

pub use error::{Result, SyncError};
