//! Tombstone garbage collection for Agora.
//!
//! A deleted entity keeps a tombstone so that stale creates arriving later
//! are rejected. Erasing the tombstone too early would let such a create
//! resurrect the entity, so the collector only erases tombstones that are
//! old enough *and* have been observed unchanged over several consecutive
//! passes.

pub mod collector;
pub mod config;
pub mod error;

pub use collector::{GcReport, TombstoneCollector};
pub use config::TombstoneConfig;
pub use error::{GcError, GcResult};
