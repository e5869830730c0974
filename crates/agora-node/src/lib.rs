//! A complete Agora replica.
//!
//! [`Node`] ties the entity store, blob store, tombstone collector and the
//! sync machinery together behind one handle: local authoring, ingestion of
//! network messages, body reads that fall back to peers, and the background
//! workers that keep replicas converging.
//!
//! # Configuration
//!
//! [`NodeConfig`] is read from TOML (every key optional) and may be
//! overridden from `AGORA_*` environment variables:
//!
//! ```toml
//! node_id = "alpha"
//! data_dir = "/var/lib/agora"
//!
//! [quota]
//! public_bytes = 83886080
//!
//! [sync]
//! interval_secs = 12
//! index_budget = 240
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod simulation;

pub use config::{ApiConfig, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use node::{Node, NodeStats, NodeWorkers, ZoneUsage};
pub use simulation::{simulate, SimulationConfig, SimulationReport};
