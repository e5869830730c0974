//! Local HTTP API for an Agora node.
//!
//! Read-mostly status surface: health, stats, post and body lookups, and a
//! manual anti-entropy trigger. Body reads that have to go to the network
//! answer `503` when the node is offline and `504` when peers are slow.

pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use error::{ErrorBody, ServerError, ServerResult};
pub use router::build_router;
pub use server::AgoraServer;
