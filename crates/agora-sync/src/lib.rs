//! Replica synchronization for Agora.
//!
//! Two delivery paths feed the same merge rule. Real-time publishes carry
//! single operations as they are authored; anti-entropy rounds pull digest
//! batches from every connected peer and repair whatever the real-time
//! path dropped. Post bodies travel separately and are pulled on demand by
//! the [`BlobFetcher`].
//!
//! The network itself is a collaborator: anything implementing
//! [`PeerTransport`] will do. [`LoopbackHub`] wires replicas together
//! in-process for tests and simulation.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod limiter;
pub mod loopback;
pub mod reconciler;
pub mod responder;
pub mod stats;
pub mod transport;

pub use config::{FetchConfig, SyncConfig};
pub use error::{FetchError, FetchResult, SyncError, SyncResult};
pub use fetcher::BlobFetcher;
pub use limiter::{RequestKind, RequestLimiter};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use reconciler::{AntiEntropy, SyncRound};
pub use responder::SyncResponder;
pub use stats::{FetchStats, LatencyRing, SyncStats};
pub use transport::{MessageHandler, PeerTransport};
