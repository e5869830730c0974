//! Foundation types for Agora, a local-first replicated forum store.
//!
//! Every other Agora crate depends on `agora-types`. Nothing in here touches
//! storage or the network; the crate only fixes the vocabulary that replicas
//! must agree on byte-for-byte.
//!
//! # Key Types
//!
//! - [`EntityId`], [`OpId`], [`AuthorKey`], [`PeerId`] — string identifiers
//! - [`ContentId`] — content-addressed body fingerprint (BLAKE3)
//! - [`Version`] — `(lamport, op_id)`, the total order behind last-writer-wins
//! - [`LamportClock`] — per-node logical clock
//! - [`EntityKind`], [`OpKind`], [`Zone`] — closed enums shared by the wire and the store

pub mod cid;
pub mod clock;
pub mod error;
pub mod ids;
pub mod kind;
pub mod version;

pub use cid::ContentId;
pub use clock::{unix_now, LamportClock};
pub use error::TypeError;
pub use ids::{AuthorKey, EntityId, OpId, PeerId};
pub use kind::{EntityKind, OpKind, Zone};
pub use version::Version;
