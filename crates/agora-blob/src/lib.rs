//! Content-addressed body storage for Agora.
//!
//! Post bodies are kept apart from the entity index: the index holds a
//! [`ContentId`](agora_types::ContentId) and this crate holds the bytes.
//! Either side may lose its half independently. A blob evicted under
//! quota pressure leaves the index row intact (the body is simply "not
//! yet fetched" again), and deleting an index row does not delete the blob.
//!
//! # Design Rules
//!
//! 1. Bodies are immutable; `put` verifies the bytes hash to the given id.
//! 2. Quota eviction removes bodies only. Orphaned bodies go first, then
//!    the zone's own bodies, least-recently-accessed first.
//! 3. A blob referenced from more than one zone is never evicted by either.
//! 4. Pinned blobs and the blob currently being written are never evicted,
//!    and pinned blobs are never removed.
//! 5. Every `get` is recorded as a cache hit or miss; `peek` is not.

pub mod error;
pub mod refs;
pub mod stats;
pub mod store;

pub use error::{BlobError, BlobResult};
pub use refs::{NoReferences, ZoneReferences};
pub use stats::{CacheCounters, CacheStats};
pub use store::{BlobStore, PutReport};
