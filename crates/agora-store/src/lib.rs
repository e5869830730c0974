//! Entity store for Agora.
//!
//! Holds the replicated posts and comments of one node and decides, for
//! every incoming operation, whether it becomes the entity's new state.
//! Local authoring, real-time network delivery and anti-entropy all funnel
//! into the same [`EntityStore::apply`].
//!
//! # Merge Rule
//!
//! Each entity carries the [`Version`](agora_types::Version) of the operation
//! that produced it. An operation is applied iff its version is strictly
//! greater; anything else is [`ApplyOutcome::RejectedStale`]. Deletes follow
//! the same rule, which is what prevents stale creates from resurrecting a
//! tombstoned entity.
//!
//! # Design Rules
//!
//! 1. Every accepted mutation appends exactly one [`OperationRecord`].
//! 2. Replays and stale operations never touch the store.
//! 3. Writes to one entity id serialize; different ids proceed in parallel.
//! 4. Post writes run zone quota enforcement inside the same commit.
//! 5. Tombstones are never evicted by quota; only GC erases them.
//! 6. With a data directory, every commit is logged before it is visible.

pub mod entity;
pub mod error;
pub mod merge;
pub mod oplog;
pub mod quota;
pub mod store;
pub mod wal;

pub use entity::{
    ApplyOutcome, CommentContent, Content, Entity, EntitySummary, Operation, PostContent,
    Visibility,
};
pub use error::{StoreError, StoreResult};
pub use oplog::{OpLog, OperationRecord};
pub use quota::QuotaConfig;
pub use store::EntityStore;
pub use wal::{SyncMode, WalCommit, WalConfig, WriteAheadLog};
