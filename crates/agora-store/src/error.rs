use agora_types::{EntityId, Zone};
use thiserror::Error;

/// Errors produced by entity store operations.
///
/// A stale operation is not an error; see
/// [`ApplyOutcome::RejectedStale`](crate::ApplyOutcome::RejectedStale).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity of {needed} bytes exceeds the {zone} zone cap of {cap} bytes")]
    QuotaExceeded { zone: Zone, needed: u64, cap: u64 },

    #[error("no evictable entities left in the {zone} zone: {used} used + {needed} needed > {cap}")]
    NoEvictableCandidates {
        zone: Zone,
        used: u64,
        needed: u64,
        cap: u64,
    },

    #[error("invalid operation on {entity}: {reason}")]
    InvalidOperation { entity: EntityId, reason: String },

    #[error("entity {0} kept changing during commit")]
    Contended(EntityId),

    #[error("write-ahead log error: {0}")]
    Wal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
