use agora_types::{ContentId, Zone};
use thiserror::Error;

/// Errors produced by blob store operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("body does not match content id {expected}: hashes to {actual}")]
    HashMismatch { expected: ContentId, actual: ContentId },

    #[error("blob of {incoming} bytes exceeds the {zone} zone cap of {cap} bytes")]
    QuotaExceeded { zone: Zone, incoming: u64, cap: u64 },

    #[error("no evictable blobs left in the {zone} zone: {used} used + {incoming} incoming > {cap}")]
    NoEvictableCandidates {
        zone: Zone,
        used: u64,
        incoming: u64,
        cap: u64,
    },

    #[error("blob table lock poisoned")]
    LockPoisoned,
}

pub type BlobResult<T> = Result<T, BlobError>;
