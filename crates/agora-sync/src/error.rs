use agora_blob::BlobError;
use agora_protocol::ProtocolError;
use agora_store::StoreError;
use agora_types::{ContentId, PeerId};
use thiserror::Error;

/// Why a remote body could not be obtained.
///
/// `NoPeers` and `Timeout` are deliberately distinct: the first means the
/// node is offline, the second that the network is slow or the content is
/// scarce.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no peers connected")]
    NoPeers,

    #[error("timed out after {after_ms} ms fetching {cid}")]
    Timeout { cid: ContentId, after_ms: u64 },

    #[error("no asked peer holds {0}")]
    NotFound(ContentId),

    #[error("peer {peer} returned a body that does not hash to {cid}")]
    Integrity { cid: ContentId, peer: PeerId },

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("fetch state lock poisoned")]
    LockPoisoned,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NotFound(_) | Self::Integrity { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request to {peer} timed out")]
    Timeout { peer: PeerId },

    #[error("peer {0} is not connected")]
    PeerUnavailable(PeerId),

    #[error("peer {0} sent no response")]
    NoResponse(PeerId),

    #[error("unexpected response: wanted {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("sync state lock poisoned")]
    LockPoisoned,
}

pub type SyncResult<T> = Result<T, SyncError>;
