use agora_types::{ContentId, PeerId};
use serde::{Deserialize, Serialize};

use crate::digest::DigestRecord;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// All message types exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgoraMessage {
    /// Ask a peer for digests of entities touched at or after `since_timestamp`.
    SyncRequest {
        request_id: String,
        requester: PeerId,
        since_timestamp: u64,
        limit: u32,
    },
    SyncResponse {
        request_id: String,
        responder: PeerId,
        digests: Vec<DigestRecord>,
    },
    ContentRequest {
        request_id: String,
        requester: PeerId,
        cid: ContentId,
    },
    /// `body` is `None` when the responder does not hold the content.
    ContentResponse {
        request_id: String,
        cid: ContentId,
        body: Option<Vec<u8>>,
    },
    /// Real-time broadcast of a freshly authored operation. The post body
    /// may ride along so subscribers need not fetch it.
    Publish {
        digest: DigestRecord,
        body: Option<Vec<u8>>,
    },
    Error { code: u32, message: String },
}

impl AgoraMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::SyncRequest { .. } => 1,
            Self::SyncResponse { .. } => 2,
            Self::ContentRequest { .. } => 3,
            Self::ContentResponse { .. } => 4,
            Self::Publish { .. } => 5,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SyncRequest { .. } => "SyncRequest",
            Self::SyncResponse { .. } => "SyncResponse",
            Self::ContentRequest { .. } => "ContentRequest",
            Self::ContentResponse { .. } => "ContentResponse",
            Self::Publish { .. } => "Publish",
            Self::Error { .. } => "Error",
        }
    }

    /// Correlation id of request and response messages.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SyncRequest { request_id, .. }
            | Self::SyncResponse { request_id, .. }
            | Self::ContentRequest { request_id, .. }
            | Self::ContentResponse { request_id, .. } => Some(request_id),
            Self::Publish { .. } | Self::Error { .. } => None,
        }
    }
}
