use std::sync::Arc;

use agora_blob::BlobStore;
use agora_protocol::{AgoraMessage, DigestRecord};
use agora_store::EntityStore;
use agora_types::PeerId;
use tracing::debug;

use crate::config::MAX_BATCH_SIZE;
use crate::error::SyncResult;
use crate::limiter::{RequestKind, RequestLimiter};

/// Error code of a request refused by the rate limiter.
pub const RATE_LIMITED: u32 = 429;

/// Answers digest and body requests from peers out of local state.
///
/// Requests are counted per sending peer; once a peer is over its
/// allowance the reply is an [`AgoraMessage::Error`] with
/// [`RATE_LIMITED`].
pub struct SyncResponder {
    local: PeerId,
    store: Arc<EntityStore>,
    blobs: Arc<BlobStore>,
    max_batch: u32,
    limiter: RequestLimiter,
}

impl SyncResponder {
    pub fn new(local: PeerId, store: Arc<EntityStore>, blobs: Arc<BlobStore>, max_batch: u32) -> Self {
        Self {
            local,
            store,
            blobs,
            max_batch: max_batch.clamp(1, MAX_BATCH_SIZE),
            limiter: RequestLimiter::default(),
        }
    }

    pub fn with_limiter(mut self, limiter: RequestLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Count a real-time publish from `from`. `false` means drop it.
    pub fn admit_publish(&self, from: &PeerId) -> SyncResult<bool> {
        self.limiter.allow(from, RequestKind::Publish)
    }

    /// Reply to `message` from `from`, or `None` if it is not a request this
    /// node serves.
    pub fn respond(&self, from: &PeerId, message: &AgoraMessage) -> SyncResult<Option<AgoraMessage>> {
        let kind = match message {
            AgoraMessage::SyncRequest { requester, .. } if *requester == self.local => return Ok(None),
            AgoraMessage::SyncRequest { .. } => RequestKind::Sync,
            AgoraMessage::ContentRequest { .. } => RequestKind::Content,
            _ => return Ok(None),
        };
        if !self.limiter.allow(from, kind)? {
            return Ok(Some(AgoraMessage::Error {
                code: RATE_LIMITED,
                message: format!("too many {kind} requests"),
            }));
        }

        match message {
            AgoraMessage::SyncRequest {
                request_id,
                requester,
                since_timestamp,
                limit,
            } => {
                let limit = (*limit).clamp(1, self.max_batch) as usize;
                let digests: Vec<DigestRecord> = self
                    .store
                    .entities_since(*since_timestamp, limit)?
                    .iter()
                    .map(DigestRecord::from_entity)
                    .collect();
                debug!(
                    request = %request_id,
                    requester = %requester,
                    since = since_timestamp,
                    digests = digests.len(),
                    "answering sync request"
                );
                Ok(Some(AgoraMessage::SyncResponse {
                    request_id: request_id.clone(),
                    responder: self.local.clone(),
                    digests,
                }))
            }
            AgoraMessage::ContentRequest {
                request_id, cid, ..
            } => {
                let body = self.blobs.peek(cid)?.map(|b| b.to_vec());
                debug!(request = %request_id, cid = %cid, found = body.is_some(), "answering content request");
                Ok(Some(AgoraMessage::ContentResponse {
                    request_id: request_id.clone(),
                    cid: *cid,
                    body,
                }))
            }
            _ => Ok(None),
        }
    }
}
