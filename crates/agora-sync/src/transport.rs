use std::time::Duration;

use agora_protocol::AgoraMessage;
use agora_types::PeerId;
use async_trait::async_trait;

use crate::error::SyncResult;

/// Connectivity and delivery provided by the surrounding network layer.
///
/// Publishing is best-effort and at-least-once, with no ordering guarantee.
/// Requests are point-to-point and bounded by their own timeout.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Identity of this node on the network.
    fn local_peer(&self) -> PeerId;

    /// Peers currently reachable.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Send `message` to `peer` and wait up to `timeout` for its reply.
    async fn request(
        &self,
        peer: &PeerId,
        message: AgoraMessage,
        timeout: Duration,
    ) -> SyncResult<AgoraMessage>;

    /// Broadcast `message` to every subscribed peer.
    async fn publish(&self, message: AgoraMessage) -> SyncResult<()>;
}

/// Receives messages delivered by a transport.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message from `from`. Requests return their reply;
    /// broadcasts return `None`.
    async fn handle(&self, from: &PeerId, message: AgoraMessage) -> Option<AgoraMessage>;
}
