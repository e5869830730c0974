use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use agora_protocol::{AgoraCodec, AgoraMessage};
use agora_types::PeerId;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::error::{SyncError, SyncResult};
use crate::transport::{MessageHandler, PeerTransport};

struct PeerSlot {
    handler: Weak<dyn MessageHandler>,
    online: bool,
    /// Muted peers stay connected but never answer requests.
    muted: bool,
}

struct LossModel {
    rate: f64,
    rng: StdRng,
}

/// In-process network joining replicas in one address space.
///
/// Every message is pushed through [`AgoraCodec`] in both directions, so
/// anything that crosses the hub would also survive a real wire. Publishes
/// can be dropped at a configurable rate; requests are never dropped but
/// can be silenced per peer to exercise timeouts.
pub struct LoopbackHub {
    peers: RwLock<HashMap<PeerId, PeerSlot>>,
    loss: Mutex<LossModel>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Self::with_loss(0.0, 0)
    }

    /// A hub that drops each published delivery with probability `rate`.
    pub fn with_loss(rate: f64, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            loss: Mutex::new(LossModel {
                rate: rate.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
            }),
        })
    }

    /// Attach `handler` as `peer`. The hub holds it weakly, so dropping the
    /// node detaches it.
    pub fn register(&self, peer: PeerId, handler: Weak<dyn MessageHandler>) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.insert(
            peer,
            PeerSlot {
                handler,
                online: true,
                muted: false,
            },
        );
    }

    /// Transport bound to `peer`'s point of view.
    pub fn transport(self: &Arc<Self>, peer: PeerId) -> LoopbackTransport {
        LoopbackTransport {
            hub: Arc::clone(self),
            local: peer,
        }
    }

    /// Take `peer` off the network, or bring it back.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = peers.get_mut(peer) {
            slot.online = online;
        }
    }

    pub fn set_muted(&self, peer: &PeerId, muted: bool) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = peers.get_mut(peer) {
            slot.muted = muted;
        }
    }

    pub fn set_loss(&self, rate: f64) {
        let mut loss = self.loss.lock().unwrap_or_else(PoisonError::into_inner);
        loss.rate = rate.clamp(0.0, 1.0);
    }

    /// All registered peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<PeerId> = peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn is_online(&self, peer: &PeerId) -> bool {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.get(peer).is_some_and(|slot| slot.online)
    }

    fn online_peers_except(&self, local: &PeerId) -> Vec<(PeerId, Arc<dyn MessageHandler>)> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut live: Vec<(PeerId, Arc<dyn MessageHandler>)> = peers
            .iter()
            .filter(|(id, slot)| *id != local && slot.online)
            .filter_map(|(id, slot)| slot.handler.upgrade().map(|h| (id.clone(), h)))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    fn route(&self, peer: &PeerId) -> SyncResult<(Arc<dyn MessageHandler>, bool)> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let slot = peers
            .get(peer)
            .filter(|slot| slot.online)
            .ok_or_else(|| SyncError::PeerUnavailable(peer.clone()))?;
        let handler = slot
            .handler
            .upgrade()
            .ok_or_else(|| SyncError::PeerUnavailable(peer.clone()))?;
        Ok((handler, slot.muted))
    }

    fn dropped(&self) -> bool {
        let mut loss = self.loss.lock().unwrap_or_else(PoisonError::into_inner);
        let rate = loss.rate;
        rate > 0.0 && loss.rng.gen_bool(rate)
    }
}

/// Re-encode a message as it would travel over a real connection.
fn over_the_wire(message: &AgoraMessage) -> SyncResult<AgoraMessage> {
    let frame = AgoraCodec::encode(message)?;
    let (decoded, _) = AgoraCodec::decode(&frame)?;
    Ok(decoded)
}

/// One replica's handle on a [`LoopbackHub`].
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local: PeerId,
}

impl LoopbackTransport {
    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        if !self.hub.is_online(&self.local) {
            return Vec::new();
        }
        self.hub
            .online_peers_except(&self.local)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    async fn request(
        &self,
        peer: &PeerId,
        message: AgoraMessage,
        timeout: Duration,
    ) -> SyncResult<AgoraMessage> {
        if !self.hub.is_online(&self.local) {
            return Err(SyncError::PeerUnavailable(peer.clone()));
        }
        let (handler, muted) = self.hub.route(peer)?;
        let message = over_the_wire(&message)?;
        let from = self.local.clone();
        let exchange = async {
            if muted {
                std::future::pending::<()>().await;
            }
            match handler.handle(&from, message).await {
                Some(reply) => over_the_wire(&reply),
                None => Err(SyncError::NoResponse(peer.clone())),
            }
        };
        trace!(from = %self.local, to = %peer, "loopback request");
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout { peer: peer.clone() })?
    }

    async fn publish(&self, message: AgoraMessage) -> SyncResult<()> {
        if !self.hub.is_online(&self.local) {
            return Ok(());
        }
        for (peer, handler) in self.hub.online_peers_except(&self.local) {
            if self.hub.dropped() {
                debug!(from = %self.local, to = %peer, kind = message.type_name(), "publish dropped");
                continue;
            }
            let delivered = over_the_wire(&message)?;
            handler.handle(&self.local, delivered).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies to every request with an error message echoing its type.
    struct Echo {
        received: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _from: &PeerId, message: AgoraMessage) -> Option<AgoraMessage> {
            self.received.fetch_add(1, Ordering::SeqCst);
            message.request_id().map(|_| AgoraMessage::Error {
                code: 0,
                message: message.type_name().into(),
            })
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            received: AtomicUsize::new(0),
        })
    }

    fn attach(hub: &LoopbackHub, name: &str, handler: &Arc<Echo>) {
        let dyn_handler: Arc<dyn MessageHandler> = handler.clone();
        hub.register(PeerId::new(name), Arc::downgrade(&dyn_handler));
    }

    fn sync_request() -> AgoraMessage {
        AgoraMessage::SyncRequest {
            request_id: "r".into(),
            requester: PeerId::new("a"),
            since_timestamp: 0,
            limit: 1,
        }
    }

    #[tokio::test]
    async fn request_reaches_the_peer_and_returns_its_reply() {
        let hub = LoopbackHub::new();
        let (a, b) = (echo(), echo());
        attach(&hub, "a", &a);
        attach(&hub, "b", &b);

        let transport = hub.transport(PeerId::new("a"));
        assert_eq!(transport.connected_peers().await, vec![PeerId::new("b")]);
        let reply = transport
            .request(&PeerId::new("b"), sync_request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            reply,
            AgoraMessage::Error { code: 0, message: "SyncRequest".into() }
        );
        assert_eq!(b.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_peer_times_out() {
        let hub = LoopbackHub::new();
        let (a, b) = (echo(), echo());
        attach(&hub, "a", &a);
        attach(&hub, "b", &b);
        hub.set_muted(&PeerId::new("b"), true);

        let err = hub
            .transport(PeerId::new("a"))
            .request(&PeerId::new("b"), sync_request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn offline_peers_are_not_connected() {
        let hub = LoopbackHub::new();
        let (a, b) = (echo(), echo());
        attach(&hub, "a", &a);
        attach(&hub, "b", &b);
        hub.set_online(&PeerId::new("b"), false);

        let transport = hub.transport(PeerId::new("a"));
        assert!(transport.connected_peers().await.is_empty());
        let err = transport
            .request(&PeerId::new("b"), sync_request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PeerUnavailable(_)));

        hub.set_online(&PeerId::new("a"), false);
        hub.set_online(&PeerId::new("b"), true);
        assert!(transport.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn dropped_nodes_detach() {
        let hub = LoopbackHub::new();
        let a = echo();
        attach(&hub, "a", &a);
        {
            let b = echo();
            attach(&hub, "b", &b);
        }
        assert!(hub.transport(PeerId::new("a")).connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn publish_fans_out_except_to_self() {
        let hub = LoopbackHub::new();
        let (a, b, c) = (echo(), echo(), echo());
        attach(&hub, "a", &a);
        attach(&hub, "b", &b);
        attach(&hub, "c", &c);

        hub.transport(PeerId::new("a"))
            .publish(AgoraMessage::Error { code: 1, message: "x".into() })
            .await
            .unwrap();
        assert_eq!(a.received.load(Ordering::SeqCst), 0);
        assert_eq!(b.received.load(Ordering::SeqCst), 1);
        assert_eq!(c.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_loss_drops_every_publish() {
        let hub = LoopbackHub::with_loss(1.0, 7);
        let (a, b) = (echo(), echo());
        attach(&hub, "a", &a);
        attach(&hub, "b", &b);

        let transport = hub.transport(PeerId::new("a"));
        for _ in 0..5 {
            transport
                .publish(AgoraMessage::Error { code: 1, message: "x".into() })
                .await
                .unwrap();
        }
        assert_eq!(b.received.load(Ordering::SeqCst), 0);

        hub.set_loss(0.0);
        transport
            .publish(AgoraMessage::Error { code: 1, message: "x".into() })
            .await
            .unwrap();
        assert_eq!(b.received.load(Ordering::SeqCst), 1);
    }
}
