use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use agora_blob::BlobStore;
use agora_protocol::{AgoraMessage, DigestRecord};
use agora_store::EntityStore;
use agora_types::{unix_now, ContentId, EntityId, OpId, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::fetcher::BlobFetcher;
use crate::stats::SyncStats;
use crate::transport::PeerTransport;

/// What one anti-entropy round did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRound {
    pub peers_contacted: usize,
    pub digests_received: usize,
    pub index_insertions: usize,
    /// Digests that were malformed or conflicted with local state.
    pub digests_rejected: usize,
    pub blob_fetch_attempts: usize,
    pub blob_fetch_successes: usize,
}

/// Periodic digest exchange that repairs whatever real-time delivery lost.
///
/// A round asks every connected peer for digests inside a trailing window,
/// applies them newest-first through the ordinary merge rule until the
/// index budget runs out, then pulls missing bodies up to the body budget.
/// Re-applying current or stale digests is harmless, so rounds may overlap
/// with each other and with local writes.
pub struct AntiEntropy {
    transport: Arc<dyn PeerTransport>,
    store: Arc<EntityStore>,
    blobs: Arc<BlobStore>,
    fetcher: Arc<BlobFetcher>,
    config: SyncConfig,
    stats: Mutex<SyncStats>,
    trigger: Notify,
}

impl AntiEntropy {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        store: Arc<EntityStore>,
        blobs: Arc<BlobStore>,
        fetcher: Arc<BlobFetcher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            transport,
            store,
            blobs,
            fetcher,
            config: config.clamped(),
            stats: Mutex::new(SyncStats::default()),
            trigger: Notify::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> SyncResult<SyncStats> {
        Ok(self.stats.lock().map_err(|_| SyncError::LockPoisoned)?.clone())
    }

    fn update_stats(&self, apply: impl FnOnce(&mut SyncStats)) -> SyncResult<()> {
        let mut stats = self.stats.lock().map_err(|_| SyncError::LockPoisoned)?;
        apply(&mut stats);
        Ok(())
    }

    /// Ask the background worker for a round now.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run one round against every connected peer.
    pub async fn sync_once(&self) -> SyncResult<SyncRound> {
        let mut round = SyncRound::default();
        self.update_stats(|s| s.rounds += 1)?;

        let peers = self.transport.connected_peers().await;
        if peers.is_empty() {
            debug!("anti-entropy skipped: no peers");
            return Ok(round);
        }
        round.peers_contacted = peers.len();

        let latest = self.store.latest_timestamp()?.unwrap_or(0);
        let since = latest.saturating_sub(self.config.window_secs);
        let digests = self.collect_digests(peers, since).await?;
        round.digests_received = digests.len();

        let remote_max = digests.iter().map(|d| d.timestamp).max();
        let missing = self.apply_digests(digests, &mut round);

        round.blob_fetch_attempts = missing.len();
        round.blob_fetch_successes = self.fetch_bodies(missing).await;

        let now = unix_now();
        self.update_stats(|s| {
            s.index_insertions += round.index_insertions as u64;
            s.blob_fetch_attempts += round.blob_fetch_attempts as u64;
            s.blob_fetch_successes += round.blob_fetch_successes as u64;
            s.blob_fetch_failures += (round.blob_fetch_attempts - round.blob_fetch_successes) as u64;
            if let Some(remote_max) = remote_max {
                s.last_remote_max_timestamp = Some(
                    s.last_remote_max_timestamp
                        .map_or(remote_max, |prev| prev.max(remote_max)),
                );
                s.last_observed_lag_secs = Some(now.saturating_sub(remote_max));
            }
        })?;

        info!(
            peers = round.peers_contacted,
            since,
            digests = round.digests_received,
            inserted = round.index_insertions,
            rejected = round.digests_rejected,
            fetches = round.blob_fetch_attempts,
            fetched = round.blob_fetch_successes,
            "anti-entropy round complete"
        );
        Ok(round)
    }

    async fn collect_digests(
        &self,
        peers: Vec<PeerId>,
        since: u64,
    ) -> SyncResult<Vec<DigestRecord>> {
        let requester = self.transport.local_peer();
        let timeout = self.config.request_timeout();
        let mut requests = JoinSet::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let request_id = Uuid::now_v7().to_string();
            let message = AgoraMessage::SyncRequest {
                request_id: request_id.clone(),
                requester: requester.clone(),
                since_timestamp: since,
                limit: self.config.batch_size,
            };
            requests.spawn(async move {
                let reply = transport.request(&peer, message, timeout).await;
                (peer, request_id, reply)
            });
        }
        let sent = requests.len() as u64;
        self.update_stats(|s| s.sync_requests_sent += sent)?;

        let mut digests = Vec::new();
        while let Some(joined) = requests.join_next().await {
            let (peer, request_id, reply) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "sync request task failed");
                    continue;
                }
            };
            match reply {
                Ok(AgoraMessage::SyncResponse {
                    request_id: answered,
                    digests: batch,
                    ..
                }) if answered == request_id => {
                    let received = batch.len() as u64;
                    debug!(peer = %peer, digests = received, "sync response");
                    self.update_stats(|s| {
                        s.sync_responses_received += 1;
                        s.digests_received += received;
                        s.last_sync_at = Some(unix_now());
                    })?;
                    digests.extend(batch);
                }
                Ok(other) => warn!(peer = %peer, kind = other.type_name(), "unexpected reply to sync request"),
                Err(e) => warn!(peer = %peer, error = %e, "sync request failed"),
            }
        }

        let mut seen: HashSet<(EntityId, OpId)> = HashSet::new();
        digests.retain(|d| seen.insert((d.id.clone(), d.op_id.clone())));
        digests.sort_by(DigestRecord::apply_order);
        Ok(digests)
    }

    /// Apply digests until `index_budget` of them have been accepted.
    /// Stale digests cost nothing. Returns the missing bodies of processed
    /// digests, at most `body_budget` of them.
    fn apply_digests(&self, digests: Vec<DigestRecord>, round: &mut SyncRound) -> Vec<ContentId> {
        let mut index_budget = self.config.index_budget;
        let mut body_budget = self.config.body_budget;
        let mut wanted = HashSet::new();
        let mut missing = Vec::new();

        for digest in digests {
            if index_budget == 0 {
                break;
            }
            let applied = digest
                .to_operation()
                .map_err(SyncError::from)
                .and_then(|op| self.store.apply(op).map_err(SyncError::from));
            match applied {
                Ok(outcome) if outcome.is_applied() => {
                    round.index_insertions += 1;
                    index_budget -= 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(entity = %digest.id, op = %digest.op_id, error = %e, "digest not applied");
                    round.digests_rejected += 1;
                    continue;
                }
            }

            if digest.is_delete() || body_budget == 0 {
                continue;
            }
            let Some(cid) = digest.content_fingerprint else {
                continue;
            };
            match self.blobs.contains(&cid) {
                Ok(false) if wanted.insert(cid) => {
                    missing.push(cid);
                    body_budget -= 1;
                }
                Ok(_) => {}
                Err(e) => warn!(cid = %cid, error = %e, "blob lookup failed"),
            }
        }
        missing
    }

    async fn fetch_bodies(&self, missing: Vec<ContentId>) -> usize {
        let timeout = self.config.blob_fetch_timeout();
        let mut fetches = JoinSet::new();
        for cid in missing {
            let fetcher = Arc::clone(&self.fetcher);
            fetches.spawn(async move { fetcher.fetch(cid, timeout).await.map(|_| cid) });
        }
        let mut fetched = 0;
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Ok(cid)) => {
                    debug!(cid = %cid, "anti-entropy body fetched");
                    fetched += 1;
                }
                Ok(Err(e)) => warn!(error = %e, "anti-entropy body fetch failed"),
                Err(e) => warn!(error = %e, "body fetch task failed"),
            }
        }
        fetched
    }

    /// Run rounds in the background until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval_secs,
                window_secs = self.config.window_secs,
                "anti-entropy worker started"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.initial_delay()) => {}
                _ = shutdown.changed() => {
                    info!("anti-entropy worker stopped");
                    return;
                }
            }

            let period = self.config.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.sync_once().await {
                    warn!(error = %e, "anti-entropy round failed");
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => debug!("anti-entropy round triggered"),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("anti-entropy worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::loopback::LoopbackHub;
    use crate::responder::SyncResponder;
    use crate::transport::MessageHandler;
    use agora_store::{Content, Operation, PostContent, QuotaConfig};
    use agora_types::{AuthorKey, EntityKind, OpKind, PeerId, Zone};
    use async_trait::async_trait;
    use std::time::Duration;

    const NOW: u64 = 1_800_000_000;

    struct Replica {
        store: Arc<EntityStore>,
        blobs: Arc<BlobStore>,
        responder: SyncResponder,
        sync: Arc<AntiEntropy>,
    }

    #[async_trait]
    impl MessageHandler for Replica {
        async fn handle(&self, from: &PeerId, message: AgoraMessage) -> Option<AgoraMessage> {
            self.responder.respond(from, &message).ok().flatten()
        }
    }

    fn replica(hub: &Arc<LoopbackHub>, name: &str, config: SyncConfig) -> Arc<Replica> {
        let peer = PeerId::new(name);
        let store = Arc::new(EntityStore::in_memory(QuotaConfig::default()));
        let blobs = Arc::new(BlobStore::new(store.clone()));
        let transport: Arc<dyn PeerTransport> = Arc::new(hub.transport(peer.clone()));
        let fetcher = Arc::new(BlobFetcher::new(
            transport.clone(),
            blobs.clone(),
            store.clone(),
            QuotaConfig::default(),
            FetchConfig::default(),
        ));
        let sync = Arc::new(AntiEntropy::new(
            transport,
            store.clone(),
            blobs.clone(),
            fetcher,
            config,
        ));
        let node = Arc::new(Replica {
            responder: SyncResponder::new(peer.clone(), store.clone(), blobs.clone(), 500),
            store,
            blobs,
            sync,
        });
        let handler: Arc<dyn MessageHandler> = node.clone();
        hub.register(peer, Arc::downgrade(&handler));
        node
    }

    fn author_post(node: &Replica, id: &str, lamport: u64, body: &[u8]) -> ContentId {
        let cid = ContentId::for_body(body);
        node.blobs.put(cid, body.to_vec()).unwrap();
        node.store
            .apply(Operation {
                entity_id: EntityId::new(id),
                entity_kind: EntityKind::Post,
                op_id: OpId::new(format!("{id}:bob:{lamport}:create")),
                op_kind: OpKind::Create,
                author: AuthorKey::new("bob"),
                lamport,
                timestamp: NOW + lamport,
                content: Some(Content::Post(PostContent {
                    title: id.into(),
                    content_cid: Some(cid),
                    zone: Zone::Public,
                    size_bytes: body.len() as u64,
                    protected: false,
                })),
            })
            .unwrap();
        cid
    }

    // ----------------------------------------------------------------
    // Rounds
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn round_recovers_missed_post_and_body() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        let b = replica(&hub, "b", SyncConfig::default());
        let cid = author_post(&b, "p1", 5, b"missed while offline");

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.index_insertions, 1);
        assert_eq!(round.blob_fetch_attempts, 1);
        assert_eq!(round.blob_fetch_successes, 1);
        assert!(a.store.get(&EntityId::new("p1")).unwrap().is_some());
        assert!(a.blobs.contains(&cid).unwrap());

        let stats = a.sync.stats().unwrap();
        assert_eq!(stats.sync_requests_sent, 1);
        assert_eq!(stats.sync_responses_received, 1);
        assert_eq!(stats.last_remote_max_timestamp, Some(NOW + 5));
        assert!(stats.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn repeated_round_is_idempotent() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        let b = replica(&hub, "b", SyncConfig::default());
        author_post(&b, "p1", 5, b"body");

        a.sync.sync_once().await.unwrap();
        let again = a.sync.sync_once().await.unwrap();
        assert_eq!(again.digests_received, 1);
        assert_eq!(again.index_insertions, 0);
        assert_eq!(again.blob_fetch_attempts, 0);
        assert_eq!(a.store.summaries().unwrap(), b.store.summaries().unwrap());
    }

    #[tokio::test]
    async fn index_budget_bounds_each_round() {
        let hub = LoopbackHub::new();
        let config = SyncConfig { index_budget: 2, ..Default::default() };
        let a = replica(&hub, "a", config);
        let b = replica(&hub, "b", SyncConfig::default());
        for i in 1..=5 {
            author_post(&b, &format!("p{i}"), i, format!("body {i}").as_bytes());
        }

        let first = a.sync.sync_once().await.unwrap();
        assert_eq!(first.index_insertions, 2);
        // Newest first.
        assert!(a.store.get(&EntityId::new("p5")).unwrap().is_some());
        assert!(a.store.get(&EntityId::new("p1")).unwrap().is_none());

        a.sync.sync_once().await.unwrap();
        a.sync.sync_once().await.unwrap();
        assert_eq!(a.store.len().unwrap(), 5);
    }

    #[tokio::test]
    async fn body_budget_bounds_fetches() {
        let hub = LoopbackHub::new();
        let config = SyncConfig { body_budget: 1, ..Default::default() };
        let a = replica(&hub, "a", config);
        let b = replica(&hub, "b", SyncConfig::default());
        author_post(&b, "p1", 1, b"one");
        author_post(&b, "p2", 2, b"two");
        author_post(&b, "p3", 3, b"three");

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.index_insertions, 3);
        assert_eq!(round.blob_fetch_attempts, 1);
        assert!(a.blobs.contains(&ContentId::for_body(b"three")).unwrap());
    }

    #[tokio::test]
    async fn shared_body_is_fetched_once() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        let b = replica(&hub, "b", SyncConfig::default());
        author_post(&b, "p1", 1, b"same");
        author_post(&b, "p2", 2, b"same");

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.index_insertions, 2);
        assert_eq!(round.blob_fetch_attempts, 1);
    }

    #[tokio::test]
    async fn digests_from_several_peers_are_deduplicated() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        let b = replica(&hub, "b", SyncConfig::default());
        let c = replica(&hub, "c", SyncConfig::default());
        author_post(&b, "p1", 1, b"x");
        c.sync.sync_once().await.unwrap();

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.peers_contacted, 2);
        assert_eq!(round.digests_received, 1);
        assert_eq!(round.index_insertions, 1);
    }

    /// A peer that answers every sync request with a fixed digest batch.
    struct Scripted(Vec<DigestRecord>);

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, _from: &PeerId, message: AgoraMessage) -> Option<AgoraMessage> {
            let AgoraMessage::SyncRequest { request_id, .. } = message else {
                return None;
            };
            Some(AgoraMessage::SyncResponse {
                request_id,
                responder: PeerId::new("scripted"),
                digests: self.0.clone(),
            })
        }
    }

    fn digest(id: &str, entity: EntityKind, lamport: u64, post_id: Option<&str>) -> DigestRecord {
        DigestRecord {
            id: EntityId::new(id),
            entity,
            op_id: OpId::new(format!("{id}:remote:{lamport}:create")),
            op_type: OpKind::Create,
            pubkey: AuthorKey::new("remote"),
            title: Some(id.into()),
            content_fingerprint: None,
            size_bytes: 4,
            lamport,
            timestamp: NOW + lamport,
            deleted: false,
            post_id: post_id.map(EntityId::new),
            parent_id: None,
            body: Some("text".into()),
        }
    }

    #[tokio::test]
    async fn bad_digests_do_not_abort_the_batch() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        author_post(&a, "taken", 1, b"local post");

        let peer: Arc<dyn MessageHandler> = Arc::new(Scripted(vec![
            digest("good-old", EntityKind::Post, 2, None),
            // Comment that names no post.
            digest("orphan-comment", EntityKind::Comment, 9, None),
            // Comment digest for an id that is a post here.
            digest("taken", EntityKind::Comment, 8, Some("good-old")),
            digest("good-new", EntityKind::Post, 5, None),
            digest("good-comment", EntityKind::Comment, 3, Some("good-old")),
        ]));
        hub.register(PeerId::new("scripted"), Arc::downgrade(&peer));

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.digests_received, 5);
        assert_eq!(round.digests_rejected, 2);
        assert_eq!(round.index_insertions, 3);
        for id in ["good-old", "good-new", "good-comment"] {
            assert!(a.store.get(&EntityId::new(id)).unwrap().is_some(), "{id} missing");
        }
        assert!(a.store.get(&EntityId::new("orphan-comment")).unwrap().is_none());
        assert_eq!(a.store.get(&EntityId::new("taken")).unwrap().unwrap().kind, EntityKind::Post);
        assert_eq!(a.sync.stats().unwrap().index_insertions, 3);
    }

    #[tokio::test]
    async fn deletes_replicate_without_body_fetch() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        let b = replica(&hub, "b", SyncConfig::default());
        author_post(&b, "p1", 10, b"soon gone");
        b.store
            .delete(
                EntityId::new("p1"),
                EntityKind::Post,
                AuthorKey::new("bob"),
                NOW + 20,
                20,
                OpId::new("p1:bob:20:delete"),
            )
            .unwrap();

        let round = a.sync.sync_once().await.unwrap();
        assert_eq!(round.blob_fetch_attempts, 0);
        let entity = a.store.get(&EntityId::new("p1")).unwrap().unwrap();
        assert!(entity.deleted);
        assert_eq!(entity.lamport, 20);
    }

    #[tokio::test]
    async fn no_peers_means_empty_round() {
        let hub = LoopbackHub::new();
        let a = replica(&hub, "a", SyncConfig::default());
        assert_eq!(a.sync.sync_once().await.unwrap(), SyncRound::default());
        assert_eq!(a.sync.stats().unwrap().rounds, 1);
    }

    #[tokio::test]
    async fn window_excludes_old_remote_rows() {
        let hub = LoopbackHub::new();
        let config = SyncConfig { window_secs: 100, ..Default::default() };
        let a = replica(&hub, "a", config);
        let b = replica(&hub, "b", SyncConfig::default());
        // a already knows something recent, so its window starts near NOW.
        author_post(&a, "mine", 50, b"mine");
        author_post(&b, "older", 1, b"old");
        b.store
            .apply(Operation {
                entity_id: EntityId::new("way-back"),
                entity_kind: EntityKind::Post,
                op_id: OpId::new("way-back:bob:2:create"),
                op_kind: OpKind::Create,
                author: AuthorKey::new("bob"),
                lamport: 2,
                timestamp: NOW - 10_000,
                content: Some(Content::Post(PostContent {
                    title: "way back".into(),
                    content_cid: None,
                    zone: Zone::Public,
                    size_bytes: 1,
                    protected: false,
                })),
            })
            .unwrap();

        a.sync.sync_once().await.unwrap();
        assert!(a.store.get(&EntityId::new("older")).unwrap().is_some());
        assert!(a.store.get(&EntityId::new("way-back")).unwrap().is_none());
    }

    // ----------------------------------------------------------------
    // Worker
    // ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn worker_runs_on_interval_and_trigger_then_stops() {
        let hub = LoopbackHub::new();
        let config = SyncConfig {
            interval_secs: 3600,
            initial_delay_ms: 10,
            ..Default::default()
        };
        let a = replica(&hub, "a", config);
        let b = replica(&hub, "b", SyncConfig::default());
        let (tx, rx) = watch::channel(false);
        let worker = a.sync.clone().spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.sync.stats().unwrap().rounds, 1);

        author_post(&b, "late", 1, b"late");
        a.sync.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.sync.stats().unwrap().rounds, 2);
        assert!(a.store.get(&EntityId::new("late")).unwrap().is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
