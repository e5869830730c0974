use std::sync::Arc;

use agora_blob::{BlobStore, CacheStats};
use agora_gc::{GcReport, TombstoneCollector};
use agora_protocol::{AgoraMessage, DigestRecord};
use agora_store::{
    ApplyOutcome, CommentContent, Content, Entity, EntityStore, Operation, PostContent,
};
use agora_sync::{
    AntiEntropy, BlobFetcher, FetchStats, LoopbackHub, MessageHandler, PeerTransport,
    RequestLimiter, SyncResponder, SyncRound, SyncStats,
};
use agora_types::{unix_now, AuthorKey, ContentId, EntityId, EntityKind, OpId, OpKind, PeerId, Zone};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};

/// Quota and usage of one zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneUsage {
    pub zone: Zone,
    pub cap_bytes: u64,
    pub index_bytes: u64,
    pub blob_bytes: u64,
}

/// Point-in-time view of a node, served by the status API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: PeerId,
    pub entities: usize,
    pub operations: usize,
    pub lamport: u64,
    pub durable: bool,
    pub zones: Vec<ZoneUsage>,
    pub cache: CacheStats,
    pub sync: SyncStats,
    pub fetch: FetchStats,
}

/// One replica: its stores, its view of the network and the workers that
/// keep it converging.
///
/// Local writes, real-time deliveries and anti-entropy all end in the same
/// [`EntityStore::apply`], so the order in which a node hears about an
/// operation never matters.
pub struct Node {
    id: PeerId,
    author: AuthorKey,
    config: NodeConfig,
    store: Arc<EntityStore>,
    blobs: Arc<BlobStore>,
    gc: TombstoneCollector,
    transport: Arc<dyn PeerTransport>,
    fetcher: Arc<BlobFetcher>,
    sync: Arc<AntiEntropy>,
    responder: SyncResponder,
}

impl Node {
    /// Build a node on `transport`. With a `data_dir` the entity index is
    /// durable; bodies always live in memory and are re-fetched on demand.
    pub fn new(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> NodeResult<Arc<Self>> {
        let config = config.validate()?;
        let store = Arc::new(match &config.data_dir {
            Some(dir) => EntityStore::open(dir, config.quota.clone(), config.wal.clone())?,
            None => EntityStore::in_memory(config.quota.clone()),
        });
        let blobs = Arc::new(BlobStore::new(store.clone()));
        let fetcher = Arc::new(BlobFetcher::new(
            Arc::clone(&transport),
            blobs.clone(),
            store.clone(),
            config.quota.clone(),
            config.fetch.clone(),
        ));
        let sync = Arc::new(AntiEntropy::new(
            Arc::clone(&transport),
            store.clone(),
            blobs.clone(),
            fetcher.clone(),
            config.sync.clone(),
        ));
        let id = transport.local_peer();
        let responder =
            SyncResponder::new(id.clone(), store.clone(), blobs.clone(), config.sync.batch_size)
                .with_limiter(RequestLimiter::from_config(&config.sync));

        info!(
            node = %id,
            durable = store.is_durable(),
            entities = store.len()?,
            "node ready"
        );
        Ok(Arc::new(Self {
            id,
            author: AuthorKey::new(config.node_id.clone()),
            gc: TombstoneCollector::new(store.clone(), blobs.clone()),
            config,
            store,
            blobs,
            transport,
            fetcher,
            sync,
            responder,
        }))
    }

    /// Build a node and attach it to an in-process network as `node_id`.
    pub fn join(config: NodeConfig, hub: &Arc<LoopbackHub>) -> NodeResult<Arc<Self>> {
        let config = config.validate()?;
        let transport = Arc::new(hub.transport(PeerId::new(config.node_id.clone())));
        let node = Self::new(config, transport)?;
        let handler: Arc<dyn MessageHandler> = node.clone();
        hub.register(node.id.clone(), Arc::downgrade(&handler));
        Ok(node)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.transport.connected_peers().await
    }

    // ------------------------------------------------------------------
    // Authoring
    // ------------------------------------------------------------------

    /// Author a post. The body is stored first so the index never points at
    /// a body this node failed to keep. Public posts are announced to peers.
    pub async fn create_post(&self, title: &str, body: &[u8], zone: Zone) -> NodeResult<Entity> {
        let title = non_empty(title, "post title")?;
        let id = EntityId::new(Uuid::now_v7().to_string());
        let body = Bytes::copy_from_slice(body);
        let cid = self.store_body(&body, zone)?;
        let op = self.local_op(
            &id,
            EntityKind::Post,
            OpKind::Create,
            Some(Content::Post(PostContent {
                size_bytes: index_row_bytes(title),
                title: title.to_string(),
                content_cid: Some(cid),
                zone,
                protected: false,
            })),
        );
        let entity = self.commit(op, Some(cid))?;
        info!(entity = %entity.id, zone = %zone, cid = %cid.short_hex(), "post created");
        self.announce(&entity, Some(body)).await;
        Ok(entity)
    }

    /// Change a live post's title and/or body.
    pub async fn update_post(
        &self,
        id: &EntityId,
        title: Option<&str>,
        body: Option<&[u8]>,
    ) -> NodeResult<Entity> {
        let current = self.live(id, EntityKind::Post)?;
        let Some(mut post) = current.post().cloned() else {
            return Err(NodeError::NotFound(id.to_string()));
        };
        if let Some(title) = title {
            let title = non_empty(title, "post title")?;
            post.title = title.to_string();
            post.size_bytes = index_row_bytes(title);
        }
        let mut fresh = None;
        if let Some(body) = body {
            let body = Bytes::copy_from_slice(body);
            post.content_cid = Some(self.store_body(&body, post.zone)?);
            fresh = Some(body);
        }
        let cid = fresh.as_ref().and(post.content_cid);
        let op = self.local_op(id, EntityKind::Post, OpKind::Update, Some(Content::Post(post)));
        let entity = self.commit(op, cid)?;
        debug!(entity = %id, lamport = entity.lamport, "post updated");
        self.announce(&entity, fresh).await;
        Ok(entity)
    }

    pub async fn delete_post(&self, id: &EntityId) -> NodeResult<Entity> {
        self.delete_entity(id, EntityKind::Post).await
    }

    /// Comment on a live post, optionally replying to one of its comments.
    pub async fn create_comment(
        &self,
        post_id: &EntityId,
        parent_id: Option<&EntityId>,
        body: &str,
    ) -> NodeResult<Entity> {
        let body = non_empty(body, "comment body")?;
        self.live(post_id, EntityKind::Post)?;
        if let Some(parent) = parent_id {
            let parent_comment = self.live(parent, EntityKind::Comment)?;
            if parent_comment.comment().map(|c| &c.post_id) != Some(post_id) {
                return Err(NodeError::InvalidInput(format!(
                    "comment {parent} does not belong to post {post_id}"
                )));
            }
        }
        let id = EntityId::new(Uuid::now_v7().to_string());
        let op = self.local_op(
            &id,
            EntityKind::Comment,
            OpKind::Create,
            Some(Content::Comment(CommentContent {
                post_id: post_id.clone(),
                parent_id: parent_id.cloned(),
                body: body.to_string(),
            })),
        );
        let entity = self.commit(op, None)?;
        debug!(entity = %entity.id, post = %post_id, "comment created");
        self.announce(&entity, None).await;
        Ok(entity)
    }

    pub async fn delete_comment(&self, id: &EntityId) -> NodeResult<Entity> {
        self.delete_entity(id, EntityKind::Comment).await
    }

    async fn delete_entity(&self, id: &EntityId, kind: EntityKind) -> NodeResult<Entity> {
        self.live(id, kind)?;
        let op = self.local_op(id, kind, OpKind::Delete, None);
        let entity = self.commit(op, None)?;
        info!(entity = %id, kind = ?kind, lamport = entity.lamport, "entity deleted");
        self.announce(&entity, None).await;
        Ok(entity)
    }

    fn local_op(
        &self,
        id: &EntityId,
        kind: EntityKind,
        intent: OpKind,
        content: Option<Content>,
    ) -> Operation {
        let lamport = self.store.next_lamport();
        Operation {
            entity_id: id.clone(),
            entity_kind: kind,
            op_id: OpId::compose(id, &self.author, lamport, intent),
            op_kind: intent,
            author: self.author.clone(),
            lamport,
            timestamp: unix_now(),
            content,
        }
    }

    /// Store a body for a local write. The body comes back pinned; `commit`
    /// releases the pin.
    fn store_body(&self, body: &Bytes, zone: Zone) -> NodeResult<ContentId> {
        let cid = ContentId::for_body(body);
        let report = self
            .blobs
            .put_pinned_with_quota(cid, body.clone(), zone, self.store.quota().cap(zone))?;
        if !report.evicted.is_empty() {
            debug!(zone = %zone, evicted = report.evicted.len(), "bodies evicted for new content");
        }
        Ok(cid)
    }

    /// Apply a locally authored operation. `body`, pinned by `store_body`,
    /// stays pinned until the index row referencing it is committed, and is
    /// dropped again if nothing references it afterwards.
    fn commit(&self, op: Operation, body: Option<ContentId>) -> NodeResult<Entity> {
        let id = op.entity_id.clone();
        let applied = self.store.apply(op);
        if let Some(cid) = &body {
            self.blobs.unpin(cid)?;
            if !matches!(applied, Ok(ApplyOutcome::Applied)) {
                self.blobs.remove_if_unreferenced(cid)?;
            }
        }
        match applied? {
            ApplyOutcome::Applied => self
                .store
                .get(&id)?
                .ok_or_else(|| NodeError::NotFound(id.to_string())),
            ApplyOutcome::RejectedStale => Err(NodeError::Superseded(id.to_string())),
        }
    }

    /// Best-effort real-time broadcast. Anti-entropy repairs whatever is lost.
    async fn announce(&self, entity: &Entity, body: Option<Bytes>) {
        if !entity.is_shareable() {
            return;
        }
        let message = AgoraMessage::Publish {
            digest: DigestRecord::from_entity(entity),
            body: body.map(|b| b.to_vec()),
        };
        if let Err(e) = self.transport.publish(message).await {
            warn!(entity = %entity.id, error = %e, "publish failed; left to anti-entropy");
        }
    }

    fn live(&self, id: &EntityId, kind: EntityKind) -> NodeResult<Entity> {
        match self.store.get(id)? {
            Some(entity) if entity.kind == kind && !entity.deleted => Ok(entity),
            _ => Err(NodeError::NotFound(format!("{kind:?} {id}"))),
        }
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Merge a digest heard from the network. A body riding along is kept
    /// if it matches the digest and the index still points at it.
    pub fn ingest(&self, digest: &DigestRecord, body: Option<&[u8]>) -> NodeResult<ApplyOutcome> {
        let outcome = self.store.apply(digest.to_operation()?)?;
        debug!(
            entity = %digest.id,
            op = %digest.op_id,
            applied = outcome.is_applied(),
            "digest ingested"
        );

        let (Some(body), Some(cid)) = (body, digest.content_fingerprint) else {
            return Ok(outcome);
        };
        if digest.is_delete() || self.blobs.contains(&cid)? || self.store.references(&cid)? == 0 {
            return Ok(outcome);
        }
        if !cid.matches(body) {
            warn!(entity = %digest.id, cid = %cid, "published body does not match its fingerprint");
            return Ok(outcome);
        }
        let zone = Zone::Public;
        if let Err(e) = self.blobs.put_with_quota(
            cid,
            Bytes::copy_from_slice(body),
            zone,
            self.store.quota().cap(zone),
        ) {
            warn!(cid = %cid, error = %e, "published body not stored");
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_entity(&self, id: &EntityId) -> NodeResult<Option<Entity>> {
        Ok(self.store.get(id)?)
    }

    /// Read a body, falling back to peers on a local miss.
    ///
    /// A failed remote read surfaces as [`NodeError::Fetch`] with the
    /// fetcher's `NoPeers` or `Timeout` kind intact.
    pub async fn get_body_by_cid(&self, cid: ContentId) -> NodeResult<Bytes> {
        if let Some(body) = self.blobs.get(&cid)? {
            return Ok(body);
        }
        debug!(cid = %cid, "body not held locally; fetching");
        Ok(self
            .fetcher
            .fetch_with_retry(cid, self.config.fetch.timeout())
            .await?)
    }

    /// Body of a live post.
    pub async fn get_body_by_id(&self, id: &EntityId) -> NodeResult<Bytes> {
        let post = self.live(id, EntityKind::Post)?;
        let cid = post
            .content_cid()
            .ok_or_else(|| NodeError::NotFound(format!("body of post {id}")))?;
        self.get_body_by_cid(cid).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Run one anti-entropy round now.
    pub async fn sync_now(&self) -> NodeResult<SyncRound> {
        Ok(self.sync.sync_once().await?)
    }

    /// Wake the background anti-entropy worker.
    pub fn trigger_sync(&self) {
        self.sync.trigger();
    }

    /// Run one tombstone collection pass with the configured policy.
    pub fn run_gc(&self) -> NodeResult<GcReport> {
        Ok(self.gc.run_with(&self.config.tombstone)?)
    }

    pub fn compact(&self) -> NodeResult<()> {
        Ok(self.store.compact()?)
    }

    pub fn stats(&self) -> NodeResult<NodeStats> {
        let mut zones = Vec::with_capacity(Zone::ALL.len());
        for zone in Zone::ALL {
            zones.push(ZoneUsage {
                zone,
                cap_bytes: self.store.quota().cap(zone),
                index_bytes: self.store.zone_usage(zone)?,
                blob_bytes: self.blobs.zone_usage(zone)?,
            });
        }
        Ok(NodeStats {
            node_id: self.id.clone(),
            entities: self.store.len()?,
            operations: self.store.operation_count()?,
            lamport: self.store.clock().current(),
            durable: self.store.is_durable(),
            zones,
            cache: self.blobs.stats()?,
            sync: self.sync.stats()?,
            fetch: self.fetcher.stats(),
        })
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Start the anti-entropy and tombstone workers.
    pub fn start(self: &Arc<Self>) -> NodeWorkers {
        let (shutdown, watcher) = watch::channel(false);
        let handles = vec![
            Arc::clone(&self.sync).spawn(watcher.clone()),
            self.spawn_gc_worker(watcher),
        ];
        info!(node = %self.id, "workers started");
        NodeWorkers { shutdown, handles }
    }

    fn spawn_gc_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let period = node.config.tombstone.interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "gc worker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let pass = Arc::clone(&node);
                match tokio::task::spawn_blocking(move || pass.run_gc()).await {
                    Ok(Ok(report)) => debug!(deleted = report.deleted(), pending = report.pending, "gc pass done"),
                    Ok(Err(e)) => warn!(error = %e, "gc pass failed"),
                    Err(e) => warn!(error = %e, "gc task failed"),
                }
            }
            info!("gc worker stopped");
        })
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle(&self, from: &PeerId, message: AgoraMessage) -> Option<AgoraMessage> {
        match message {
            AgoraMessage::Publish { digest, body } => {
                match self.responder.admit_publish(from) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(from = %from, entity = %digest.id, "publish dropped; left to anti-entropy");
                        return None;
                    }
                    Err(e) => {
                        warn!(from = %from, error = %e, "publish admission failed");
                        return None;
                    }
                }
                if let Err(e) = self.ingest(&digest, body.as_deref()) {
                    warn!(from = %from, entity = %digest.id, error = %e, "published digest rejected");
                }
                None
            }
            other => match self.responder.respond(from, &other) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(from = %from, kind = other.type_name(), error = %e, "request failed");
                    other.request_id().map(|_| AgoraMessage::Error {
                        code: 500,
                        message: e.to_string(),
                    })
                }
            },
        }
    }
}

/// Handles on a running node's background tasks.
pub struct NodeWorkers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeWorkers {
    /// Signal every worker to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
    }
}

/// Index-row bytes charged to the zone quota. Bodies are charged
/// separately by the blob store.
fn index_row_bytes(title: &str) -> u64 {
    title.len() as u64
}

fn non_empty<'a>(value: &'a str, what: &str) -> NodeResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NodeError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}
