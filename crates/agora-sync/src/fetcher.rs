use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_blob::{BlobError, BlobStore, ZoneReferences};
use agora_protocol::AgoraMessage;
use agora_store::QuotaConfig;
use agora_types::{ContentId, PeerId, Zone};
use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::error::{FetchError, FetchResult, SyncResult};
use crate::stats::{FetchStats, LatencyRing};
use crate::transport::PeerTransport;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// A fetch's claim on the per-id gate. Dropping it, on completion or when
/// the fetch future is abandoned, removes the map entry once no other fetch
/// of that id holds the gate.
struct InflightEntry<'a> {
    inflight: &'a Mutex<HashMap<ContentId, Gate>>,
    cid: ContentId,
    gate: Gate,
}

impl<'a> InflightEntry<'a> {
    fn join(inflight: &'a Mutex<HashMap<ContentId, Gate>>, cid: ContentId) -> FetchResult<Self> {
        let gate = {
            let mut map = inflight.lock().map_err(|_| FetchError::LockPoisoned)?;
            Arc::clone(map.entry(cid).or_default())
        };
        Ok(Self { inflight, cid, gate })
    }
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inflight.lock() {
            // Map entry plus ours: nobody else is waiting.
            if map
                .get(&self.cid)
                .is_some_and(|g| Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) <= 2)
            {
                map.remove(&self.cid);
            }
        }
    }
}

#[derive(Debug, Default)]
struct FetchCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    no_peers: AtomicU64,
    timeouts: AtomicU64,
    coalesced: AtomicU64,
}

/// Pulls post bodies from peers on local cache miss.
///
/// Each fetch asks up to `fanout` shuffled peers at once and keeps the
/// first body that hashes to the requested id. Concurrent fetches of one
/// id share a single network round: later callers wait for the first and
/// then read what it stored.
pub struct BlobFetcher {
    transport: Arc<dyn PeerTransport>,
    blobs: Arc<BlobStore>,
    references: Arc<dyn ZoneReferences>,
    quota: QuotaConfig,
    config: FetchConfig,
    inflight: Mutex<HashMap<ContentId, Gate>>,
    counters: FetchCounters,
    latencies: Mutex<LatencyRing>,
}

impl BlobFetcher {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        blobs: Arc<BlobStore>,
        references: Arc<dyn ZoneReferences>,
        quota: QuotaConfig,
        config: FetchConfig,
    ) -> Self {
        Self {
            transport,
            blobs,
            references,
            quota,
            config: config.clamped(),
            inflight: Mutex::new(HashMap::new()),
            counters: FetchCounters::default(),
            latencies: Mutex::new(LatencyRing::default()),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `cid` from the network, store it locally and return it.
    ///
    /// Returns the local copy without touching the network when one exists.
    pub async fn fetch(&self, cid: ContentId, timeout: Duration) -> FetchResult<Bytes> {
        if let Some(body) = self.local(&cid)? {
            return Ok(body);
        }

        let entry = InflightEntry::join(&self.inflight, cid)?;
        let _turn = entry.gate.lock().await;
        match self.local(&cid)? {
            Some(body) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                Ok(body)
            }
            None => self.fetch_remote(cid, timeout).await,
        }
    }

    /// [`Self::fetch`] with the configured attempts and back-off.
    /// `NoPeers` is returned at once; retrying cannot help an offline node.
    pub async fn fetch_with_retry(&self, cid: ContentId, timeout: Duration) -> FetchResult<Bytes> {
        let attempts = self.config.retry_attempts;
        let mut attempt = 1;
        loop {
            match self.fetch(cid, timeout).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(cid = %cid, attempt, error = %e, "body fetch failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn local(&self, cid: &ContentId) -> FetchResult<Option<Bytes>> {
        if !self.blobs.contains(cid)? {
            return Ok(None);
        }
        Ok(self.blobs.get(cid)?)
    }

    async fn fetch_remote(&self, cid: ContentId, timeout: Duration) -> FetchResult<Bytes> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self.ask_peers(cid, timeout).await;
        match &outcome {
            Ok((peer, body)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut ring) = self.latencies.lock() {
                    ring.record(elapsed);
                }
                info!(cid = %cid, peer = %peer, bytes = body.len(), elapsed_ms = elapsed, "body fetched");
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                match e {
                    FetchError::NoPeers => {
                        self.counters.no_peers.fetch_add(1, Ordering::Relaxed);
                    }
                    FetchError::Timeout { .. } => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                warn!(cid = %cid, error = %e, "body fetch failed");
            }
        }
        let (_, body) = outcome?;
        self.store(cid, body.clone())?;
        Ok(body)
    }

    async fn ask_peers(&self, cid: ContentId, timeout: Duration) -> FetchResult<(PeerId, Bytes)> {
        let mut peers = self.transport.connected_peers().await;
        if peers.is_empty() {
            return Err(FetchError::NoPeers);
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.fanout);

        let requester = self.transport.local_peer();
        let asked = peers.len();
        let mut requests = JoinSet::new();
        for peer in peers {
            let transport = Arc::clone(&self.transport);
            let message = AgoraMessage::ContentRequest {
                request_id: Uuid::now_v7().to_string(),
                requester: requester.clone(),
                cid,
            };
            requests.spawn(async move {
                let reply: SyncResult<AgoraMessage> = transport.request(&peer, message, timeout).await;
                (peer, reply)
            });
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut absent = 0;
        let mut corrupt = None;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = requests.join_next() => match joined {
                    None => break,
                    Some(Err(e)) => warn!(cid = %cid, error = %e, "content request task failed"),
                    Some(Ok((peer, Ok(AgoraMessage::ContentResponse { cid: got, body: Some(body), .. })))) if got == cid => {
                        if cid.matches(&body) {
                            return Ok((peer, Bytes::from(body)));
                        }
                        warn!(cid = %cid, peer = %peer, "peer returned a body with the wrong hash");
                        corrupt = Some(peer);
                    }
                    Some(Ok((_, Ok(AgoraMessage::ContentResponse { body: None, .. })))) => absent += 1,
                    Some(Ok((peer, Ok(other)))) => {
                        debug!(cid = %cid, peer = %peer, kind = other.type_name(), "unexpected reply to content request");
                    }
                    Some(Ok((peer, Err(e)))) => {
                        debug!(cid = %cid, peer = %peer, error = %e, "content request failed");
                    }
                },
            }
        }

        if let Some(peer) = corrupt {
            Err(FetchError::Integrity { cid, peer })
        } else if absent == asked {
            Err(FetchError::NotFound(cid))
        } else {
            Err(FetchError::Timeout {
                cid,
                after_ms: timeout.as_millis() as u64,
            })
        }
    }

    /// Keep a fetched body, subject to the quota of the zone referencing it.
    /// A quota refusal still hands the body to the caller.
    fn store(&self, cid: ContentId, body: Bytes) -> FetchResult<()> {
        let zone = self
            .references
            .zones_referencing(&cid)
            .into_iter()
            .next()
            .unwrap_or(Zone::Public);
        match self.blobs.put_with_quota(cid, body, zone, self.quota.cap(zone)) {
            Ok(report) => {
                if !report.evicted.is_empty() {
                    debug!(cid = %cid, zone = %zone, evicted = report.evicted.len(), "made room for fetched body");
                }
                Ok(())
            }
            Err(e @ (BlobError::QuotaExceeded { .. } | BlobError::NoEvictableCandidates { .. })) => {
                warn!(cid = %cid, zone = %zone, error = %e, "fetched body not cached");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            no_peers: self.counters.no_peers.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            p95_latency_ms: self.latencies.lock().ok().and_then(|ring| ring.p95()),
        }
    }
}
