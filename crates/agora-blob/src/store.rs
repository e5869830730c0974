use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use agora_types::{ContentId, Zone};
use bytes::Bytes;
use tracing::debug;

use crate::error::{BlobError, BlobResult};
use crate::refs::ZoneReferences;
use crate::stats::{CacheCounters, CacheStats};

/// A stored body plus its recency bookkeeping.
struct BlobRecord {
    body: Bytes,
    /// Insertion order; breaks ties between blobs never read.
    created: u64,
    /// Last `get` or `put`, in the same sequence space as `created`.
    last_access: u64,
    /// Outstanding pins. A pinned blob is neither evicted nor removed.
    pins: u32,
}

impl BlobRecord {
    fn size(&self) -> u64 {
        self.body.len() as u64
    }

    fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

#[derive(Default)]
struct BlobTable {
    blobs: HashMap<ContentId, BlobRecord>,
    /// Monotonic access sequence. Seconds-resolution clocks tie too often
    /// to order evictions deterministically.
    seq: u64,
}

impl BlobTable {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Outcome of [`BlobStore::put_with_quota`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutReport {
    pub size: u64,
    pub evicted: Vec<ContentId>,
}

/// Content-addressed body store with per-zone LRU quotas.
///
/// The blob table sits behind a single mutex that is held for the whole of
/// an eviction pass, so two writers can never both decide there is room.
/// Zone membership is not stored here; it is looked up through
/// [`ZoneReferences`] at eviction time.
pub struct BlobStore {
    table: Mutex<BlobTable>,
    references: Arc<dyn ZoneReferences>,
    counters: CacheCounters,
}

impl BlobStore {
    pub fn new(references: Arc<dyn ZoneReferences>) -> Self {
        Self {
            table: Mutex::new(BlobTable::default()),
            references,
            counters: CacheCounters::default(),
        }
    }

    fn lock(&self) -> BlobResult<MutexGuard<'_, BlobTable>> {
        self.table.lock().map_err(|_| BlobError::LockPoisoned)
    }

    /// Store a body under its content id. Returns the body size.
    ///
    /// Re-putting an existing body only refreshes its recency.
    pub fn put(&self, cid: ContentId, body: impl Into<Bytes>) -> BlobResult<u64> {
        let body = body.into();
        verify(&cid, &body)?;
        let mut table = self.lock()?;
        Ok(insert_locked(&mut table, cid, body))
    }

    /// Make room in `zone` and store the body, atomically.
    pub fn put_with_quota(
        &self,
        cid: ContentId,
        body: impl Into<Bytes>,
        zone: Zone,
        quota_bytes: u64,
    ) -> BlobResult<PutReport> {
        let body = body.into();
        verify(&cid, &body)?;
        let mut table = self.lock()?;
        let evicted =
            self.ensure_quota_locked(&mut table, zone, quota_bytes, body.len() as u64, Some(&cid))?;
        let size = insert_locked(&mut table, cid, body);
        Ok(PutReport { size, evicted })
    }

    /// [`put_with_quota`](Self::put_with_quota) that also takes a pin in the
    /// same lock hold, so the body cannot be evicted or collected before the
    /// caller commits the row that references it. Release with
    /// [`unpin`](Self::unpin).
    pub fn put_pinned_with_quota(
        &self,
        cid: ContentId,
        body: impl Into<Bytes>,
        zone: Zone,
        quota_bytes: u64,
    ) -> BlobResult<PutReport> {
        let body = body.into();
        verify(&cid, &body)?;
        let mut table = self.lock()?;
        let evicted =
            self.ensure_quota_locked(&mut table, zone, quota_bytes, body.len() as u64, Some(&cid))?;
        let size = insert_locked(&mut table, cid, body);
        if let Some(record) = table.blobs.get_mut(&cid) {
            record.pins += 1;
        }
        Ok(PutReport { size, evicted })
    }

    /// Read a body, recording a cache hit or miss.
    pub fn get(&self, cid: &ContentId) -> BlobResult<Option<Bytes>> {
        let mut table = self.lock()?;
        let seq = table.next_seq();
        match table.blobs.get_mut(cid) {
            Some(record) => {
                record.last_access = seq;
                self.counters.record_hit();
                Ok(Some(record.body.clone()))
            }
            None => {
                self.counters.record_miss();
                Ok(None)
            }
        }
    }

    /// Read a body on behalf of a peer. Neither recency nor the cache
    /// counters move, so remote traffic does not steer local eviction.
    pub fn peek(&self, cid: &ContentId) -> BlobResult<Option<Bytes>> {
        Ok(self.lock()?.blobs.get(cid).map(|record| record.body.clone()))
    }

    /// Presence check that neither touches recency nor the counters.
    pub fn contains(&self, cid: &ContentId) -> BlobResult<bool> {
        Ok(self.lock()?.blobs.contains_key(cid))
    }

    /// Drop a body. Pinned bodies are kept and `false` is returned.
    pub fn remove(&self, cid: &ContentId) -> BlobResult<bool> {
        let mut table = self.lock()?;
        match table.blobs.get(cid) {
            Some(record) if record.is_pinned() => {
                debug!(%cid, pins = record.pins, "pinned blob kept");
                Ok(false)
            }
            Some(_) => Ok(table.blobs.remove(cid).is_some()),
            None => Ok(false),
        }
    }

    /// Drop a body only if it is unpinned and no zone references it. The
    /// reference check and the removal happen under one lock hold.
    pub fn remove_if_unreferenced(&self, cid: &ContentId) -> BlobResult<bool> {
        let mut table = self.lock()?;
        match table.blobs.get(cid) {
            Some(record) if !record.is_pinned() => {
                if !self.references.zones_referencing(cid).is_empty() {
                    return Ok(false);
                }
                table.blobs.remove(cid);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Exclude a blob from eviction and removal. Pins nest. Returns `false`
    /// if the blob is absent.
    pub fn pin(&self, cid: &ContentId) -> BlobResult<bool> {
        let mut table = self.lock()?;
        Ok(match table.blobs.get_mut(cid) {
            Some(record) => {
                record.pins += 1;
                true
            }
            None => false,
        })
    }

    /// Release one pin.
    pub fn unpin(&self, cid: &ContentId) -> BlobResult<bool> {
        let mut table = self.lock()?;
        Ok(match table.blobs.get_mut(cid) {
            Some(record) => {
                record.pins = record.pins.saturating_sub(1);
                true
            }
            None => false,
        })
    }

    /// Evict bodies until `incoming_bytes` more fit under `quota_bytes` for
    /// `zone`. Orphaned bodies count against every zone and go first, then
    /// the zone's own bodies in least-recently-accessed order. Returns the
    /// evicted ids.
    pub fn ensure_quota(
        &self,
        zone: Zone,
        quota_bytes: u64,
        incoming_bytes: u64,
        protect: Option<&ContentId>,
    ) -> BlobResult<Vec<ContentId>> {
        let mut table = self.lock()?;
        self.ensure_quota_locked(&mut table, zone, quota_bytes, incoming_bytes, protect)
    }

    fn ensure_quota_locked(
        &self,
        table: &mut BlobTable,
        zone: Zone,
        quota_bytes: u64,
        incoming_bytes: u64,
        protect: Option<&ContentId>,
    ) -> BlobResult<Vec<ContentId>> {
        let mut used = 0u64;
        let mut candidates: Vec<(bool, u64, u64, ContentId, u64)> = Vec::new();
        let mut incoming = incoming_bytes;

        for (cid, record) in &table.blobs {
            let zones = self.references.zones_referencing(cid);
            let orphaned = zones.is_empty();
            if !orphaned && !zones.contains(&zone) {
                continue;
            }
            used += record.size();
            if protect == Some(cid) {
                // Already stored and counted in this zone.
                incoming = 0;
                continue;
            }
            if record.is_pinned() || zones.len() > 1 {
                continue;
            }
            candidates.push((!orphaned, record.last_access, record.created, *cid, record.size()));
        }

        if incoming > quota_bytes {
            return Err(BlobError::QuotaExceeded {
                zone,
                incoming,
                cap: quota_bytes,
            });
        }
        if used + incoming <= quota_bytes {
            return Ok(Vec::new());
        }

        candidates.sort_unstable_by_key(|(referenced, last, created, cid, _)| {
            (*referenced, *last, *created, *cid)
        });
        let mut remaining = used;
        let mut plan = Vec::new();
        for (_, _, _, cid, size) in candidates {
            if remaining + incoming <= quota_bytes {
                break;
            }
            remaining -= size;
            plan.push(cid);
        }
        // Nothing is removed unless the whole plan makes room.
        if remaining + incoming > quota_bytes {
            return Err(BlobError::NoEvictableCandidates {
                zone,
                used,
                incoming,
                cap: quota_bytes,
            });
        }

        for cid in &plan {
            if let Some(record) = table.blobs.remove(cid) {
                debug!(%cid, %zone, size = record.size(), "evicted blob body");
            }
        }
        self.counters.record_evictions(plan.len() as u64);
        Ok(plan)
    }

    /// Bytes currently held on behalf of `zone`.
    pub fn zone_usage(&self, zone: Zone) -> BlobResult<u64> {
        let table = self.lock()?;
        Ok(table
            .blobs
            .iter()
            .filter(|(cid, _)| self.references.zones_referencing(cid).contains(&zone))
            .map(|(_, record)| record.size())
            .sum())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub fn stats(&self) -> BlobResult<CacheStats> {
        let table = self.lock()?;
        Ok(CacheStats {
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            evictions: self.counters.evictions(),
            stored_blobs: table.blobs.len() as u64,
            stored_bytes: table.blobs.values().map(BlobRecord::size).sum(),
        })
    }
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("blob_count", &self.len())
            .finish()
    }
}

fn verify(cid: &ContentId, body: &[u8]) -> BlobResult<()> {
    let actual = ContentId::for_body(body);
    if actual != *cid {
        return Err(BlobError::HashMismatch {
            expected: *cid,
            actual,
        });
    }
    Ok(())
}

fn insert_locked(table: &mut BlobTable, cid: ContentId, body: Bytes) -> u64 {
    let seq = table.next_seq();
    let record = table.blobs.entry(cid).or_insert_with(|| BlobRecord {
        body,
        created: seq,
        last_access: seq,
        pins: 0,
    });
    record.last_access = seq;
    record.size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::NoReferences;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// Test double: zone membership assigned by hand.
    #[derive(Default)]
    struct ManualReferences(RwLock<HashMap<ContentId, Vec<Zone>>>);

    impl ManualReferences {
        fn assign(&self, cid: ContentId, zones: &[Zone]) {
            self.0.write().unwrap().insert(cid, zones.to_vec());
        }
    }

    impl ZoneReferences for ManualReferences {
        fn zones_referencing(&self, cid: &ContentId) -> Vec<Zone> {
            self.0.read().unwrap().get(cid).cloned().unwrap_or_default()
        }
    }

    fn body(tag: u8, len: usize) -> (ContentId, Vec<u8>) {
        let bytes = vec![tag; len];
        (ContentId::for_body(&bytes), bytes)
    }

    fn setup() -> (Arc<ManualReferences>, BlobStore) {
        let refs = Arc::new(ManualReferences::default());
        let store = BlobStore::new(refs.clone());
        (refs, store)
    }

    // ----------------------------------------------------------------
    // put / get
    // ----------------------------------------------------------------

    #[test]
    fn put_and_get() {
        let store = BlobStore::new(Arc::new(NoReferences));
        let (cid, bytes) = body(1, 32);
        assert_eq!(store.put(cid, bytes.clone()).unwrap(), 32);
        assert_eq!(store.get(&cid).unwrap().unwrap(), Bytes::from(bytes));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_rejects_mismatched_body() {
        let store = BlobStore::new(Arc::new(NoReferences));
        let (cid, _) = body(1, 8);
        let err = store.put(cid, b"something else".to_vec()).unwrap_err();
        assert!(matches!(err, BlobError::HashMismatch { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn get_records_hits_and_misses() {
        let store = BlobStore::new(Arc::new(NoReferences));
        let (cid, bytes) = body(2, 8);
        let (missing, _) = body(3, 8);
        store.put(cid, bytes).unwrap();
        store.get(&cid).unwrap();
        store.get(&cid).unwrap();
        assert!(store.get(&missing).unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (2, 1));
        assert_eq!(stats.stored_bytes, 8);
    }

    #[test]
    fn contains_does_not_count() {
        let store = BlobStore::new(Arc::new(NoReferences));
        let (cid, _) = body(4, 4);
        assert!(!store.contains(&cid).unwrap());
        assert_eq!(store.stats().unwrap().misses, 0);
    }

    // ----------------------------------------------------------------
    // quota
    // ----------------------------------------------------------------

    #[test]
    fn evicts_least_recently_accessed_first() {
        let (refs, store) = setup();
        let (a, a_body) = body(10, 40);
        let (b, b_body) = body(11, 40);
        let (c, c_body) = body(12, 40);
        for (cid, bytes) in [(a, a_body), (b, b_body)] {
            refs.assign(cid, &[Zone::Public]);
            store.put(cid, bytes).unwrap();
        }
        // Touch `a` so `b` becomes the oldest.
        store.get(&a).unwrap();

        refs.assign(c, &[Zone::Public]);
        let report = store.put_with_quota(c, c_body, Zone::Public, 100).unwrap();
        assert_eq!(report.evicted, vec![b]);
        assert!(store.contains(&a).unwrap());
        assert!(store.contains(&c).unwrap());
        assert_eq!(store.counters().evictions(), 1);
    }

    #[test]
    fn incoming_larger_than_cap_is_rejected() {
        let (_, store) = setup();
        let (cid, bytes) = body(20, 200);
        let err = store.put_with_quota(cid, bytes, Zone::Private, 100).unwrap_err();
        assert!(matches!(err, BlobError::QuotaExceeded { incoming: 200, cap: 100, .. }));
    }

    #[test]
    fn pinned_and_shared_blobs_survive() {
        let (refs, store) = setup();
        let (pinned, p_body) = body(30, 40);
        let (shared, s_body) = body(31, 40);
        let (incoming, i_body) = body(32, 40);
        refs.assign(pinned, &[Zone::Public]);
        refs.assign(shared, &[Zone::Public, Zone::Private]);
        store.put(pinned, p_body).unwrap();
        store.put(shared, s_body).unwrap();
        store.pin(&pinned).unwrap();

        let err = store
            .ensure_quota(Zone::Public, 100, 40, Some(&incoming))
            .unwrap_err();
        assert!(matches!(err, BlobError::NoEvictableCandidates { used: 80, .. }));
        assert_eq!(store.len(), 2);

        store.unpin(&pinned).unwrap();
        refs.assign(incoming, &[Zone::Public]);
        let report = store.put_with_quota(incoming, i_body, Zone::Public, 100).unwrap();
        assert_eq!(report.evicted, vec![pinned]);
        assert!(store.contains(&shared).unwrap());
    }

    #[test]
    fn existing_protected_blob_costs_nothing() {
        let (refs, store) = setup();
        let (a, a_body) = body(40, 60);
        let (b, b_body) = body(41, 40);
        refs.assign(a, &[Zone::Public]);
        refs.assign(b, &[Zone::Public]);
        store.put(a, a_body.clone()).unwrap();
        store.put(b, b_body).unwrap();
        // Re-writing `a` at exactly the cap needs no room.
        let report = store.put_with_quota(a, a_body, Zone::Public, 100).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn other_zones_are_untouched() {
        let (refs, store) = setup();
        let (private, p_body) = body(50, 80);
        let (public, q_body) = body(51, 80);
        refs.assign(private, &[Zone::Private]);
        refs.assign(public, &[Zone::Public]);
        store.put(private, p_body).unwrap();
        store.put(public, q_body).unwrap();

        let evicted = store.ensure_quota(Zone::Public, 100, 50, None).unwrap();
        assert_eq!(evicted, vec![public]);
        assert!(store.contains(&private).unwrap());
        assert_eq!(store.zone_usage(Zone::Private).unwrap(), 80);
        assert_eq!(store.zone_usage(Zone::Public).unwrap(), 0);
    }

    #[test]
    fn orphans_are_evicted_before_referenced_bodies() {
        let (refs, store) = setup();
        let (orphan, o_body) = body(60, 60);
        let (live, l_body) = body(61, 60);
        let (incoming, i_body) = body(62, 100);
        store.put(orphan, o_body).unwrap();
        refs.assign(live, &[Zone::Public]);
        store.put(live, l_body).unwrap();
        // `orphan` is more recent but holds no reference.
        store.get(&orphan).unwrap();

        let report = store.put_with_quota(incoming, i_body, Zone::Public, 200).unwrap();
        assert_eq!(report.evicted, vec![orphan]);
        assert!(store.contains(&live).unwrap());
        assert_eq!(store.stats().unwrap().stored_bytes, 160);
    }

    #[test]
    fn orphans_count_against_any_zone() {
        let (_, store) = setup();
        let (orphan, o_body) = body(63, 90);
        store.put(orphan, o_body).unwrap();
        let evicted = store.ensure_quota(Zone::Private, 100, 20, None).unwrap();
        assert_eq!(evicted, vec![orphan]);
        assert!(store.is_empty());
    }

    #[test]
    fn pinned_put_survives_pressure_until_unpinned() {
        let (_, store) = setup();
        let (first, f_body) = body(64, 60);
        let (second, s_body) = body(65, 60);
        store.put_pinned_with_quota(first, f_body, Zone::Public, 100).unwrap();

        let err = store.put_with_quota(second, s_body.clone(), Zone::Public, 100).unwrap_err();
        assert!(matches!(err, BlobError::NoEvictableCandidates { .. }));

        store.unpin(&first).unwrap();
        let report = store.put_with_quota(second, s_body, Zone::Public, 100).unwrap();
        assert_eq!(report.evicted, vec![first]);
    }

    // ----------------------------------------------------------------
    // removal
    // ----------------------------------------------------------------

    #[test]
    fn remove_deletes_body() {
        let (_, store) = setup();
        let (cid, bytes) = body(70, 8);
        store.put(cid, bytes).unwrap();
        assert!(store.remove(&cid).unwrap());
        assert!(!store.remove(&cid).unwrap());
    }

    #[test]
    fn pins_nest_and_block_removal() {
        let (_, store) = setup();
        let (cid, bytes) = body(71, 8);
        store.put(cid, bytes).unwrap();
        store.pin(&cid).unwrap();
        store.pin(&cid).unwrap();
        assert!(!store.remove(&cid).unwrap());
        store.unpin(&cid).unwrap();
        assert!(!store.remove(&cid).unwrap());
        store.unpin(&cid).unwrap();
        assert!(store.remove(&cid).unwrap());
    }

    #[test]
    fn remove_if_unreferenced_checks_references_and_pins() {
        let (refs, store) = setup();
        let (cid, bytes) = body(72, 8);
        store.put(cid, bytes).unwrap();
        refs.assign(cid, &[Zone::Private]);
        assert!(!store.remove_if_unreferenced(&cid).unwrap());

        refs.assign(cid, &[]);
        store.pin(&cid).unwrap();
        assert!(!store.remove_if_unreferenced(&cid).unwrap());

        store.unpin(&cid).unwrap();
        assert!(store.remove_if_unreferenced(&cid).unwrap());
        assert!(!store.contains(&cid).unwrap());
    }

    #[test]
    fn peek_leaves_counters_and_recency_alone() {
        let (refs, store) = setup();
        let (a, a_body) = body(73, 40);
        let (b, b_body) = body(74, 40);
        let (c, c_body) = body(75, 40);
        for (cid, bytes) in [(a, a_body), (b, b_body)] {
            refs.assign(cid, &[Zone::Public]);
            store.put(cid, bytes).unwrap();
        }
        assert!(store.peek(&a).unwrap().is_some());
        let (missing, _) = body(76, 4);
        assert!(store.peek(&missing).unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (0, 0));

        // `a` is still the oldest despite the peek.
        refs.assign(c, &[Zone::Public]);
        let report = store.put_with_quota(c, c_body, Zone::Public, 100).unwrap();
        assert_eq!(report.evicted, vec![a]);
    }
}
