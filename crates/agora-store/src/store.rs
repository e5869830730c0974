use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use agora_blob::ZoneReferences;
use agora_types::{
    AuthorKey, ContentId, EntityId, EntityKind, LamportClock, OpId, Version, Zone,
};
use tracing::{debug, info, warn};

use crate::entity::{ApplyOutcome, Entity, EntitySummary, Operation};
use crate::error::{StoreError, StoreResult};
use crate::merge::{self, MergeDecision};
use crate::oplog::{OpLog, OperationRecord};
use crate::quota::{self, QuotaConfig};
use crate::wal::{WalCommit, WalConfig, WriteAheadLog};

/// Number of per-entity lock stripes.
const ENTITY_STRIPES: usize = 64;

/// Commits retried this many times when a concurrent eviction or erasure
/// changes the rows a merge was planned against.
const MAX_COMMIT_ATTEMPTS: usize = 8;

/// File name of the log inside a store directory.
pub const WAL_FILE_NAME: &str = "entities.wal";

#[derive(Default)]
struct Tables {
    entities: HashMap<EntityId, Entity>,
    oplog: OpLog,
    /// Body references per zone, counting tombstones too.
    cid_refs: HashMap<ContentId, HashMap<Zone, usize>>,
}

impl Tables {
    fn track(&mut self, entity: &Entity, add: bool) {
        let (Some(cid), Some(zone)) = (entity.content_cid(), entity.zone()) else {
            return;
        };
        if add {
            *self.cid_refs.entry(cid).or_default().entry(zone).or_default() += 1;
            return;
        }
        if let Some(zones) = self.cid_refs.get_mut(&cid) {
            if let Some(count) = zones.get_mut(&zone) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    zones.remove(&zone);
                }
            }
            if zones.is_empty() {
                self.cid_refs.remove(&cid);
            }
        }
    }

    fn put_entity(&mut self, entity: Entity) {
        self.track(&entity, true);
        if let Some(old) = self.entities.insert(entity.id.clone(), entity) {
            self.track(&old, false);
        }
    }

    fn remove_entity(&mut self, id: &EntityId) -> Option<Entity> {
        let entity = self.entities.remove(id)?;
        self.track(&entity, false);
        self.oplog.remove_entity(id);
        Some(entity)
    }

    fn apply_commit(&mut self, commit: WalCommit) {
        for id in &commit.removed {
            self.remove_entity(id);
        }
        if let Some(entity) = commit.upsert {
            self.put_entity(entity);
        }
        for record in commit.records {
            self.oplog.append(record);
        }
    }

    fn version_of(&self, id: &EntityId) -> Option<Version> {
        self.entities.get(id).map(Entity::version)
    }
}

/// The replicated post and comment tables of one node.
///
/// # Locking
///
/// - one striped mutex per entity id serializes read-merge-write for that id;
/// - one mutex per zone serializes quota accounting;
/// - the tables themselves sit behind an `RwLock` taken only to read a
///   snapshot or to validate and install a commit.
///
/// A commit re-checks, under the write lock, that the entity and every row
/// planned for eviction still hold the versions the merge was computed
/// from; if not, the merge is recomputed.
pub struct EntityStore {
    tables: RwLock<Tables>,
    stripes: Vec<Mutex<()>>,
    zone_locks: [Mutex<()>; 2],
    quota: QuotaConfig,
    clock: LamportClock,
    wal: Option<WriteAheadLog>,
}

impl EntityStore {
    /// A store that lives only in memory.
    pub fn in_memory(quota: QuotaConfig) -> Self {
        Self::with_parts(Tables::default(), quota, LamportClock::new(), None)
    }

    /// Open (or create) a durable store in `dir`, replaying its log.
    pub fn open(dir: &Path, quota: QuotaConfig, wal_config: WalConfig) -> StoreResult<Self> {
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE_NAME), wal_config)?;
        let mut tables = Tables::default();
        let mut max_lamport = 0;
        for commit in wal.recover()? {
            if let Some(entity) = &commit.upsert {
                max_lamport = max_lamport.max(entity.lamport);
            }
            tables.apply_commit(commit);
        }
        info!(
            path = %wal.path().display(),
            entities = tables.entities.len(),
            operations = tables.oplog.len(),
            lamport = max_lamport,
            "entity store recovered"
        );
        Ok(Self::with_parts(
            tables,
            quota,
            LamportClock::starting_at(max_lamport),
            Some(wal),
        ))
    }

    fn with_parts(
        tables: Tables,
        quota: QuotaConfig,
        clock: LamportClock,
        wal: Option<WriteAheadLog>,
    ) -> Self {
        Self {
            tables: RwLock::new(tables),
            stripes: (0..ENTITY_STRIPES).map(|_| Mutex::new(())).collect(),
            zone_locks: [Mutex::new(()), Mutex::new(())],
            quota,
            clock,
            wal,
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::LockPoisoned("entity tables"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::LockPoisoned("entity tables"))
    }

    fn lock_entity(&self, id: &EntityId) -> StoreResult<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % ENTITY_STRIPES as u64) as usize;
        self.stripes[stripe]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("entity stripe"))
    }

    fn lock_zone(&self, zone: Zone) -> StoreResult<MutexGuard<'_, ()>> {
        let idx = match zone {
            Zone::Private => 0,
            Zone::Public => 1,
        };
        self.zone_locks[idx]
            .lock()
            .map_err(|_| StoreError::LockPoisoned("zone quota"))
    }

    fn persist(&self, commit: &WalCommit) -> StoreResult<()> {
        if let Some(wal) = &self.wal {
            wal.append(commit)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Offer an operation to the store.
    ///
    /// Returns [`ApplyOutcome::RejectedStale`] when the entity already holds
    /// an equal or newer version, or the op id was applied before. On
    /// acceptance the new state, its operation record and any zone quota
    /// evictions are committed together.
    pub fn apply(&self, op: Operation) -> StoreResult<ApplyOutcome> {
        op.validate()?;
        self.clock.observe(op.effective_lamport());
        let _entity_guard = self.lock_entity(&op.entity_id)?;

        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let current = {
                let tables = self.read()?;
                if tables.oplog.contains(&op.op_id) {
                    debug!(entity = %op.entity_id, op = %op.op_id, "duplicate operation ignored");
                    return Ok(ApplyOutcome::RejectedStale);
                }
                tables.entities.get(&op.entity_id).cloned()
            };
            if let Some(existing) = &current {
                if existing.kind != op.entity_kind {
                    return Err(StoreError::InvalidOperation {
                        entity: op.entity_id.clone(),
                        reason: format!("entity is a {:?}, not a {:?}", existing.kind, op.entity_kind),
                    });
                }
            }
            if merge::decide(current.as_ref(), &op) == MergeDecision::Stale {
                debug!(
                    entity = %op.entity_id,
                    op = %op.op_id,
                    lamport = op.effective_lamport(),
                    "stale operation rejected"
                );
                return Ok(ApplyOutcome::RejectedStale);
            }

            let next = merge::merged(current.as_ref(), &op);
            let expected = current.as_ref().map(Entity::version);

            let mut _zone_guard = None;
            let mut evictions = Vec::new();
            if let (Some(zone), false) = (next.zone(), next.deleted) {
                _zone_guard = Some(self.lock_zone(zone)?);
                let tables = self.read()?;
                evictions = quota::plan_zone_evictions(
                    tables.entities.values(),
                    zone,
                    next.quota_bytes(),
                    &next.id,
                    self.quota.cap(zone),
                )?;
            }

            let mut tables = self.write()?;
            let unchanged = tables.version_of(&op.entity_id) == expected
                && evictions
                    .iter()
                    .all(|(id, version)| tables.version_of(id).as_ref() == Some(version));
            if !unchanged {
                debug!(entity = %op.entity_id, attempt, "rows changed during merge; retrying");
                continue;
            }

            let commit = WalCommit {
                removed: evictions.into_iter().map(|(id, _)| id).collect(),
                upsert: Some(next),
                records: vec![OperationRecord::from_operation(&op)],
            };
            self.persist(&commit)?;
            if !commit.removed.is_empty() {
                info!(
                    entity = %op.entity_id,
                    evicted = commit.removed.len(),
                    "zone quota evicted index rows"
                );
            }
            tables.apply_commit(commit);
            debug!(
                entity = %op.entity_id,
                op = %op.op_id,
                kind = %op.op_kind,
                lamport = op.effective_lamport(),
                "operation applied"
            );
            return Ok(ApplyOutcome::Applied);
        }

        warn!(entity = %op.entity_id, "giving up after repeated commit conflicts");
        Err(StoreError::Contended(op.entity_id))
    }

    /// Tombstone an entity. Subject to the same merge rule as [`Self::apply`].
    pub fn delete(
        &self,
        entity_id: EntityId,
        entity_kind: EntityKind,
        author: AuthorKey,
        timestamp: u64,
        lamport: u64,
        op_id: OpId,
    ) -> StoreResult<ApplyOutcome> {
        self.apply(Operation::delete(
            entity_id,
            entity_kind,
            author,
            timestamp,
            lamport,
            op_id,
        ))
    }

    /// Physically remove a tombstone and its operation records.
    ///
    /// Only succeeds if the entity is still deleted at `expected`; returns
    /// `None` (and changes nothing) otherwise.
    pub fn erase(&self, id: &EntityId, expected: &Version) -> StoreResult<Option<Entity>> {
        let _entity_guard = self.lock_entity(id)?;
        let mut tables = self.write()?;
        match tables.entities.get(id) {
            Some(entity) if entity.deleted && entity.version() == *expected => {}
            _ => return Ok(None),
        }
        self.persist(&WalCommit {
            removed: vec![id.clone()],
            ..WalCommit::default()
        })?;
        Ok(tables.remove_entity(id))
    }

    /// Rewrite the log as a snapshot of the live tables.
    pub fn compact(&self) -> StoreResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let tables = self.write()?;
        let mut ids: Vec<&EntityId> = tables.entities.keys().collect();
        ids.sort();
        let snapshot: Vec<WalCommit> = ids
            .into_iter()
            .map(|id| WalCommit {
                removed: Vec::new(),
                upsert: tables.entities.get(id).cloned(),
                records: tables.oplog.for_entity(id),
            })
            .collect();
        wal.rewrite(&snapshot)?;
        info!(entities = snapshot.len(), "entity log compacted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The current row for `id`, tombstones included.
    pub fn get(&self, id: &EntityId) -> StoreResult<Option<Entity>> {
        Ok(self.read()?.entities.get(id).cloned())
    }

    /// Operation records of one entity in append order.
    pub fn operations(&self, id: &EntityId) -> StoreResult<Vec<OperationRecord>> {
        Ok(self.read()?.oplog.for_entity(id))
    }

    /// Operation records held across all entities.
    pub fn operation_count(&self) -> StoreResult<usize> {
        Ok(self.read()?.oplog.len())
    }

    /// Number of rows, tombstones included.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.read()?.entities.len())
    }

    /// Whether the store holds no rows at all.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// `(visibility, lamport, current_op_id)` of every entity, sorted by id.
    pub fn summaries(&self) -> StoreResult<Vec<EntitySummary>> {
        let mut all: Vec<EntitySummary> =
            self.read()?.entities.values().map(Entity::summary).collect();
        all.sort();
        Ok(all)
    }

    /// Shareable entities touched at or after `since`, oldest first, at most
    /// `limit`. Tombstones are included so deletions replicate.
    pub fn entities_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Entity>> {
        let tables = self.read()?;
        let mut rows: Vec<&Entity> = tables
            .entities
            .values()
            .filter(|e| e.is_shareable() && e.timestamp >= since)
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    /// Newest timestamp among shareable entities.
    pub fn latest_timestamp(&self) -> StoreResult<Option<u64>> {
        Ok(self
            .read()?
            .entities
            .values()
            .filter(|e| e.is_shareable())
            .map(|e| e.timestamp)
            .max())
    }

    /// Tombstones deleted at or before `cutoff`, oldest deletion first.
    pub fn tombstones_before(&self, cutoff: u64, limit: usize) -> StoreResult<Vec<Entity>> {
        let tables = self.read()?;
        let mut rows: Vec<&Entity> = tables
            .entities
            .values()
            .filter(|e| e.deleted && e.deleted_at_timestamp.is_some_and(|at| at <= cutoff))
            .collect();
        rows.sort_by(|a, b| {
            a.deleted_at_timestamp
                .cmp(&b.deleted_at_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    /// Quota bytes used by live posts in `zone`.
    pub fn zone_usage(&self, zone: Zone) -> StoreResult<u64> {
        Ok(self
            .read()?
            .entities
            .values()
            .filter(|e| e.zone() == Some(zone))
            .map(Entity::quota_bytes)
            .sum())
    }

    /// Number of entities (tombstones included) pointing at `cid`.
    pub fn references(&self, cid: &ContentId) -> StoreResult<usize> {
        Ok(self
            .read()?
            .cid_refs
            .get(cid)
            .map_or(0, |zones| zones.values().sum()))
    }

    /// Per-zone index quotas this store enforces.
    pub fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    /// The Lamport clock advanced by every accepted operation.
    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Lamport for a locally authored operation.
    pub fn next_lamport(&self) -> u64 {
        self.clock.tick()
    }

    /// Whether commits are written to a log on disk.
    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }
}

impl ZoneReferences for EntityStore {
    fn zones_referencing(&self, cid: &ContentId) -> Vec<Zone> {
        match self.read() {
            Ok(tables) => tables
                .cid_refs
                .get(cid)
                .map(|zones| zones.keys().copied().collect())
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "zone lookup failed");
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.len().unwrap_or(0))
            .field("durable", &self.is_durable())
            .field("lamport", &self.clock.current())
            .finish()
    }
}
