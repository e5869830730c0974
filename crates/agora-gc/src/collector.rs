use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_blob::BlobStore;
use agora_store::EntityStore;
use agora_types::{unix_now, EntityId, EntityKind, Version};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TombstoneConfig;
use crate::error::{GcError, GcResult};

/// What one collection pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub deleted_posts: usize,
    pub deleted_comments: usize,
    /// Aged tombstones seen this pass but not yet stable.
    pub pending: usize,
    /// Bodies removed because no remaining entity referenced them.
    pub reclaimed_blobs: usize,
}

impl GcReport {
    pub fn deleted(&self) -> usize {
        self.deleted_posts + self.deleted_comments
    }
}

/// How long a tombstone has looked the same.
#[derive(Clone, Debug)]
struct StableMark {
    version: Version,
    passes: u32,
}

/// Erases tombstones once they are old and have stopped changing.
///
/// Stability is tracked per entity against the version observed: a pass
/// that sees a different version (an undelete, a newer re-delete, any
/// accepted mutation) restarts the count at one. Marks of entities that
/// no longer qualify are dropped at the end of every pass.
pub struct TombstoneCollector {
    entities: Arc<EntityStore>,
    blobs: Arc<BlobStore>,
    marks: Mutex<HashMap<EntityId, StableMark>>,
}

impl TombstoneCollector {
    pub fn new(entities: Arc<EntityStore>, blobs: Arc<BlobStore>) -> Self {
        Self {
            entities,
            blobs,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one pass against the wall clock.
    pub fn run_gc(
        &self,
        age_threshold: Duration,
        min_stable_passes: u32,
        batch_limit: usize,
    ) -> GcResult<GcReport> {
        self.run_gc_at(unix_now(), age_threshold, min_stable_passes, batch_limit)
    }

    /// Run one pass with the settings of `config`.
    pub fn run_with(&self, config: &TombstoneConfig) -> GcResult<GcReport> {
        self.run_gc(
            config.age_threshold(),
            config.min_stable_passes,
            config.batch_limit,
        )
    }

    /// Run one pass as if the time were `now` (seconds since the epoch).
    pub fn run_gc_at(
        &self,
        now: u64,
        age_threshold: Duration,
        min_stable_passes: u32,
        batch_limit: usize,
    ) -> GcResult<GcReport> {
        let mut report = GcReport::default();
        let mut marks = self.marks.lock().map_err(|_| GcError::LockPoisoned)?;

        let Some(cutoff) = now.checked_sub(age_threshold.as_secs()) else {
            marks.clear();
            return Ok(report);
        };
        let required = min_stable_passes.max(1);
        let candidates = self.entities.tombstones_before(cutoff, batch_limit)?;

        let mut next_marks = HashMap::with_capacity(candidates.len());
        for tombstone in candidates {
            let version = tombstone.version();
            let passes = match marks.get(&tombstone.id) {
                Some(mark) if mark.version == version => mark.passes + 1,
                _ => 1,
            };

            if passes < required {
                debug!(entity = %tombstone.id, passes, required, "tombstone not yet stable");
                report.pending += 1;
                next_marks.insert(tombstone.id.clone(), StableMark { version, passes });
                continue;
            }

            let Some(erased) = self.entities.erase(&tombstone.id, &version)? else {
                // Changed between listing and erasure; observed afresh next pass.
                continue;
            };
            match erased.kind {
                EntityKind::Post => report.deleted_posts += 1,
                EntityKind::Comment => report.deleted_comments += 1,
            }
            if let Some(cid) = erased.content_cid() {
                if self.blobs.remove_if_unreferenced(&cid)? {
                    report.reclaimed_blobs += 1;
                }
            }
            debug!(entity = %erased.id, lamport = erased.lamport, "tombstone erased");
        }
        *marks = next_marks;

        if report.deleted() > 0 || report.pending > 0 {
            info!(
                deleted_posts = report.deleted_posts,
                deleted_comments = report.deleted_comments,
                pending = report.pending,
                reclaimed_blobs = report.reclaimed_blobs,
                "tombstone gc pass"
            );
        }
        Ok(report)
    }
}
