use agora_types::{EntityId, Version, Zone};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{StoreError, StoreResult};

/// Byte caps per zone. Shared by index rows and blob bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub private_bytes: u64,
    pub public_bytes: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            private_bytes: 20 * 1024 * 1024, // 20 MiB
            public_bytes: 80 * 1024 * 1024,  // 80 MiB
        }
    }
}

impl QuotaConfig {
    pub fn cap(&self, zone: Zone) -> u64 {
        match zone {
            Zone::Private => self.private_bytes,
            Zone::Public => self.public_bytes,
        }
    }
}

/// Rows to evict so that `incoming` bytes fit in `zone`.
///
/// `writing` is the entity being committed: its current size is not counted
/// (it is about to be replaced) and it is never a candidate. Candidates are
/// the oldest live, unprotected posts of the zone, by `(timestamp, id)`.
/// Each planned eviction carries the version it was planned against so the
/// commit can detect a row that changed in the meantime.
pub fn plan_zone_evictions<'a>(
    entities: impl IntoIterator<Item = &'a Entity>,
    zone: Zone,
    incoming: u64,
    writing: &EntityId,
    cap: u64,
) -> StoreResult<Vec<(EntityId, Version)>> {
    if incoming > cap {
        return Err(StoreError::QuotaExceeded {
            zone,
            needed: incoming,
            cap,
        });
    }

    let mut used = 0u64;
    let mut candidates: Vec<&Entity> = Vec::new();
    for entity in entities {
        if entity.zone() != Some(zone) || entity.id == *writing {
            continue;
        }
        used += entity.quota_bytes();
        if entity.is_evictable() {
            candidates.push(entity);
        }
    }
    if used + incoming <= cap {
        return Ok(Vec::new());
    }

    candidates.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let mut remaining = used;
    let mut plan = Vec::new();
    for entity in candidates {
        if remaining + incoming <= cap {
            break;
        }
        remaining -= entity.quota_bytes();
        plan.push((entity.id.clone(), entity.version()));
    }
    if remaining + incoming > cap {
        return Err(StoreError::NoEvictableCandidates {
            zone,
            used,
            needed: incoming,
            cap,
        });
    }
    Ok(plan)
}
