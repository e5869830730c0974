use std::collections::HashMap;

use agora_types::{AuthorKey, EntityId, EntityKind, OpId, OpKind};
use serde::{Deserialize, Serialize};

use crate::entity::Operation;

/// Immutable record of one accepted mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_id: OpId,
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub op_kind: OpKind,
    pub author: AuthorKey,
    pub lamport: u64,
    pub timestamp: u64,
}

impl OperationRecord {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            op_id: op.op_id.clone(),
            entity_id: op.entity_id.clone(),
            entity_kind: op.entity_kind,
            op_kind: op.op_kind,
            author: op.author.clone(),
            lamport: op.effective_lamport(),
            timestamp: op.timestamp,
        }
    }
}

/// Append-only operation log, indexed by op id and by entity.
///
/// Records are only ever removed together with their entity (tombstone
/// erasure or quota eviction).
#[derive(Debug, Default)]
pub struct OpLog {
    records: HashMap<OpId, OperationRecord>,
    by_entity: HashMap<EntityId, Vec<OpId>>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns `false` (and changes nothing) if the op id is
    /// already logged.
    pub fn append(&mut self, record: OperationRecord) -> bool {
        if self.records.contains_key(&record.op_id) {
            return false;
        }
        self.by_entity
            .entry(record.entity_id.clone())
            .or_default()
            .push(record.op_id.clone());
        self.records.insert(record.op_id.clone(), record);
        true
    }

    pub fn contains(&self, op_id: &OpId) -> bool {
        self.records.contains_key(op_id)
    }

    pub fn get(&self, op_id: &OpId) -> Option<&OperationRecord> {
        self.records.get(op_id)
    }

    /// Records of one entity in append order.
    pub fn for_entity(&self, entity: &EntityId) -> Vec<OperationRecord> {
        self.by_entity
            .get(entity)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Drop every record of `entity`. Returns how many were removed.
    pub fn remove_entity(&mut self, entity: &EntityId) -> usize {
        let Some(ids) = self.by_entity.remove(entity) else {
            return 0;
        };
        for id in &ids {
            self.records.remove(id);
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity: &str, op: &str, lamport: u64) -> OperationRecord {
        OperationRecord {
            op_id: OpId::new(op),
            entity_id: EntityId::new(entity),
            entity_kind: EntityKind::Post,
            op_kind: OpKind::Update,
            author: AuthorKey::new("alice"),
            lamport,
            timestamp: lamport,
        }
    }

    #[test]
    fn append_is_idempotent_per_op_id() {
        let mut log = OpLog::new();
        assert!(log.append(record("p1", "op-1", 1)));
        assert!(!log.append(record("p1", "op-1", 1)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn for_entity_keeps_append_order() {
        let mut log = OpLog::new();
        log.append(record("p1", "op-2", 2));
        log.append(record("p2", "op-x", 1));
        log.append(record("p1", "op-1", 3));
        let ids: Vec<_> = log
            .for_entity(&EntityId::new("p1"))
            .into_iter()
            .map(|r| r.op_id.to_string())
            .collect();
        assert_eq!(ids, vec!["op-2", "op-1"]);
    }

    #[test]
    fn remove_entity_drops_only_its_records() {
        let mut log = OpLog::new();
        log.append(record("p1", "a", 1));
        log.append(record("p1", "b", 2));
        log.append(record("p2", "c", 1));
        assert_eq!(log.remove_entity(&EntityId::new("p1")), 2);
        assert_eq!(log.len(), 1);
        assert!(log.contains(&OpId::new("c")));
        assert_eq!(log.remove_entity(&EntityId::new("p1")), 0);
    }
}
