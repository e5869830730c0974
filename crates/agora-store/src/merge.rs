//! The last-writer-wins decision, kept free of locking and I/O so it can be
//! reasoned about (and tested) on its own.

use crate::entity::{Entity, Operation};

/// What to do with an incoming operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeDecision {
    Accept,
    Stale,
}

/// Decide whether `op` replaces `current`.
///
/// Accept iff the operation's `(lamport, op_id)` is strictly greater than the
/// entity's. The rule is the same for create, update and delete, so a delete
/// only loses to a strictly newer write and a stale create can never bring a
/// tombstone back.
pub fn decide(current: Option<&Entity>, op: &Operation) -> MergeDecision {
    match current {
        None => MergeDecision::Accept,
        Some(entity) if op.version().supersedes(&entity.version()) => MergeDecision::Accept,
        Some(_) => MergeDecision::Stale,
    }
}

/// The entity state after `op` wins over `current`.
///
/// A delete keeps the previous field values (the blob reference is still
/// needed for reclamation) and stamps the tombstone markers. A create or
/// update over a tombstone clears them.
pub fn merged(current: Option<&Entity>, op: &Operation) -> Entity {
    let lamport = op.effective_lamport();
    let kind = current.map_or(op.entity_kind, |e| e.kind);
    if op.op_kind.is_delete() {
        Entity {
            id: op.entity_id.clone(),
            kind,
            author: op.author.clone(),
            content: current.and_then(|e| e.content.clone()),
            lamport,
            current_op_id: op.op_id.clone(),
            current_op_kind: op.op_kind,
            deleted: true,
            deleted_at_lamport: Some(lamport),
            deleted_at_timestamp: Some(op.timestamp),
            timestamp: op.timestamp,
        }
    } else {
        Entity {
            id: op.entity_id.clone(),
            kind,
            author: op.author.clone(),
            content: op.content.clone(),
            lamport,
            current_op_id: op.op_id.clone(),
            current_op_kind: op.op_kind,
            deleted: false,
            deleted_at_lamport: None,
            deleted_at_timestamp: None,
            timestamp: op.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Content, PostContent};
    use agora_types::{AuthorKey, EntityId, EntityKind, OpId, OpKind, Zone};

    fn op(kind: OpKind, lamport: u64, op_id: &str) -> Operation {
        Operation {
            entity_id: EntityId::new("p"),
            entity_kind: EntityKind::Post,
            op_id: OpId::new(op_id),
            op_kind: kind,
            author: AuthorKey::new("alice"),
            lamport,
            timestamp: 1_000 + lamport,
            content: (!kind.is_delete()).then(|| {
                Content::Post(PostContent {
                    title: format!("t{lamport}"),
                    content_cid: None,
                    zone: Zone::Public,
                    size_bytes: 3,
                    protected: false,
                })
            }),
        }
    }

    fn state_after(ops: &[Operation]) -> Option<Entity> {
        let mut current: Option<Entity> = None;
        for o in ops {
            if decide(current.as_ref(), o) == MergeDecision::Accept {
                current = Some(merged(current.as_ref(), o));
            }
        }
        current
    }

    #[test]
    fn first_write_is_accepted() {
        assert_eq!(decide(None, &op(OpKind::Create, 1, "a")), MergeDecision::Accept);
    }

    #[test]
    fn higher_lamport_wins() {
        let e = merged(None, &op(OpKind::Create, 10, "a"));
        assert_eq!(decide(Some(&e), &op(OpKind::Update, 11, "a2")), MergeDecision::Accept);
        assert_eq!(decide(Some(&e), &op(OpKind::Update, 9, "zzz")), MergeDecision::Stale);
    }

    #[test]
    fn exact_replay_is_stale() {
        let o = op(OpKind::Create, 5, "x");
        let e = merged(None, &o);
        assert_eq!(decide(Some(&e), &o), MergeDecision::Stale);
    }

    #[test]
    fn delete_then_stale_create_stays_deleted() {
        let s = state_after(&[
            op(OpKind::Delete, 20, "p:bob:20:delete"),
            op(OpKind::Create, 15, "p:alice:15:create"),
        ])
        .unwrap();
        assert!(s.deleted);
        assert_eq!(s.lamport, 20);
        assert_eq!(s.deleted_at_lamport, Some(20));
    }

    #[test]
    fn newer_update_undeletes() {
        let s = state_after(&[
            op(OpKind::Create, 1, "c"),
            op(OpKind::Delete, 2, "d"),
            op(OpKind::Update, 3, "u"),
        ])
        .unwrap();
        assert!(!s.deleted);
        assert_eq!(s.deleted_at_lamport, None);
        assert_eq!(s.post().unwrap().title, "t3");
    }

    #[test]
    fn delete_keeps_previous_fields() {
        let s = state_after(&[op(OpKind::Create, 1, "c"), op(OpKind::Delete, 2, "d")]).unwrap();
        assert_eq!(s.post().unwrap().title, "t1");
        assert_eq!(s.deleted_at_timestamp, Some(1_002));
    }

    #[test]
    fn equal_lamport_resolves_by_op_id_in_any_order() {
        let a = op(OpKind::Update, 100, "op-100-a");
        let z = op(OpKind::Update, 100, "op-100-z");
        let forward = state_after(&[a.clone(), z.clone()]).unwrap();
        let backward = state_after(&[z, a]).unwrap();
        assert_eq!(forward.current_op_id.as_str(), "op-100-z");
        assert_eq!(forward, backward);
    }

    #[test]
    fn equal_lamport_delete_follows_op_id() {
        let upd = op(OpKind::Update, 50, "m");
        let del_low = op(OpKind::Delete, 50, "a");
        let del_high = op(OpKind::Delete, 50, "z");
        assert!(!state_after(&[upd.clone(), del_low]).unwrap().deleted);
        assert!(state_after(&[upd, del_high]).unwrap().deleted);
    }
}
