use std::cmp::Ordering;

use agora_store::{CommentContent, Content, Entity, Operation, PostContent};
use agora_types::{AuthorKey, ContentId, EntityId, EntityKind, OpId, OpKind, Zone};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Compact summary of an entity's current state.
///
/// One shape serves posts and comments; kind-specific fields are `None`
/// where they do not apply. Replicas apply a digest through the same merge
/// rule as a locally authored operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub id: EntityId,
    pub entity: EntityKind,
    pub op_id: OpId,
    pub op_type: OpKind,
    pub pubkey: AuthorKey,
    pub title: Option<String>,
    pub content_fingerprint: Option<ContentId>,
    /// Index-row size of a post, charged against the zone quota.
    pub size_bytes: u64,
    pub lamport: u64,
    pub timestamp: u64,
    pub deleted: bool,
    /// Post a comment belongs to.
    pub post_id: Option<EntityId>,
    /// Parent comment of a reply.
    pub parent_id: Option<EntityId>,
    /// Inline comment body.
    pub body: Option<String>,
}

impl DigestRecord {
    /// Build the digest for `entity`'s current state.
    pub fn from_entity(entity: &Entity) -> Self {
        let mut digest = Self {
            id: entity.id.clone(),
            entity: entity.kind,
            op_id: entity.current_op_id.clone(),
            op_type: entity.current_op_kind,
            pubkey: entity.author.clone(),
            title: None,
            content_fingerprint: None,
            size_bytes: 0,
            lamport: entity.lamport,
            timestamp: entity.timestamp,
            deleted: entity.deleted,
            post_id: None,
            parent_id: None,
            body: None,
        };
        match &entity.content {
            Some(Content::Post(post)) => {
                digest.title = Some(post.title.clone());
                digest.content_fingerprint = post.content_cid;
                digest.size_bytes = post.size_bytes;
            }
            Some(Content::Comment(comment)) => {
                digest.post_id = Some(comment.post_id.clone());
                digest.parent_id = comment.parent_id.clone();
                digest.body = Some(comment.body.clone());
            }
            None => {}
        }
        digest
    }

    /// Whether this digest describes a deletion.
    pub fn is_delete(&self) -> bool {
        self.deleted || self.op_type.is_delete()
    }

    /// Rebuild the operation this digest summarizes.
    ///
    /// Replicated posts always land in the public zone; private posts are
    /// never offered to peers.
    pub fn to_operation(&self) -> ProtocolResult<Operation> {
        if self.id.is_empty() || self.op_id.is_empty() {
            return Err(self.invalid("empty entity or op id"));
        }
        if self.is_delete() {
            return Ok(Operation::delete(
                self.id.clone(),
                self.entity,
                self.pubkey.clone(),
                self.timestamp,
                self.lamport,
                self.op_id.clone(),
            ));
        }

        let content = match self.entity {
            EntityKind::Post => Content::Post(PostContent {
                title: self.title.clone().unwrap_or_default(),
                content_cid: self.content_fingerprint,
                zone: Zone::Public,
                size_bytes: self.size_bytes,
                protected: false,
            }),
            EntityKind::Comment => Content::Comment(CommentContent {
                post_id: self
                    .post_id
                    .clone()
                    .ok_or_else(|| self.invalid("comment without post id"))?,
                parent_id: self.parent_id.clone(),
                body: self.body.clone().unwrap_or_default(),
            }),
        };
        Ok(Operation {
            entity_id: self.id.clone(),
            entity_kind: self.entity,
            op_id: self.op_id.clone(),
            op_kind: self.op_type,
            author: self.pubkey.clone(),
            lamport: self.lamport,
            timestamp: self.timestamp,
            content: Some(content),
        })
    }

    /// Order in which a batch of digests is applied: newest lamport first,
    /// ties broken by author then op id, both descending.
    pub fn apply_order(a: &Self, b: &Self) -> Ordering {
        b.lamport
            .cmp(&a.lamport)
            .then_with(|| b.pubkey.cmp(&a.pubkey))
            .then_with(|| b.op_id.cmp(&a.op_id))
    }

    fn invalid(&self, reason: &str) -> ProtocolError {
        ProtocolError::InvalidDigest {
            id: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<&Entity> for DigestRecord {
    fn from(entity: &Entity) -> Self {
        Self::from_entity(entity)
    }
}
