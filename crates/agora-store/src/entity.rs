use agora_types::{AuthorKey, ContentId, EntityId, EntityKind, OpId, OpKind, Version, Zone};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Mutable fields of a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContent {
    pub title: String,
    /// Body reference. The body itself lives in the blob store.
    pub content_cid: Option<ContentId>,
    pub zone: Zone,
    /// Bytes charged against the zone quota for this index row.
    pub size_bytes: u64,
    /// Protected rows are never evicted by zone quota.
    pub protected: bool,
}

/// Mutable fields of a comment. Comment bodies are stored inline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentContent {
    pub post_id: EntityId,
    pub parent_id: Option<EntityId>,
    pub body: String,
}

/// Field values carried by a create or update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Post(PostContent),
    Comment(CommentContent),
}

impl Content {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Post(_) => EntityKind::Post,
            Self::Comment(_) => EntityKind::Comment,
        }
    }
}

/// An operation offered to [`EntityStore::apply`](crate::EntityStore::apply).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub op_id: OpId,
    pub op_kind: OpKind,
    pub author: AuthorKey,
    pub lamport: u64,
    /// Wall-clock seconds at the origin.
    pub timestamp: u64,
    /// Required for create/update, ignored for delete.
    pub content: Option<Content>,
}

impl Operation {
    /// Build a delete.
    pub fn delete(
        entity_id: EntityId,
        entity_kind: EntityKind,
        author: AuthorKey,
        timestamp: u64,
        lamport: u64,
        op_id: OpId,
    ) -> Self {
        Self {
            entity_id,
            entity_kind,
            op_id,
            op_kind: OpKind::Delete,
            author,
            lamport,
            timestamp,
            content: None,
        }
    }

    /// The lamport this operation is ordered by. A zero lamport (legacy or
    /// clock-less origin) falls back to the timestamp.
    pub fn effective_lamport(&self) -> u64 {
        if self.lamport == 0 {
            self.timestamp
        } else {
            self.lamport
        }
    }

    pub fn version(&self) -> Version {
        Version::new(self.effective_lamport(), self.op_id.clone())
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        let invalid = |reason: &str| StoreError::InvalidOperation {
            entity: self.entity_id.clone(),
            reason: reason.to_string(),
        };
        if self.entity_id.is_empty() {
            return Err(invalid("empty entity id"));
        }
        if self.op_id.is_empty() {
            return Err(invalid("empty op id"));
        }
        if self.op_kind.is_delete() {
            return Ok(());
        }
        match &self.content {
            None => Err(invalid("create/update without content")),
            Some(content) if content.kind() != self.entity_kind => {
                Err(invalid("content does not match entity kind"))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Result of offering an operation to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The entity already holds an equal or newer version. Not an error.
    RejectedStale,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Display state of an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Normal,
    Deleted,
}

/// The current state of a post or comment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Author of the operation that produced this state.
    pub author: AuthorKey,
    /// `None` only for a tombstone of an entity never seen alive.
    pub content: Option<Content>,
    pub lamport: u64,
    pub current_op_id: OpId,
    /// Intent of the operation named by `current_op_id`.
    pub current_op_kind: OpKind,
    pub deleted: bool,
    pub deleted_at_lamport: Option<u64>,
    pub deleted_at_timestamp: Option<u64>,
    pub timestamp: u64,
}

impl Entity {
    pub fn version(&self) -> Version {
        Version::new(self.lamport, self.current_op_id.clone())
    }

    pub fn visibility(&self) -> Visibility {
        if self.deleted {
            Visibility::Deleted
        } else {
            Visibility::Normal
        }
    }

    pub fn post(&self) -> Option<&PostContent> {
        match &self.content {
            Some(Content::Post(post)) => Some(post),
            _ => None,
        }
    }

    pub fn comment(&self) -> Option<&CommentContent> {
        match &self.content {
            Some(Content::Comment(comment)) => Some(comment),
            _ => None,
        }
    }

    /// Zone of a post. Comments and bare tombstones have none.
    pub fn zone(&self) -> Option<Zone> {
        self.post().map(|p| p.zone)
    }

    pub fn content_cid(&self) -> Option<ContentId> {
        self.post().and_then(|p| p.content_cid)
    }

    /// Bytes this row charges against its zone quota.
    pub fn quota_bytes(&self) -> u64 {
        if self.deleted {
            return 0;
        }
        self.post().map_or(0, |p| p.size_bytes)
    }

    /// Whether zone quota may evict this row.
    pub fn is_evictable(&self) -> bool {
        !self.deleted && self.post().is_some_and(|p| !p.protected)
    }

    /// Whether this row may be offered to peers. Private posts stay local.
    pub fn is_shareable(&self) -> bool {
        self.zone() != Some(Zone::Private)
    }

    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            id: self.id.clone(),
            visibility: self.visibility(),
            lamport: self.lamport,
            current_op_id: self.current_op_id.clone(),
        }
    }
}

/// The fields replicas must agree on once they have seen the same
/// operations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub visibility: Visibility,
    pub lamport: u64,
    pub current_op_id: OpId,
}
