use agora_types::{ContentId, Zone};

/// Answers which zones point at a body.
///
/// Implemented by the entity index; the blob store consults it during quota
/// enforcement so that it never has to track index rows itself.
pub trait ZoneReferences: Send + Sync {
    /// Zones with at least one index row referencing `cid`. Empty when the
    /// body is orphaned.
    fn zones_referencing(&self, cid: &ContentId) -> Vec<Zone>;
}

/// A reference source that knows about nothing. Every blob is orphaned.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl ZoneReferences for NoReferences {
    fn zones_referencing(&self, _cid: &ContentId) -> Vec<Zone> {
        Vec::new()
    }
}
