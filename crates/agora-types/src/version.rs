use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::OpId;

/// Position of an operation in the last-writer-wins order.
///
/// Ordering: `lamport` first, then `op_id` byte-lexicographically. The order
/// is total, so every replica picks the same winner for any pair of
/// operations regardless of arrival order.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub lamport: u64,
    pub op_id: OpId,
}

impl Version {
    pub fn new(lamport: u64, op_id: impl Into<OpId>) -> Self {
        Self {
            lamport,
            op_id: op_id.into(),
        }
    }

    /// Returns `true` if `self` strictly beats `other`.
    pub fn supersedes(&self, other: &Self) -> bool {
        self > other
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.op_id.as_str().cmp(other.op_id.as_str()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({}@{})", self.op_id, self.lamport)
    }
}
