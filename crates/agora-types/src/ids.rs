use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::kind::OpKind;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string, trimming surrounding whitespace.
            pub fn new(value: impl Into<String>) -> Self {
                let value = value.into();
                let trimmed = value.trim();
                if trimmed.len() == value.len() {
                    Self(value)
                } else {
                    Self(trimmed.to_string())
                }
            }

            /// Like [`Self::new`] but rejects empty input.
            pub fn parse(value: &str) -> Result<Self, TypeError> {
                let id = Self::new(value);
                if id.0.is_empty() {
                    return Err(TypeError::EmptyIdentifier);
                }
                Ok(id)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable identifier of a post or comment.
    EntityId
);

string_id!(
    /// Public key (or other stable handle) of the author of an operation.
    AuthorKey
);

string_id!(
    /// Transport-level identifier of a connected peer.
    PeerId
);

string_id!(
    /// Globally unique operation identifier.
    ///
    /// Ordered byte-lexicographically; that order breaks lamport ties, so it
    /// must never depend on locale or normalization.
    OpId
);

impl OpId {
    /// Compose the canonical id `"{entity}:{author}:{lamport}:{intent}"`.
    pub fn compose(entity: &EntityId, author: &AuthorKey, lamport: u64, intent: OpKind) -> Self {
        Self(format!("{entity}:{author}:{lamport}:{}", intent.as_str()))
    }
}
