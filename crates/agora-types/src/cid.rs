use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Domain prefix mixed into every body hash.
const BODY_DOMAIN: &[u8] = b"agora-body-v1:";

/// Textual prefix of a rendered content id.
const CID_PREFIX: &str = "cid1-";

/// Content-addressed identifier for a post body.
///
/// A `ContentId` is the BLAKE3 hash of the body bytes under a fixed domain
/// prefix. Identical bodies always share one id, so many index rows may
/// point at the same stored blob.
///
/// Rendered as `cid1-<64 hex chars>`; serialized in the same textual form so
/// that digests stay readable in JSON and stable in binary frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Fingerprint a body.
    pub fn for_body(body: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(BODY_DOMAIN);
        hasher.update(body);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a `ContentId` from a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns `true` if `body` hashes to this id.
    pub fn matches(&self, body: &[u8]) -> bool {
        Self::for_body(body) == *self
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded hash without the `cid1-` prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse either the prefixed form (`cid1-…`) or bare hex.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let trimmed = s.trim();
        let hex_part = trimmed.strip_prefix(CID_PREFIX).unwrap_or(trimmed);
        let bytes =
            hex::decode(hex_part).map_err(|e| TypeError::InvalidContentId(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.short_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CID_PREFIX}{}", self.to_hex())
    }
}

impl FromStr for ContentId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
