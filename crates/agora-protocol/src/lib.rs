//! Wire protocol for Agora replicas.
//!
//! Defines the messages peers exchange for anti-entropy, body retrieval and
//! real-time publishing, the [`DigestRecord`] shared by posts and comments,
//! and the length-framed binary codec that carries them.

pub mod codec;
pub mod digest;
pub mod endpoint;
pub mod error;
pub mod message;

pub use codec::AgoraCodec;
pub use digest::DigestRecord;
pub use endpoint::{endpoints, HealthResponse};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{AgoraMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
