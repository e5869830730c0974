use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{AgoraMessage, MAX_MESSAGE_SIZE};

/// Codec for encoding/decoding replica messages.
pub struct AgoraCodec;

/// Length prefix plus type tag.
const FRAME_HEADER: usize = 5;

impl AgoraCodec {
    /// Encode a message with framing: [4 bytes len][1 byte tag][payload]
    pub fn encode(msg: &AgoraMessage) -> ProtocolResult<Vec<u8>> {
        let payload = Self::encode_payload(msg)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(FRAME_HEADER + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(AgoraMessage, usize)> {
        if data.len() < FRAME_HEADER {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len < 1 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if len - 1 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len - 1,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let tag = data[4];
        let msg = Self::decode_payload(&data[FRAME_HEADER..total])?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::InvalidMessageType(tag));
        }
        Ok((msg, total))
    }

    /// Decode every complete frame in `data`. Returns the messages and the
    /// number of bytes they occupied; a trailing partial frame is left.
    pub fn decode_all(data: &[u8]) -> ProtocolResult<(Vec<AgoraMessage>, usize)> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while data.len() - offset >= FRAME_HEADER {
            let rest = &data[offset..];
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > 0 && rest.len() < 4 + len {
                break;
            }
            let (msg, used) = Self::decode(rest)?;
            messages.push(msg);
            offset += used;
        }
        Ok((messages, offset))
    }

    /// Encode payload only (no framing).
    pub fn encode_payload(msg: &AgoraMessage) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode payload only (no framing).
    pub fn decode_payload(data: &[u8]) -> ProtocolResult<AgoraMessage> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestRecord;
    use crate::message::PROTOCOL_VERSION;
    use agora_types::{AuthorKey, ContentId, EntityId, EntityKind, OpId, OpKind, PeerId};

    fn digest() -> DigestRecord {
        DigestRecord {
            id: EntityId::new("p1"),
            entity: EntityKind::Post,
            op_id: OpId::new("p1:alice:3:update"),
            op_type: OpKind::Update,
            pubkey: AuthorKey::new("alice"),
            title: Some("title".into()),
            content_fingerprint: Some(ContentId::for_body(b"hello")),
            size_bytes: 5,
            lamport: 3,
            timestamp: 1_700_000_000,
            deleted: false,
            post_id: None,
            parent_id: None,
            body: None,
        }
    }

    macro_rules! roundtrip_test {
        ($name:ident, $msg:expr) => {
            #[test]
            fn $name() {
                let msg = $msg;
                let encoded = AgoraCodec::encode(&msg).unwrap();
                let (decoded, consumed) = AgoraCodec::decode(&encoded).unwrap();
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
        };
    }

    roundtrip_test!(sync_request_roundtrip, AgoraMessage::SyncRequest {
        request_id: "r-1".into(),
        requester: PeerId::new("node-a"),
        since_timestamp: 42,
        limit: 200,
    });

    roundtrip_test!(sync_response_roundtrip, AgoraMessage::SyncResponse {
        request_id: "r-1".into(),
        responder: PeerId::new("node-b"),
        digests: vec![digest(), DigestRecord { deleted: true, ..digest() }],
    });

    roundtrip_test!(content_request_roundtrip, AgoraMessage::ContentRequest {
        request_id: "r-2".into(),
        requester: PeerId::new("node-a"),
        cid: ContentId::for_body(b"hello"),
    });

    roundtrip_test!(content_absent_roundtrip, AgoraMessage::ContentResponse {
        request_id: "r-2".into(),
        cid: ContentId::for_body(b"hello"),
        body: None,
    });

    roundtrip_test!(publish_roundtrip, AgoraMessage::Publish {
        digest: digest(),
        body: Some(b"hello".to_vec()),
    });

    roundtrip_test!(error_roundtrip, AgoraMessage::Error {
        code: 404,
        message: "not found".into(),
    });

    #[test]
    fn type_tags_unique() {
        let msgs = vec![
            AgoraMessage::SyncRequest {
                request_id: String::new(),
                requester: PeerId::new("a"),
                since_timestamp: 0,
                limit: 0,
            },
            AgoraMessage::SyncResponse {
                request_id: String::new(),
                responder: PeerId::new("b"),
                digests: vec![],
            },
            AgoraMessage::ContentRequest {
                request_id: String::new(),
                requester: PeerId::new("a"),
                cid: ContentId::for_body(b""),
            },
            AgoraMessage::ContentResponse {
                request_id: String::new(),
                cid: ContentId::for_body(b""),
                body: None,
            },
            AgoraMessage::Publish { digest: digest(), body: None },
            AgoraMessage::Error { code: 0, message: String::new() },
        ];
        let mut tags: Vec<u8> = msgs.iter().map(|m| m.type_tag()).collect();
        let len = tags.len();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), len, "type tags should be unique");
        assert_eq!(msgs[4].type_name(), "Publish");
        assert_eq!(msgs[0].request_id(), Some(""));
        assert_eq!(msgs[4].request_id(), None);
    }

    #[test]
    fn decode_truncated() {
        let err = AgoraCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 0];
        let err = AgoraCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_rejects_mismatched_tag() {
        let mut encoded = AgoraCodec::encode(&AgoraMessage::Error {
            code: 1,
            message: "x".into(),
        })
        .unwrap();
        encoded[4] = 3;
        assert!(matches!(
            AgoraCodec::decode(&encoded),
            Err(ProtocolError::InvalidMessageType(3))
        ));
    }

    #[test]
    fn decode_all_leaves_partial_tail() {
        let first = AgoraCodec::encode(&AgoraMessage::Error { code: 1, message: "a".into() }).unwrap();
        let second = AgoraCodec::encode(&AgoraMessage::Publish { digest: digest(), body: None }).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&second[..7]);

        let (messages, used) = AgoraCodec::decode_all(&stream).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(used, first.len() + second.len());
    }

    #[test]
    fn payload_roundtrip() {
        let msg = AgoraMessage::Error {
            code: PROTOCOL_VERSION,
            message: "test".into(),
        };
        let bytes = AgoraCodec::encode_payload(&msg).unwrap();
        assert_eq!(AgoraCodec::decode_payload(&bytes).unwrap(), msg);
    }
}
