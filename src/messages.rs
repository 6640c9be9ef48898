//! # Wire Protocol Messages
//!
//! This module defines all serializable message types used by peerbus.
//! Both channels carry JSON so that any language can speak the protocol.
//!
//! ## Channels
//!
//! | Channel | Transport | Request Type | Response Type |
//! |---------|-----------|--------------|---------------|
//! | Control | TCP, length-prefixed frames | `ControlRequest` | `ControlResponse` |
//! | Data | UDP, one envelope per datagram | `Envelope` | (none, fire-and-forget) |
//!
//! ## Size Limits
//!
//! - `MAX_FRAME_SIZE`: largest control frame body accepted in either direction
//! - `MAX_DATAGRAM_SIZE`: largest encoded envelope; larger payloads are
//!   rejected before sending and dropped on receipt
//!
//! ## Framing
//!
//! A control frame is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. A zero-length frame ends the session.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum control frame body (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum encoded datagram envelope (8 KiB).
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Identities and addresses
// ============================================================================

/// Peer identity. A peer is identified by its UDP listening port.
///
/// Serialized as a JSON number; also accepted as a decimal string, which is
/// how it appears when used as a JSON object key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PeerId(pub u16);

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PeerIdVisitor;

        impl Visitor<'_> for PeerIdVisitor {
            type Value = PeerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a port number")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PeerId, E> {
                u16::try_from(v)
                    .map(PeerId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PeerId, E> {
                u16::try_from(v)
                    .map(PeerId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PeerId, E> {
                v.parse::<u16>()
                    .map(PeerId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(PeerIdVisitor)
    }
}

impl PeerId {
    pub fn port(self) -> u16 {
        self.0
    }
}

impl From<u16> for PeerId {
    fn from(port: u16) -> Self {
        PeerId(port)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a registered peer, encoded on the wire as `[host, port]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl From<(String, u16)> for PeerAddr {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<PeerAddr> for (String, u16) {
    fn from(addr: PeerAddr) -> Self {
        (addr.host, addr.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Control channel (indexing server)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Register {
        peer_id: PeerId,
        peer_port: u16,
    },
    Unregister {
        peer_id: PeerId,
    },
    /// Join the owner list of a topic, creating it if needed.
    AddTopic {
        peer_id: PeerId,
        topic: String,
    },
    /// Create a topic with a sole owner; rejected if it already exists.
    CreateTopic {
        topic: String,
        peer_id: PeerId,
    },
    DeleteTopic {
        peer_id: PeerId,
        topic: String,
    },
    QueryTopic {
        topic: String,
    },
    GetPeers,
    GetTopics,
    /// Any action string this server does not know.
    #[serde(other)]
    Unrecognized,
}

impl ControlRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::Register { .. } => "register",
            ControlRequest::Unregister { .. } => "unregister",
            ControlRequest::AddTopic { .. } => "add_topic",
            ControlRequest::CreateTopic { .. } => "create_topic",
            ControlRequest::DeleteTopic { .. } => "delete_topic",
            ControlRequest::QueryTopic { .. } => "query_topic",
            ControlRequest::GetPeers => "get_peers",
            ControlRequest::GetTopics => "get_topics",
            ControlRequest::Unrecognized => "unrecognized",
        }
    }
}

/// Machine-readable reason attached to error responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    UnknownPeer,
    InvalidAction,
    NoPeers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Success(ResponseBody),
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Payload of a successful response. Exactly one shape per action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Located {
        peer_id: PeerId,
        peer_info: PeerAddr,
    },
    Peers {
        peers: BTreeMap<PeerId, PeerAddr>,
    },
    Topics {
        topics: Vec<String>,
    },
    Message {
        message: String,
    },
}

impl ControlResponse {
    pub fn message(message: impl Into<String>) -> Self {
        ControlResponse::Success(ResponseBody::Message { message: message.into() })
    }

    pub fn error(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        ControlResponse::Error { message: message.into(), code }
    }

    pub fn invalid_action() -> Self {
        Self::error("Invalid action", Some(ErrorCode::InvalidAction))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ControlResponse::Success(_))
    }
}

// ============================================================================
// Data channel (peer datagrams)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Publish {
        topic: String,
        message: String,
    },
    Subscribe {
        topic: String,
    },
    Ack {
        topic: String,
    },
    /// Any `type` this node does not understand.
    #[serde(other)]
    Unrecognized,
}

impl Envelope {
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Publish { topic: topic.into(), message: message.into() }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Envelope::Subscribe { topic: topic.into() }
    }

    pub fn ack(topic: impl Into<String>) -> Self {
        Envelope::Ack { topic: topic.into() }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Envelope::Publish { topic, .. } | Envelope::Subscribe { topic } | Envelope::Ack { topic } => {
                Some(topic)
            }
            Envelope::Unrecognized => None,
        }
    }
}

/// Encode an envelope for a single datagram, enforcing `MAX_DATAGRAM_SIZE`.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::TooLarge { size: bytes.len(), max: MAX_DATAGRAM_SIZE });
    }
    Ok(bytes)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::TooLarge { size: bytes.len(), max: MAX_DATAGRAM_SIZE });
    }
    Ok(serde_json::from_slice(bytes)?)
}

// ============================================================================
// Control framing
// ============================================================================

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before a new
/// frame started or sent an empty frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge { size: body.len(), max: MAX_FRAME_SIZE });
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_action_tag() {
        let req: ControlRequest =
            serde_json::from_value(json!({"action": "register", "peer_id": 7001, "peer_port": 7001})).unwrap();
        assert_eq!(req, ControlRequest::Register { peer_id: PeerId(7001), peer_port: 7001 });

        let encoded = serde_json::to_value(ControlRequest::QueryTopic { topic: "weather".into() }).unwrap();
        assert_eq!(encoded, json!({"action": "query_topic", "topic": "weather"}));

        let encoded = serde_json::to_value(ControlRequest::GetPeers).unwrap();
        assert_eq!(encoded, json!({"action": "get_peers"}));
    }

    #[test]
    fn unknown_action_decodes_as_unrecognized() {
        let req: ControlRequest = serde_json::from_value(json!({"action": "get_topic", "topic": "x"})).unwrap();
        assert_eq!(req, ControlRequest::Unrecognized);
    }

    #[test]
    fn known_action_missing_fields_is_decode_error() {
        let result = serde_json::from_value::<ControlRequest>(json!({"action": "unregister"}));
        assert!(result.is_err());
    }

    #[test]
    fn response_shapes_match_protocol() {
        let located = ControlResponse::Success(ResponseBody::Located {
            peer_id: PeerId(7001),
            peer_info: PeerAddr::new("127.0.0.1", 7001),
        });
        assert_eq!(
            serde_json::to_value(&located).unwrap(),
            json!({"status": "success", "peer_id": 7001, "peer_info": ["127.0.0.1", 7001]})
        );

        let mut peers = BTreeMap::new();
        peers.insert(PeerId(7001), PeerAddr::new("127.0.0.1", 7001));
        let listed = ControlResponse::Success(ResponseBody::Peers { peers });
        assert_eq!(
            serde_json::to_value(&listed).unwrap(),
            json!({"status": "success", "peers": {"7001": ["127.0.0.1", 7001]}})
        );

        let err = ControlResponse::error("No peers registered", Some(ErrorCode::NoPeers));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value, json!({"status": "error", "message": "No peers registered", "code": "no_peers"}));
        assert!(value.get("peers").is_none());
    }

    #[test]
    fn response_decodes_each_body() {
        let raw = br#"{"status":"success","peers":{"7001":["127.0.0.1",7001]}}"#;
        match serde_json::from_slice::<ControlResponse>(raw).unwrap() {
            ControlResponse::Success(ResponseBody::Peers { peers }) => {
                assert_eq!(peers.get(&PeerId(7001)), Some(&PeerAddr::new("127.0.0.1", 7001)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let raw = br#"{"status":"success","topics":["a","b"]}"#;
        assert_eq!(
            serde_json::from_slice::<ControlResponse>(raw).unwrap(),
            ControlResponse::Success(ResponseBody::Topics { topics: vec!["a".into(), "b".into()] })
        );

        // Responses from servers that predate error codes still decode.
        let raw = br#"{"status":"error","message":"Invalid action"}"#;
        assert_eq!(
            serde_json::from_slice::<ControlResponse>(raw).unwrap(),
            ControlResponse::Error { message: "Invalid action".into(), code: None }
        );
    }

    #[test]
    fn peer_id_accepts_numeric_strings() {
        assert_eq!(serde_json::from_value::<PeerId>(json!(7001)).unwrap(), PeerId(7001));
        assert_eq!(serde_json::from_value::<PeerId>(json!("7001")).unwrap(), PeerId(7001));
        assert!(serde_json::from_value::<PeerId>(json!(70000)).is_err());
        assert!(serde_json::from_value::<PeerId>(json!("abc")).is_err());
    }

    #[test]
    fn envelope_uses_type_tag() {
        let env = Envelope::publish("weather", "rain");
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"type": "publish", "topic": "weather", "message": "rain"})
        );
        let decoded = decode_envelope(br#"{"type":"subscribe","topic":"weather"}"#).unwrap();
        assert_eq!(decoded, Envelope::subscribe("weather"));
        let decoded = decode_envelope(br#"{"type":"hello","topic":"weather"}"#).unwrap();
        assert_eq!(decoded, Envelope::Unrecognized);
        assert_eq!(decoded.topic(), None);
    }

    #[test]
    fn malformed_envelope_is_decode_error() {
        assert!(matches!(decode_envelope(b"not json"), Err(WireError::Decode(_))));
    }

    #[test]
    fn oversized_envelope_rejected() {
        let env = Envelope::publish("big", "x".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(encode_envelope(&env), Err(WireError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn frame_roundtrip_and_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &ControlRequest::GetTopics).await.unwrap();
        drop(a);

        let body = read_frame(&mut b).await.unwrap().expect("frame");
        let req: ControlRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(req, ControlRequest::GetTopics);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(WireError::TooLarge { .. })));
    }
}
