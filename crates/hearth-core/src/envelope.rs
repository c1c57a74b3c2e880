use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, EnvelopeId, MessageId, PairingId, UserId};
use crate::types::{EndReason, MediaType, MessageKind, PresenceStatus};

/// Logical channel an envelope travels on. Doubles as the channel tag on a
/// live connection: one authenticated WebSocket per namespace per user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Presence,
    Chat,
    Signaling,
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Presence => write!(f, "presence"),
            Self::Chat => write!(f, "chat"),
            Self::Signaling => write!(f, "signaling"),
        }
    }
}

impl std::str::FromStr for Namespace {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "presence" => Ok(Self::Presence),
            "chat" => Ok(Self::Chat),
            "signaling" => Ok(Self::Signaling),
            other => Err(format!("unknown namespace: {other}")),
        }
    }
}

/// Uniform wire wrapper used on all three channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: EnvelopeId,
    #[serde(rename = "type")]
    pub kind: String,
    pub namespace: Namespace,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Envelope {
    /// Server-originated envelope with a fresh id and timestamp.
    pub fn new(namespace: Namespace, kind: &str, data: serde_json::Value) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind: kind.to_string(),
            namespace,
            data,
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Error envelope answered on the same channel the failure occurred on.
    pub fn error(namespace: Namespace, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            namespace,
            kinds::ERROR,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn decode_presence(&self) -> Result<PresenceInbound, EnvelopeError> {
        match self.kind.as_str() {
            kinds::HEARTBEAT => Ok(PresenceInbound::Heartbeat(self.payload()?)),
            kinds::PRESENCE_UPDATE => Ok(PresenceInbound::PresenceUpdate(self.payload()?)),
            other => Err(self.unknown(other)),
        }
    }

    pub fn decode_chat(&self) -> Result<ChatInbound, EnvelopeError> {
        match self.kind.as_str() {
            kinds::MESSAGE => Ok(ChatInbound::Message(self.payload()?)),
            kinds::TYPING => Ok(ChatInbound::Typing(self.payload()?)),
            kinds::READ_RECEIPT => Ok(ChatInbound::ReadReceipt(self.payload()?)),
            other => Err(self.unknown(other)),
        }
    }

    pub fn decode_signaling(&self) -> Result<SignalingInbound, EnvelopeError> {
        match self.kind.as_str() {
            kinds::CALL_OFFER => Ok(SignalingInbound::Offer(self.payload()?)),
            kinds::CALL_ANSWER => Ok(SignalingInbound::Answer(self.payload()?)),
            kinds::CALL_CANDIDATE => Ok(SignalingInbound::Candidate(self.payload()?)),
            kinds::CALL_HANGUP => Ok(SignalingInbound::Hangup(self.payload()?)),
            other => Err(self.unknown(other)),
        }
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| EnvelopeError::BadPayload(format!("{}: {e}", self.kind)))
    }

    fn unknown(&self, kind: &str) -> EnvelopeError {
        EnvelopeError::UnknownType {
            namespace: self.namespace,
            kind: kind.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown {namespace} message type: {kind}")]
    UnknownType { namespace: Namespace, kind: String },

    #[error("malformed payload for {0}")]
    BadPayload(String),
}

/// Wire message type tags, grouped by namespace.
pub mod kinds {
    // presence
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PRESENCE_UPDATE: &str = "presence_update";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PARTNER_PRESENCE_UPDATE: &str = "partner_presence_update";

    // chat
    pub const MESSAGE: &str = "message";
    pub const TYPING: &str = "typing";
    pub const READ_RECEIPT: &str = "read_receipt";
    pub const MESSAGE_RECEIVED: &str = "message_received";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const TYPING_INDICATOR: &str = "typing_indicator";
    pub const READ_RECEIPT_RECEIVED: &str = "read_receipt_received";

    // signaling
    pub const CALL_OFFER: &str = "call_offer";
    pub const CALL_ANSWER: &str = "call_answer";
    pub const CALL_CANDIDATE: &str = "call_candidate";
    pub const CALL_HANGUP: &str = "call_hangup";
    pub const CALL_RINGING: &str = "call_ringing";
    pub const CALL_CONNECTED: &str = "call_connected";
    pub const CALL_OFFER_RECEIVED: &str = "call_offer_received";
    pub const CALL_ANSWER_RECEIVED: &str = "call_answer_received";
    pub const CALL_CANDIDATE_RECEIVED: &str = "call_candidate_received";
    pub const CALL_ENDED: &str = "call_ended";
    pub const CALL_ERROR: &str = "call_error";

    // any namespace
    pub const ERROR: &str = "error";
}

// ── Inbound catalogs: closed enums, exhaustively matched at dispatch ──

#[derive(Clone, Debug)]
pub enum PresenceInbound {
    Heartbeat(HeartbeatPayload),
    PresenceUpdate(PresenceUpdatePayload),
}

#[derive(Clone, Debug)]
pub enum ChatInbound {
    Message(SendMessagePayload),
    Typing(TypingPayload),
    ReadReceipt(ReadReceiptPayload),
}

#[derive(Clone, Debug)]
pub enum SignalingInbound {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Candidate(CandidatePayload),
    Hangup(HangupPayload),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub status: Option<PresenceStatus>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub pairing_id: PairingId,
    pub content: String,
    #[serde(default = "default_message_kind", rename = "messageType")]
    pub kind: MessageKind,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub pairing_id: PairingId,
    pub is_typing: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub message_id: MessageId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub call_id: CallId,
    pub pairing_id: PairingId,
    #[serde(default = "default_media_type")]
    pub media_type: MediaType,
    /// Opaque SDP blob; the engine relays it, never inspects it.
    pub sdp: serde_json::Value,
}

fn default_media_type() -> MediaType {
    MediaType::Video
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub call_id: CallId,
    pub sdp: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub call_id: CallId,
    pub candidate: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupPayload {
    pub call_id: CallId,
    #[serde(default)]
    pub reason: Option<EndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(namespace: Namespace, kind: &str, data: serde_json::Value) -> Envelope {
        serde_json::from_value(serde_json::json!({
            "id": "env_1",
            "type": kind,
            "namespace": namespace,
            "data": data,
            "timestamp": "2026-03-01T12:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(Namespace::Chat, kinds::MESSAGE_SENT, serde_json::json!({}))
            .with_user(UserId::from_raw("user_abc"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "message_sent");
        assert_eq!(json["namespace"], "chat");
        assert_eq!(json["userId"], "user_abc");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn decode_heartbeat_with_status() {
        let env = inbound(
            Namespace::Presence,
            "heartbeat",
            serde_json::json!({"status": "away"}),
        );
        match env.decode_presence().unwrap() {
            PresenceInbound::Heartbeat(p) => assert_eq!(p.status, Some(PresenceStatus::Away)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_heartbeat_without_status() {
        let env = inbound(Namespace::Presence, "heartbeat", serde_json::json!({}));
        match env.decode_presence().unwrap() {
            PresenceInbound::Heartbeat(p) => assert!(p.status.is_none()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_chat_message_camel_case() {
        let env = inbound(
            Namespace::Chat,
            "message",
            serde_json::json!({
                "pairingId": "pair_1",
                "content": "dinner at 6?",
                "messageType": "quick_text",
                "correlationId": "local-17",
            }),
        );
        match env.decode_chat().unwrap() {
            ChatInbound::Message(m) => {
                assert_eq!(m.pairing_id.as_str(), "pair_1");
                assert_eq!(m.kind, MessageKind::QuickText);
                assert_eq!(m.correlation_id.as_deref(), Some("local-17"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn message_type_defaults_to_text() {
        let env = inbound(
            Namespace::Chat,
            "message",
            serde_json::json!({"pairingId": "pair_1", "content": "hi"}),
        );
        match env.decode_chat().unwrap() {
            ChatInbound::Message(m) => assert_eq!(m.kind, MessageKind::Text),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_offer() {
        let env = inbound(
            Namespace::Signaling,
            "call_offer",
            serde_json::json!({
                "callId": "client-call-1",
                "pairingId": "pair_1",
                "mediaType": "voice",
                "sdp": {"type": "offer", "sdp": "v=0..."},
            }),
        );
        match env.decode_signaling().unwrap() {
            SignalingInbound::Offer(o) => {
                assert_eq!(o.call_id.as_str(), "client-call-1");
                assert_eq!(o.media_type, MediaType::Voice);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let env = inbound(Namespace::Chat, "poke", serde_json::json!({}));
        match env.decode_chat() {
            Err(EnvelopeError::UnknownType { kind, .. }) => assert_eq!(kind, "poke"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let env = inbound(Namespace::Chat, "message", serde_json::json!({"content": 5}));
        assert!(matches!(
            env.decode_chat(),
            Err(EnvelopeError::BadPayload(_))
        ));
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let env = Envelope::error(Namespace::Signaling, "BUSY", "callee is on another call");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "BUSY");
        assert_eq!(json["data"]["message"], "callee is on another call");
    }
}
