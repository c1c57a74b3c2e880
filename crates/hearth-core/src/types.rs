use serde::{Deserialize, Serialize};

/// Role a user plays within an organization's pairing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Companion,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Companion => write!(f, "companion"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "companion" => Ok(Self::Companion),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Reachability status propagated to paired counterparts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for PresenceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "away" => Ok(Self::Away),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown presence status: {other}")),
        }
    }
}

/// Lifecycle of a pairing. Only `Active` pairings authorize relay/signaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    Active,
    Paused,
    Revoked,
}

impl std::fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for PairingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "revoked" => Ok(Self::Revoked),
            other => Err(format!("unknown pairing status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    QuickText,
    System,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::QuickText => write!(f, "quick_text"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "quick_text" => Ok(Self::QuickText),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Voice,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Voice => write!(f, "voice"),
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "voice" => Ok(Self::Voice),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

/// Call state machine states. Transitions are driven exclusively by the
/// signaling engine; `Ended` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Connected,
    Ended,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiated => write!(f, "initiated"),
            Self::Ringing => write!(f, "ringing"),
            Self::Connected => write!(f, "connected"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "ringing" => Ok(Self::Ringing),
            "connected" => Ok(Self::Connected),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// Why a call reached `Ended`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Timeout,
    Busy,
    Rejected,
    ConnectionLost,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hangup => write!(f, "hangup"),
            Self::Timeout => write!(f, "timeout"),
            Self::Busy => write!(f, "busy"),
            Self::Rejected => write!(f, "rejected"),
            Self::ConnectionLost => write!(f, "connection_lost"),
        }
    }
}

impl std::str::FromStr for EndReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hangup" => Ok(Self::Hangup),
            "timeout" => Ok(Self::Timeout),
            "busy" => Ok(Self::Busy),
            "rejected" => Ok(Self::Rejected),
            "connection_lost" => Ok(Self::ConnectionLost),
            other => Err(format!("unknown end reason: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_from_str_roundtrip() {
        for s in [
            PresenceStatus::Online,
            PresenceStatus::Away,
            PresenceStatus::Busy,
            PresenceStatus::Offline,
        ] {
            let parsed: PresenceStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn end_reason_serializes_snake_case() {
        let json = serde_json::to_string(&EndReason::ConnectionLost).unwrap();
        assert_eq!(json, "\"connection_lost\"");
    }

    #[test]
    fn quick_text_wire_form() {
        let json = serde_json::to_string(&MessageKind::QuickText).unwrap();
        assert_eq!(json, "\"quick_text\"");
        let parsed: MessageKind = "quick_text".parse().unwrap();
        assert_eq!(parsed, MessageKind::QuickText);
    }

    #[test]
    fn unknown_values_rejected() {
        assert!("superuser".parse::<Role>().is_err());
        assert!("idle".parse::<PresenceStatus>().is_err());
        assert!("dropped".parse::<EndReason>().is_err());
    }
}
