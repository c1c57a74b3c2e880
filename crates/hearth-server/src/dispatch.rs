use std::sync::Arc;

use hearth_core::envelope::{
    kinds, ChatInbound, Envelope, Namespace, PresenceInbound, SignalingInbound,
};
use hearth_engine::registry::Connection;
use hearth_engine::EngineError;

use crate::server::AppState;

/// Decode one raw frame and route it into the engine. Every failure is
/// answered with an error envelope on the same connection; the connection
/// itself stays open.
pub async fn dispatch_text(state: &AppState, conn: &Arc<Connection>, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(connection_id = %conn.id, error = %e, "unparseable frame");
            conn.send(&Envelope::error(
                conn.channel,
                "BAD_ENVELOPE",
                "frame is not a valid envelope",
            ));
            return;
        }
    };

    // Any well-formed inbound frame counts as liveness.
    conn.touch();

    if envelope.namespace != conn.channel {
        conn.send(&Envelope::error(
            conn.channel,
            "BAD_ENVELOPE",
            format!(
                "envelope namespace {} does not match channel {}",
                envelope.namespace, conn.channel
            ),
        ));
        return;
    }

    if let Err(e) = route(state, conn, &envelope).await {
        tracing::debug!(
            connection_id = %conn.id,
            kind = %envelope.kind,
            error = %e,
            "envelope rejected"
        );
        conn.send(&error_envelope(conn.channel, &e));
    }
}

async fn route(
    state: &AppState,
    conn: &Arc<Connection>,
    envelope: &Envelope,
) -> Result<(), EngineError> {
    match conn.channel {
        Namespace::Presence => match envelope.decode_presence()? {
            PresenceInbound::Heartbeat(p) => state.presence.handle_heartbeat(conn, p),
            PresenceInbound::PresenceUpdate(p) => state.presence.handle_update(conn, p),
        },
        Namespace::Chat => match envelope.decode_chat()? {
            ChatInbound::Message(p) => state.chat.handle_message(conn, p).await,
            ChatInbound::Typing(p) => state.chat.handle_typing(conn, p),
            ChatInbound::ReadReceipt(p) => state.chat.handle_read_receipt(conn, p),
        },
        Namespace::Signaling => match envelope.decode_signaling()? {
            SignalingInbound::Offer(p) => state.calls.handle_offer(conn, p).await,
            SignalingInbound::Answer(p) => state.calls.handle_answer(conn, p),
            SignalingInbound::Candidate(p) => state.calls.handle_candidate(conn, p),
            SignalingInbound::Hangup(p) => state.calls.handle_hangup(conn, p),
        },
    }
}

/// Signaling failures use the dedicated `call_error` kind so call UI can key
/// off it; other channels answer with the generic `error` kind.
fn error_envelope(channel: Namespace, error: &EngineError) -> Envelope {
    match channel {
        Namespace::Signaling => Envelope::new(
            Namespace::Signaling,
            kinds::CALL_ERROR,
            serde_json::json!({
                "code": error.wire_code(),
                "message": error.to_string(),
            }),
        ),
        other => Envelope::error(other, error.wire_code(), error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::app_state;
    use hearth_core::auth::Identity;
    use hearth_core::ids::{OrgId, PairingId, UserId};
    use hearth_core::types::{PairingStatus, Role};
    use hearth_store::pairings::PairingRepo;
    use tokio::sync::mpsc;

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: UserId::new(),
            org_id: OrgId::new(),
            role,
        }
    }

    fn recv_env(rx: &mut mpsc::Receiver<String>) -> Option<Envelope> {
        rx.try_recv()
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn frame(namespace: &str, kind: &str, data: serde_json::Value) -> String {
        serde_json::json!({
            "id": "env_test",
            "type": kind,
            "namespace": namespace,
            "data": data,
            "timestamp": "2026-03-01T12:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn malformed_json_answers_bad_envelope_and_stays_open() {
        let state = app_state();
        let (conn, mut rx) = state.registry.register(&identity(Role::Primary), Namespace::Chat);

        dispatch_text(&state, &conn, "{not json").await;

        let err = recv_env(&mut rx).unwrap();
        assert_eq!(err.kind, "error");
        assert_eq!(err.data["code"], "BAD_ENVELOPE");
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn unknown_kind_answers_bad_envelope() {
        let state = app_state();
        let (conn, mut rx) = state.registry.register(&identity(Role::Primary), Namespace::Chat);

        dispatch_text(&state, &conn, &frame("chat", "poke", serde_json::json!({}))).await;

        let err = recv_env(&mut rx).unwrap();
        assert_eq!(err.data["code"], "BAD_ENVELOPE");
    }

    #[tokio::test]
    async fn namespace_channel_mismatch_rejected() {
        let state = app_state();
        let (conn, mut rx) = state.registry.register(&identity(Role::Primary), Namespace::Chat);

        dispatch_text(
            &state,
            &conn,
            &frame("presence", "heartbeat", serde_json::json!({})),
        )
        .await;

        let err = recv_env(&mut rx).unwrap();
        assert_eq!(err.data["code"], "BAD_ENVELOPE");
    }

    #[tokio::test]
    async fn chat_message_routes_to_relay() {
        let state = app_state();
        let sender = identity(Role::Primary);
        let recipient = identity(Role::Companion);
        let pairing = PairingRepo::new(state.db.clone())
            .create(&sender.user_id, &recipient.user_id, PairingStatus::Active)
            .unwrap();

        let (conn, mut sender_rx) = state.registry.register(&sender, Namespace::Chat);
        let (_peer, mut recipient_rx) = state.registry.register(&recipient, Namespace::Chat);

        dispatch_text(
            &state,
            &conn,
            &frame(
                "chat",
                "message",
                serde_json::json!({ "pairingId": pairing.id, "content": "hi" }),
            ),
        )
        .await;

        assert_eq!(recv_env(&mut recipient_rx).unwrap().kind, "message_received");
        assert_eq!(recv_env(&mut sender_rx).unwrap().kind, "message_sent");
    }

    #[tokio::test]
    async fn signaling_failure_uses_call_error_kind() {
        let state = app_state();
        let (conn, mut rx) = state
            .registry
            .register(&identity(Role::Primary), Namespace::Signaling);

        dispatch_text(
            &state,
            &conn,
            &frame(
                "signaling",
                "call_offer",
                serde_json::json!({
                    "callId": "call-x",
                    "pairingId": PairingId::new(),
                    "sdp": {},
                }),
            ),
        )
        .await;

        let err = recv_env(&mut rx).unwrap();
        assert_eq!(err.kind, "call_error");
        assert_eq!(err.data["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn presence_heartbeat_routes_to_coordinator() {
        let state = app_state();
        let user = identity(Role::Companion);
        let (conn, _rx) = state.registry.register(&user, Namespace::Presence);

        dispatch_text(
            &state,
            &conn,
            &frame("presence", "heartbeat", serde_json::json!({ "status": "away" })),
        )
        .await;

        assert_eq!(
            state.presence.status_of(&user.user_id),
            hearth_core::types::PresenceStatus::Away
        );
    }
}
