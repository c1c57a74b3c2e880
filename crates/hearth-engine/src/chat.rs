use std::sync::Arc;

use dashmap::DashSet;
use tracing::instrument;

use hearth_core::envelope::{
    kinds, Envelope, Namespace, ReadReceiptPayload, SendMessagePayload, TypingPayload,
};
use hearth_core::ids::{PairingId, UserId};
use hearth_core::types::PairingStatus;
use hearth_store::messages::MessageRepo;
use hearth_store::pairings::{Pairing, PairingRepo};
use hearth_store::Database;

use crate::error::EngineError;
use crate::presence::PresenceCoordinator;
use crate::push::PushNotifier;
use crate::registry::{Connection, ConnectionRegistry};

/// Relays chat messages, typing indicators, and read receipts between the
/// two members of a pairing. Messages are persisted before any delivery.
pub struct ChatRelay {
    registry: Arc<ConnectionRegistry>,
    messages: MessageRepo,
    pairings: PairingRepo,
    presence: Arc<PresenceCoordinator>,
    push: Arc<dyn PushNotifier>,
    /// (sender, pairing) pairs with an outstanding typing=true indicator.
    typing: DashSet<(UserId, PairingId)>,
}

impl ChatRelay {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        db: Database,
        presence: Arc<PresenceCoordinator>,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            registry,
            messages: MessageRepo::new(db.clone()),
            pairings: PairingRepo::new(db),
            presence,
            push,
            typing: DashSet::new(),
        }
    }

    /// Persist → deliver to recipient → confirm to sender, in that order, so
    /// a client never sees a confirmation for a message the store might not
    /// hold.
    #[instrument(skip(self, conn, payload), fields(user_id = %conn.user_id, pairing_id = %payload.pairing_id))]
    pub async fn handle_message(
        &self,
        conn: &Connection,
        payload: SendMessagePayload,
    ) -> Result<(), EngineError> {
        let pairing = self.active_pairing(&payload.pairing_id, &conn.user_id)?;
        let recipient = pairing
            .other_member(&conn.user_id)
            .expect("membership checked above")
            .clone();

        let persisted = self.messages.create(
            &pairing.id,
            &conn.user_id,
            &payload.content,
            payload.kind,
        )?;

        let delivery = Envelope::new(
            Namespace::Chat,
            kinds::MESSAGE_RECEIVED,
            serde_json::json!({ "message": &persisted }),
        )
        .with_user(conn.user_id.clone());
        self.registry.broadcast_to_user(&recipient, &delivery, None);

        let confirmation = Envelope::new(
            Namespace::Chat,
            kinds::MESSAGE_SENT,
            serde_json::json!({
                "message": &persisted,
                "correlationId": payload.correlation_id,
            }),
        );
        conn.send(&confirmation);

        // A delivered message supersedes any outstanding typing indicator.
        if self
            .typing
            .remove(&(conn.user_id.clone(), pairing.id.clone()))
            .is_some()
        {
            self.forward_typing(&conn.user_id, &pairing.id, &recipient, false);
        }

        if !self.registry.has_connections(&recipient) || self.presence.is_stale(&recipient) {
            let push = Arc::clone(&self.push);
            let payload = serde_json::json!({
                "kind": "message",
                "pairingId": &pairing.id,
                "messageId": &persisted.id,
                "senderId": &conn.user_id,
            });
            // Fire-and-forget; never a precondition for send success.
            tokio::spawn(async move {
                push.notify_if_offline(&recipient, payload).await;
            });
        }

        Ok(())
    }

    /// Ephemeral, never persisted. Membership is the only authorization;
    /// a paused pairing may still show typing state.
    pub fn handle_typing(
        &self,
        conn: &Connection,
        payload: TypingPayload,
    ) -> Result<(), EngineError> {
        let pairing = self.member_pairing(&payload.pairing_id, &conn.user_id)?;
        let recipient = pairing
            .other_member(&conn.user_id)
            .expect("membership checked above")
            .clone();

        let key = (conn.user_id.clone(), pairing.id.clone());
        if payload.is_typing {
            self.typing.insert(key);
        } else {
            self.typing.remove(&key);
        }

        self.forward_typing(&conn.user_id, &pairing.id, &recipient, payload.is_typing);
        Ok(())
    }

    /// Stamp read-at and forward the confirmation to the message's sender
    /// (who is not necessarily the caller's counterpart on this connection).
    #[instrument(skip(self, conn, payload), fields(user_id = %conn.user_id, message_id = %payload.message_id))]
    pub fn handle_read_receipt(
        &self,
        conn: &Connection,
        payload: ReadReceiptPayload,
    ) -> Result<(), EngineError> {
        let message = self
            .messages
            .get(&payload.message_id)?
            .ok_or_else(|| EngineError::NotFound(format!("message {}", payload.message_id)))?;

        let pairing = self
            .pairings
            .get(&message.pairing_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pairing {}", message.pairing_id)))?;
        if !pairing.is_member(&conn.user_id) {
            return Err(EngineError::Forbidden(
                "read receipts are limited to pairing members".into(),
            ));
        }

        let updated = self.messages.mark_read(&message.id)?;

        if message.sender_id != conn.user_id {
            let envelope = Envelope::new(
                Namespace::Chat,
                kinds::READ_RECEIPT_RECEIVED,
                serde_json::json!({
                    "messageId": updated.id,
                    "readAt": updated.read_at,
                }),
            )
            .with_user(conn.user_id.clone());
            self.registry
                .broadcast_to_user(&message.sender_id, &envelope, None);
        }
        Ok(())
    }

    fn forward_typing(
        &self,
        sender: &UserId,
        pairing_id: &PairingId,
        recipient: &UserId,
        is_typing: bool,
    ) {
        let envelope = Envelope::new(
            Namespace::Chat,
            kinds::TYPING_INDICATOR,
            serde_json::json!({
                "pairingId": pairing_id,
                "userId": sender,
                "isTyping": is_typing,
            }),
        )
        .with_user(sender.clone());
        self.registry.broadcast_to_user(recipient, &envelope, None);
    }

    /// Pairing must exist, be active, and include the caller.
    fn active_pairing(
        &self,
        pairing_id: &PairingId,
        user_id: &UserId,
    ) -> Result<Pairing, EngineError> {
        let pairing = self.member_pairing(pairing_id, user_id)?;
        if pairing.status != PairingStatus::Active {
            return Err(EngineError::Forbidden(format!(
                "pairing is {}, not active",
                pairing.status
            )));
        }
        Ok(pairing)
    }

    fn member_pairing(
        &self,
        pairing_id: &PairingId,
        user_id: &UserId,
    ) -> Result<Pairing, EngineError> {
        let pairing = self
            .pairings
            .get(pairing_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pairing {pairing_id}")))?;
        if !pairing.is_member(user_id) {
            return Err(EngineError::Forbidden(
                "sender is not a member of this pairing".into(),
            ));
        }
        Ok(pairing)
    }
}
