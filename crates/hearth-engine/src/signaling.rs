use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::instrument;

use hearth_core::envelope::{
    kinds, AnswerPayload, CandidatePayload, Envelope, HangupPayload, Namespace, OfferPayload,
};
use hearth_core::ids::{CallId, PairingId, UserId};
use hearth_core::types::{CallStatus, EndReason, MediaType, PairingStatus};
use hearth_store::calls::{CallRepo, CallRow};
use hearth_store::pairings::PairingRepo;
use hearth_store::Database;

use crate::error::EngineError;
use crate::push::PushNotifier;
use crate::registry::{Connection, ConnectionRegistry};

/// How long an unanswered call rings before it is ended with `timeout`.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct CallConfig {
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
        }
    }
}

/// In-memory state of one live call. The durable `calls` row is an audit
/// mirror; this session is the authority while the call is alive.
#[derive(Clone, Debug)]
struct CallSession {
    id: CallId,
    // Server key of the audit row; 0 until the insert returns.
    row_id: i64,
    pairing_id: PairingId,
    caller_id: UserId,
    callee_id: UserId,
    media_type: MediaType,
    status: CallStatus,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn to_row(&self, reason: Option<EndReason>, ended_at: Option<DateTime<Utc>>) -> CallRow {
        let duration_secs = match (self.connected_at, ended_at) {
            (Some(connected), Some(ended)) => (ended - connected).num_seconds().max(0),
            _ => 0,
        };
        CallRow {
            row_id: self.row_id,
            call_id: self.id.clone(),
            pairing_id: self.pairing_id.clone(),
            caller_id: self.caller_id.clone(),
            callee_id: self.callee_id.clone(),
            media_type: self.media_type,
            status: if ended_at.is_some() {
                CallStatus::Ended
            } else {
                self.status
            },
            reason,
            started_at: self.started_at.to_rfc3339(),
            connected_at: self.connected_at.map(|t| t.to_rfc3339()),
            ended_at: ended_at.map(|t| t.to_rfc3339()),
            duration_secs,
        }
    }
}

/// Both indexes live under one mutex so busy-check plus reservation is a
/// single atomic step.
#[derive(Default)]
struct ActiveCalls {
    by_call: HashMap<CallId, CallSession>,
    by_user: HashMap<UserId, CallId>,
}

/// Call lifecycle: initiated, ringing, connected, ended. Exactly one call per
/// user at a time, and every path out of a call funnels through
/// [`CallSignalingEngine::end_session`].
pub struct CallSignalingEngine {
    registry: Arc<ConnectionRegistry>,
    calls: CallRepo,
    pairings: PairingRepo,
    push: Arc<dyn PushNotifier>,
    active: Arc<Mutex<ActiveCalls>>,
    db: Database,
    config: CallConfig,
}

impl CallSignalingEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        db: Database,
        push: Arc<dyn PushNotifier>,
        config: CallConfig,
    ) -> Self {
        Self {
            registry,
            calls: CallRepo::new(db.clone()),
            pairings: PairingRepo::new(db.clone()),
            push,
            active: Arc::new(Mutex::new(ActiveCalls::default())),
            db,
            config,
        }
    }

    #[instrument(skip(self, conn, payload), fields(user_id = %conn.user_id, call_id = %payload.call_id))]
    pub async fn handle_offer(
        &self,
        conn: &Connection,
        payload: OfferPayload,
    ) -> Result<(), EngineError> {
        let pairing = self
            .pairings
            .get(&payload.pairing_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pairing {}", payload.pairing_id)))?;
        if !pairing.is_member(&conn.user_id) {
            return Err(EngineError::Forbidden(
                "caller is not a member of this pairing".into(),
            ));
        }
        if pairing.status != PairingStatus::Active {
            return Err(EngineError::Forbidden(format!(
                "pairing is {}, not active",
                pairing.status
            )));
        }
        let callee = pairing
            .other_member(&conn.user_id)
            .expect("membership checked above")
            .clone();

        let session = CallSession {
            id: payload.call_id.clone(),
            row_id: 0,
            pairing_id: pairing.id.clone(),
            caller_id: conn.user_id.clone(),
            callee_id: callee.clone(),
            media_type: payload.media_type,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            connected_at: None,
        };

        {
            let mut active = self.active.lock();
            if active.by_user.contains_key(&conn.user_id) {
                return Err(EngineError::Busy("caller already in a call".into()));
            }
            if active.by_user.contains_key(&callee) {
                return Err(EngineError::Busy("callee is in another call".into()));
            }
            if active.by_call.contains_key(&payload.call_id) {
                return Err(EngineError::Busy("call id already in use".into()));
            }
            active
                .by_user
                .insert(conn.user_id.clone(), payload.call_id.clone());
            active.by_user.insert(callee.clone(), payload.call_id.clone());
            active
                .by_call
                .insert(payload.call_id.clone(), session.clone());
        }

        // Reservation before persistence; roll it back if the insert fails.
        let row_id = match self.calls.create(&session.to_row(None, None)) {
            Ok(row_id) => row_id,
            Err(e) => {
                self.drop_session(&payload.call_id);
                return Err(e.into());
            }
        };
        {
            let mut active = self.active.lock();
            if let Some(s) = active.by_call.get_mut(&payload.call_id) {
                s.row_id = row_id;
            }
        }

        let offer = Envelope::new(
            Namespace::Signaling,
            kinds::CALL_OFFER_RECEIVED,
            serde_json::json!({
                "callId": &session.id,
                "pairingId": &session.pairing_id,
                "mediaType": session.media_type,
                "sdp": payload.sdp,
            }),
        )
        .with_user(conn.user_id.clone());
        self.registry.broadcast_to_user(&callee, &offer, None);

        if !self.registry.has_connections(&callee) {
            let push = Arc::clone(&self.push);
            let body = serde_json::json!({
                "kind": "incoming_call",
                "callId": &session.id,
                "pairingId": &session.pairing_id,
                "callerId": &session.caller_id,
                "mediaType": session.media_type,
            });
            tokio::spawn(async move {
                push.notify_if_offline(&callee, body).await;
            });
        }

        let ringing_row = {
            let mut active = self.active.lock();
            match active.by_call.get_mut(&payload.call_id) {
                Some(s) => {
                    s.status = CallStatus::Ringing;
                    Some(s.to_row(None, None))
                }
                // Ended (or rejected) before the offer even finished.
                None => None,
            }
        };
        if let Some(row) = ringing_row {
            if let Err(e) = self.calls.update(&row) {
                tracing::warn!(call_id = %row.call_id, error = %e, "failed to persist ringing status");
            }
        }

        conn.send(
            &Envelope::new(
                Namespace::Signaling,
                kinds::CALL_RINGING,
                serde_json::json!({ "callId": &session.id }),
            ),
        );

        let registry = Arc::clone(&self.registry);
        let active = Arc::clone(&self.active);
        let calls = CallRepo::new(self.db.clone());
        let call_id = payload.call_id;
        let ring_timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ring_timeout).await;
            // Re-check: the call may have been answered or hung up meanwhile.
            let still_ringing = {
                let active = active.lock();
                matches!(
                    active.by_call.get(&call_id).map(|s| s.status),
                    Some(CallStatus::Ringing) | Some(CallStatus::Initiated)
                )
            };
            if still_ringing {
                tracing::info!(call_id = %call_id, "call unanswered, timing out");
                end_session_with(&registry, &calls, &active, &call_id, EndReason::Timeout);
            }
        });

        Ok(())
    }

    #[instrument(skip(self, conn, payload), fields(user_id = %conn.user_id, call_id = %payload.call_id))]
    pub fn handle_answer(
        &self,
        conn: &Connection,
        payload: AnswerPayload,
    ) -> Result<(), EngineError> {
        let (row, caller_id) = {
            let mut active = self.active.lock();
            let session = active
                .by_call
                .get_mut(&payload.call_id)
                .ok_or_else(|| EngineError::NotFound(format!("call {}", payload.call_id)))?;
            if session.callee_id != conn.user_id {
                return Err(EngineError::Forbidden("only the callee may answer".into()));
            }
            if session.status != CallStatus::Ringing {
                return Err(EngineError::BadEnvelope(format!(
                    "call is {}, not ringing",
                    session.status
                )));
            }
            session.status = CallStatus::Connected;
            session.connected_at = Some(Utc::now());
            (session.to_row(None, None), session.caller_id.clone())
        };

        if let Err(e) = self.calls.update(&row) {
            tracing::warn!(call_id = %row.call_id, error = %e, "failed to persist connected status");
        }

        let answer = Envelope::new(
            Namespace::Signaling,
            kinds::CALL_ANSWER_RECEIVED,
            serde_json::json!({
                "callId": &payload.call_id,
                "sdp": payload.sdp,
            }),
        )
        .with_user(conn.user_id.clone());
        self.registry.broadcast_to_user(&caller_id, &answer, None);

        conn.send(&Envelope::new(
            Namespace::Signaling,
            kinds::CALL_CONNECTED,
            serde_json::json!({ "callId": payload.call_id }),
        ));
        Ok(())
    }

    /// ICE candidates for unknown calls or from non-members are dropped
    /// without an error; trickle races with teardown are routine.
    pub fn handle_candidate(
        &self,
        conn: &Connection,
        payload: CandidatePayload,
    ) -> Result<(), EngineError> {
        let other = {
            let active = self.active.lock();
            match active.by_call.get(&payload.call_id) {
                Some(s) if s.caller_id == conn.user_id => Some(s.callee_id.clone()),
                Some(s) if s.callee_id == conn.user_id => Some(s.caller_id.clone()),
                _ => None,
            }
        };
        let Some(other) = other else {
            tracing::debug!(call_id = %payload.call_id, "dropping candidate for unknown call");
            return Ok(());
        };

        let envelope = Envelope::new(
            Namespace::Signaling,
            kinds::CALL_CANDIDATE_RECEIVED,
            serde_json::json!({
                "callId": payload.call_id,
                "candidate": payload.candidate,
            }),
        )
        .with_user(conn.user_id.clone());
        self.registry.broadcast_to_user(&other, &envelope, None);
        Ok(())
    }

    /// Hanging up an already-ended or unknown call is a no-op.
    #[instrument(skip(self, conn, payload), fields(user_id = %conn.user_id, call_id = %payload.call_id))]
    pub fn handle_hangup(
        &self,
        conn: &Connection,
        payload: HangupPayload,
    ) -> Result<(), EngineError> {
        {
            let active = self.active.lock();
            match active.by_call.get(&payload.call_id) {
                Some(s) if s.caller_id != conn.user_id && s.callee_id != conn.user_id => {
                    return Err(EngineError::Forbidden(
                        "only call participants may hang up".into(),
                    ));
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
        self.end_session(&payload.call_id, payload.reason.unwrap_or(EndReason::Hangup));
        Ok(())
    }

    /// Tear down the user's active call when their last signaling connection
    /// is gone.
    pub fn on_disconnect(&self, user_id: &UserId) {
        let call_id = {
            let active = self.active.lock();
            active.by_user.get(user_id).cloned()
        };
        if let Some(call_id) = call_id {
            tracing::info!(user_id = %user_id, call_id = %call_id, "participant disconnected, ending call");
            self.end_session(&call_id, EndReason::ConnectionLost);
        }
    }

    /// The only exit from a live call. Removes the session from both indexes,
    /// persists the terminal row, and notifies both parties. Returns false if
    /// the call was already gone.
    pub fn end_session(&self, call_id: &CallId, reason: EndReason) -> bool {
        end_session_with(&self.registry, &self.calls, &self.active, call_id, reason)
    }

    fn drop_session(&self, call_id: &CallId) {
        take_session(&self.active, call_id);
    }

    #[cfg(test)]
    fn status_of(&self, call_id: &CallId) -> Option<CallStatus> {
        self.active.lock().by_call.get(call_id).map(|s| s.status)
    }
}

/// Shared by the engine and the detached ring-timeout task.
fn end_session_with(
    registry: &ConnectionRegistry,
    calls: &CallRepo,
    active: &Mutex<ActiveCalls>,
    call_id: &CallId,
    reason: EndReason,
) -> bool {
    let ended_at = Utc::now();
    let Some(session) = take_session(active, call_id) else {
        return false;
    };

    let row = session.to_row(Some(reason), Some(ended_at));
    if let Err(e) = calls.update(&row) {
        tracing::warn!(call_id = %row.call_id, error = %e, "failed to persist call end");
    }

    let ended = Envelope::new(
        Namespace::Signaling,
        kinds::CALL_ENDED,
        serde_json::json!({
            "callId": &session.id,
            "reason": reason,
            "durationSecs": row.duration_secs,
        }),
    );
    registry.broadcast_to_user(&session.caller_id, &ended, None);
    registry.broadcast_to_user(&session.callee_id, &ended, None);
    true
}

fn take_session(active: &Mutex<ActiveCalls>, call_id: &CallId) -> Option<CallSession> {
    let mut active = active.lock();
    let session = active.by_call.remove(call_id)?;
    for user in [session.caller_id.clone(), session.callee_id.clone()] {
        if active.by_user.get(&user) == Some(call_id) {
            active.by_user.remove(&user);
        }
    }
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::test_support::RecordingPushNotifier;
    use crate::registry::test_support::identity;
    use hearth_core::auth::Identity;
    use hearth_core::types::Role;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        engine: Arc<CallSignalingEngine>,
        push: Arc<RecordingPushNotifier>,
        db: Database,
        caller: Identity,
        callee: Identity,
        pairing_id: PairingId,
    }

    fn setup_with(config: CallConfig) -> Fixture {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(32));
        let push = Arc::new(RecordingPushNotifier::default());

        let caller = identity(Role::Primary);
        let callee = identity(Role::Companion);
        let pairing = PairingRepo::new(db.clone())
            .create(&caller.user_id, &callee.user_id, PairingStatus::Active)
            .unwrap();

        let engine = Arc::new(CallSignalingEngine::new(
            Arc::clone(&registry),
            db.clone(),
            Arc::clone(&push) as Arc<dyn PushNotifier>,
            config,
        ));

        Fixture {
            registry,
            engine,
            push,
            db,
            caller,
            callee,
            pairing_id: pairing.id,
        }
    }

    fn setup() -> Fixture {
        setup_with(CallConfig::default())
    }

    fn offer(f: &Fixture, call_id: &CallId) -> OfferPayload {
        OfferPayload {
            call_id: call_id.clone(),
            pairing_id: f.pairing_id.clone(),
            media_type: MediaType::Video,
            sdp: serde_json::json!({ "type": "offer", "sdp": "v=0" }),
        }
    }

    fn recv_env(rx: &mut mpsc::Receiver<String>) -> Option<Envelope> {
        rx.try_recv()
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(env) = recv_env(rx) {
            out.push(env);
        }
        out
    }

    #[tokio::test]
    async fn offer_answer_hangup_full_lifecycle() {
        let f = setup();
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (callee_conn, mut callee_rx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();

        let incoming = recv_env(&mut callee_rx).unwrap();
        assert_eq!(incoming.kind, "call_offer_received");
        assert_eq!(incoming.data["sdp"]["type"], "offer");

        let ringing = recv_env(&mut caller_rx).unwrap();
        assert_eq!(ringing.kind, "call_ringing");
        assert_eq!(f.engine.status_of(&call_id), Some(CallStatus::Ringing));

        f.engine
            .handle_answer(
                &callee_conn,
                AnswerPayload {
                    call_id: call_id.clone(),
                    sdp: serde_json::json!({ "type": "answer" }),
                },
            )
            .unwrap();

        let answered = recv_env(&mut caller_rx).unwrap();
        assert_eq!(answered.kind, "call_answer_received");
        assert_eq!(recv_env(&mut callee_rx).unwrap().kind, "call_connected");
        assert_eq!(f.engine.status_of(&call_id), Some(CallStatus::Connected));

        f.engine
            .handle_hangup(
                &caller_conn,
                HangupPayload {
                    call_id: call_id.clone(),
                    reason: None,
                },
            )
            .unwrap();

        let ended = recv_env(&mut caller_rx).unwrap();
        assert_eq!(ended.kind, "call_ended");
        assert_eq!(ended.data["reason"], "hangup");
        // Connected and hung up within the same test run.
        let duration = ended.data["durationSecs"].as_i64().unwrap();
        assert!((0..=1).contains(&duration));
        assert_eq!(recv_env(&mut callee_rx).unwrap().kind, "call_ended");

        // Session gone, durable row terminal.
        assert!(f.engine.status_of(&call_id).is_none());
        let row = CallRepo::new(f.db.clone()).get(&call_id).unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ended);
        assert_eq!(row.reason, Some(EndReason::Hangup));
        assert!(row.connected_at.is_some());
        assert!((0..=1).contains(&row.duration_secs));
    }

    #[tokio::test]
    async fn call_id_can_be_reused_after_call_ends() {
        let f = setup();
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (_callee_conn, mut callee_rx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::from_raw("widget-call-7");

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        f.engine
            .handle_hangup(
                &caller_conn,
                HangupPayload {
                    call_id: call_id.clone(),
                    reason: None,
                },
            )
            .unwrap();
        let _ = drain(&mut caller_rx);
        let _ = drain(&mut callee_rx);

        // The id is free again once the call ended; a second offer with it
        // starts a fresh call instead of erroring.
        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        assert_eq!(f.engine.status_of(&call_id), Some(CallStatus::Ringing));
        assert_eq!(recv_env(&mut callee_rx).unwrap().kind, "call_offer_received");

        // Each call keeps its own audit row; the latest one is live.
        let row = CallRepo::new(f.db.clone()).get(&call_id).unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ringing);
        assert!(row.reason.is_none());
    }

    #[tokio::test]
    async fn busy_callee_rejects_second_offer() {
        let f = setup();
        let intruder = identity(Role::Primary);
        let pairing2 = PairingRepo::new(f.db.clone())
            .create(&intruder.user_id, &f.callee.user_id, PairingStatus::Active)
            .unwrap();

        let (caller_conn, _crx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (intruder_conn, _irx) = f.registry.register(&intruder, Namespace::Signaling);
        let (_callee_conn, mut callee_rx) = f.registry.register(&f.callee, Namespace::Signaling);

        let first = CallId::new();
        f.engine
            .handle_offer(&caller_conn, offer(&f, &first))
            .await
            .unwrap();
        let _ = drain(&mut callee_rx);

        let second = OfferPayload {
            call_id: CallId::new(),
            pairing_id: pairing2.id,
            media_type: MediaType::Voice,
            sdp: serde_json::json!({}),
        };
        let result = f.engine.handle_offer(&intruder_conn, second).await;
        assert!(matches!(result, Err(EngineError::Busy(_))));

        // The first call is untouched and the callee saw nothing new.
        assert_eq!(f.engine.status_of(&first), Some(CallStatus::Ringing));
        assert!(recv_env(&mut callee_rx).is_none());
    }

    #[tokio::test]
    async fn caller_cannot_start_two_calls() {
        let f = setup();
        let (caller_conn, _crx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (_callee_conn, _karx) = f.registry.register(&f.callee, Namespace::Signaling);

        f.engine
            .handle_offer(&caller_conn, offer(&f, &CallId::new()))
            .await
            .unwrap();
        let result = f
            .engine
            .handle_offer(&caller_conn, offer(&f, &CallId::new()))
            .await;
        assert!(matches!(result, Err(EngineError::Busy(_))));
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let f = setup_with(CallConfig {
            ring_timeout: Duration::from_millis(50),
        });
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (_callee_conn, mut callee_rx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(f.engine.status_of(&call_id).is_none());
        let ended = drain(&mut caller_rx)
            .into_iter()
            .find(|e| e.kind == "call_ended")
            .unwrap();
        assert_eq!(ended.data["reason"], "timeout");
        assert_eq!(ended.data["durationSecs"], 0);
        assert!(drain(&mut callee_rx).iter().any(|e| e.kind == "call_ended"));

        let row = CallRepo::new(f.db.clone()).get(&call_id).unwrap().unwrap();
        assert_eq!(row.reason, Some(EndReason::Timeout));
    }

    #[tokio::test]
    async fn answer_cancels_the_ring_timeout() {
        let f = setup_with(CallConfig {
            ring_timeout: Duration::from_millis(50),
        });
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (callee_conn, _karx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        f.engine
            .handle_answer(
                &callee_conn,
                AnswerPayload {
                    call_id: call_id.clone(),
                    sdp: serde_json::json!({}),
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.engine.status_of(&call_id), Some(CallStatus::Connected));
        assert!(drain(&mut caller_rx).iter().all(|e| e.kind != "call_ended"));
    }

    #[tokio::test]
    async fn disconnect_ends_call_as_connection_lost() {
        let f = setup();
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (callee_conn, _karx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        f.engine
            .handle_answer(
                &callee_conn,
                AnswerPayload {
                    call_id: call_id.clone(),
                    sdp: serde_json::json!({}),
                },
            )
            .unwrap();

        f.engine.on_disconnect(&f.callee.user_id);

        let ended = drain(&mut caller_rx)
            .into_iter()
            .find(|e| e.kind == "call_ended")
            .unwrap();
        assert_eq!(ended.data["reason"], "connection_lost");
        // Duration runs connected-at to the disconnect.
        let duration = ended.data["durationSecs"].as_i64().unwrap();
        assert!((0..=1).contains(&duration));
        assert!(f.engine.status_of(&call_id).is_none());
    }

    #[tokio::test]
    async fn hangup_is_idempotent() {
        let f = setup();
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (_callee_conn, _karx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        let hangup = HangupPayload {
            call_id: call_id.clone(),
            reason: Some(EndReason::Rejected),
        };
        f.engine.handle_hangup(&caller_conn, hangup.clone()).unwrap();
        f.engine.handle_hangup(&caller_conn, hangup).unwrap();

        let ended: Vec<_> = drain(&mut caller_rx)
            .into_iter()
            .filter(|e| e.kind == "call_ended")
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].data["reason"], "rejected");
    }

    #[tokio::test]
    async fn answer_from_non_callee_is_forbidden() {
        let f = setup();
        let (caller_conn, _crx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (_callee_conn, _karx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();

        let result = f.engine.handle_answer(
            &caller_conn,
            AnswerPayload {
                call_id,
                sdp: serde_json::json!({}),
            },
        );
        assert!(matches!(result, Err(EngineError::Forbidden(_))));
    }

    #[tokio::test]
    async fn answer_unknown_call_not_found() {
        let f = setup();
        let (conn, _rx) = f.registry.register(&f.callee, Namespace::Signaling);
        let result = f.engine.handle_answer(
            &conn,
            AnswerPayload {
                call_id: CallId::new(),
                sdp: serde_json::json!({}),
            },
        );
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn candidates_flow_both_ways_and_unknown_ids_are_dropped() {
        let f = setup();
        let (caller_conn, mut caller_rx) = f.registry.register(&f.caller, Namespace::Signaling);
        let (callee_conn, mut callee_rx) = f.registry.register(&f.callee, Namespace::Signaling);
        let call_id = CallId::new();

        f.engine
            .handle_offer(&caller_conn, offer(&f, &call_id))
            .await
            .unwrap();
        let _ = drain(&mut caller_rx);
        let _ = drain(&mut callee_rx);

        f.engine
            .handle_candidate(
                &caller_conn,
                CandidatePayload {
                    call_id: call_id.clone(),
                    candidate: serde_json::json!({ "candidate": "a=1" }),
                },
            )
            .unwrap();
        let forwarded = recv_env(&mut callee_rx).unwrap();
        assert_eq!(forwarded.kind, "call_candidate_received");

        f.engine
            .handle_candidate(
                &callee_conn,
                CandidatePayload {
                    call_id: call_id.clone(),
                    candidate: serde_json::json!({ "candidate": "a=2" }),
                },
            )
            .unwrap();
        assert_eq!(recv_env(&mut caller_rx).unwrap().kind, "call_candidate_received");

        // Unknown call id: silently dropped.
        f.engine
            .handle_candidate(
                &caller_conn,
                CandidatePayload {
                    call_id: CallId::new(),
                    candidate: serde_json::json!({}),
                },
            )
            .unwrap();
        assert!(recv_env(&mut callee_rx).is_none());
    }

    #[tokio::test]
    async fn offer_to_offline_callee_triggers_push() {
        let f = setup();
        let (caller_conn, _crx) = f.registry.register(&f.caller, Namespace::Signaling);
        // Callee holds no connections.

        f.engine
            .handle_offer(&caller_conn, offer(&f, &CallId::new()))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let sent = f.push.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, f.callee.user_id);
        assert_eq!(sent[0].1["kind"], "incoming_call");
    }

    #[tokio::test]
    async fn offer_on_inactive_pairing_rejected() {
        let f = setup();
        let paused = PairingRepo::new(f.db.clone())
            .create(&f.caller.user_id, &f.callee.user_id, PairingStatus::Paused)
            .unwrap();
        let (conn, _rx) = f.registry.register(&f.caller, Namespace::Signaling);

        let payload = OfferPayload {
            call_id: CallId::new(),
            pairing_id: paused.id,
            media_type: MediaType::Video,
            sdp: serde_json::json!({}),
        };
        let result = f.engine.handle_offer(&conn, payload).await;
        assert!(matches!(result, Err(EngineError::Forbidden(_))));
    }

    #[tokio::test]
    async fn offer_from_non_member_rejected() {
        let f = setup();
        let stranger = identity(Role::Companion);
        let (conn, _rx) = f.registry.register(&stranger, Namespace::Signaling);

        let result = f.engine.handle_offer(&conn, offer(&f, &CallId::new())).await;
        assert!(matches!(result, Err(EngineError::Forbidden(_))));
    }
}
