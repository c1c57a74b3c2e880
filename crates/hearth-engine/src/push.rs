use async_trait::async_trait;

use hearth_core::ids::UserId;

/// Push-notification collaborator. Fire-and-forget: failures are logged,
/// never surfaced to the triggering operation.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_if_offline(&self, user_id: &UserId, payload: serde_json::Value);
}

/// Default notifier for deployments without a push gateway.
pub struct NoopPushNotifier;

#[async_trait]
impl PushNotifier for NoopPushNotifier {
    async fn notify_if_offline(&self, user_id: &UserId, _payload: serde_json::Value) {
        tracing::debug!(user_id = %user_id, "push disabled, dropping notification");
    }
}

/// Posts `{ userId, payload }` to an HTTP gateway (e.g. an FCM relay).
pub struct WebhookPushNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookPushNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn notify_if_offline(&self, user_id: &UserId, payload: serde_json::Value) {
        let body = serde_json::json!({ "userId": user_id, "payload": payload });
        match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(user_id = %user_id, "push notification dispatched");
            }
            Ok(resp) => {
                tracing::warn!(user_id = %user_id, status = %resp.status(), "push gateway rejected notification");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "push gateway unreachable");
            }
        }
    }
}
