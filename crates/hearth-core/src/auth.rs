use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{OrgId, UserId};
use crate::types::Role;

/// Resolved identity of an authenticated connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub org_id: OrgId,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Token verification collaborator. The engine never inspects tokens itself;
/// it only calls this at connection establishment.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}
