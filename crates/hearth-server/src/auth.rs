use async_trait::async_trait;

use hearth_core::auth::{AuthError, AuthVerifier, Identity};
use hearth_store::tokens::TokenRepo;
use hearth_store::Database;

/// Verifies bearer tokens against the local `auth_tokens` table. Stands in
/// for an external identity provider in single-node deployments.
pub struct SqliteAuthVerifier {
    tokens: TokenRepo,
}

impl SqliteAuthVerifier {
    pub fn new(db: Database) -> Self {
        Self {
            tokens: TokenRepo::new(db),
        }
    }
}

#[async_trait]
impl AuthVerifier for SqliteAuthVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        match self.tokens.lookup(token) {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(AuthError::InvalidToken),
            Err(e) => {
                tracing::error!(error = %e, "token lookup failed");
                Err(AuthError::Unavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::ids::{OrgId, UserId};
    use hearth_core::types::Role;

    #[tokio::test]
    async fn known_token_resolves_identity() {
        let db = Database::in_memory().unwrap();
        let identity = Identity {
            user_id: UserId::new(),
            org_id: OrgId::new(),
            role: Role::Primary,
        };
        TokenRepo::new(db.clone()).insert("tok-1", &identity).unwrap();

        let verifier = SqliteAuthVerifier::new(db);
        let resolved = verifier.verify("tok-1").await.unwrap();
        assert_eq!(resolved, identity);
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let verifier = SqliteAuthVerifier::new(Database::in_memory().unwrap());
        assert!(matches!(
            verifier.verify("nope").await,
            Err(AuthError::InvalidToken)
        ));
    }
}
