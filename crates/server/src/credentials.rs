//! Process-local `TokenStore`/`RevocationStore` implementations (spec §4.4).
//! Real deployments back these with the credential database the upstream
//! gateway's `moltis-auth` crate owns (SQL schema is explicitly out of
//! scope, §1); this gives the auth state machine a concrete, exercised
//! implementation to run against.

use agentim_auth::{RevocationStore, TokenPrincipal, TokenStore};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, TokenPrincipal>,
    revoked_after: DashMap<String, i64>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, token: impl Into<String>, principal: TokenPrincipal) {
        self.tokens.insert(token.into(), principal);
    }

    pub fn revoke_principal_as_of(&self, principal_id: impl Into<String>, epoch: i64) {
        self.revoked_after.insert(principal_id.into(), epoch);
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn verify(&self, token: &str) -> agentim_auth::Result<Option<TokenPrincipal>> {
        Ok(self.tokens.get(token).map(|p| p.clone()))
    }
}

#[async_trait]
impl RevocationStore for InMemoryTokenStore {
    async fn revoked_after(&self, principal_id: &str) -> agentim_auth::Result<Option<i64>> {
        Ok(self.revoked_after.get(principal_id).map(|e| *e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_token_verifies_to_its_principal() {
        let store = InMemoryTokenStore::new();
        store.issue("tok1", TokenPrincipal {
            principal_id: "u1".into(),
            issued_at_epoch: 100,
            connection_limit_override: None,
        });
        let principal = store.verify("tok1").await.unwrap().unwrap();
        assert_eq!(principal.principal_id, "u1");
    }

    #[tokio::test]
    async fn revocation_is_visible_to_the_revocation_store() {
        let store = InMemoryTokenStore::new();
        store.revoke_principal_as_of("u1", 500);
        assert_eq!(store.revoked_after("u1").await.unwrap(), Some(500));
    }
}
