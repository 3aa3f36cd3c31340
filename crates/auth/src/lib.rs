//! Bearer-token authentication, revocation checking, connection-limit
//! lookup, and encryption-at-rest for stored Router LLM API keys (§4.4, §9).
//!
//! The token/revocation/connection-limit lookups are expressed as traits so
//! this crate stays ignorant of the backing store (SQL, KV, or in-memory
//! test doubles) — the same separation the upstream credential store draws
//! between hashing/verification logic and its SQLite-backed persistence.

pub mod crypto;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("session revoked")]
    Revoked,
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The principal a bearer token resolved to, plus the epoch (seconds) it was
/// issued at — needed for the revoked-after-epoch-T check.
#[derive(Debug, Clone)]
pub struct TokenPrincipal {
    pub principal_id: String,
    pub issued_at_epoch: i64,
    /// `None` means "use the server-wide default" (§4.3's connection limit
    /// override).
    pub connection_limit_override: Option<u32>,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<TokenPrincipal>>;
}

/// KV lookup for "tokens revoked after epoch T" per principal (§4.4).
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn revoked_after(&self, principal_id: &str) -> Result<Option<i64>>;
}

pub fn current_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Verify a bearer token: resolve it to a principal, then check revocation.
/// Returns the resolved principal on success.
pub async fn authenticate(
    tokens: &dyn TokenStore,
    revocations: &dyn RevocationStore,
    token: &str,
) -> Result<TokenPrincipal> {
    let principal = tokens.verify(token).await?.ok_or(Error::InvalidToken)?;

    if let Some(revoked_after) = revocations.revoked_after(&principal.principal_id).await?
        && principal.issued_at_epoch <= revoked_after
    {
        return Err(Error::Revoked);
    }

    Ok(principal)
}

/// Enforce the per-user connection cap (§4.3/§4.4): default 10, optionally
/// overridden per principal.
pub fn enforce_connection_limit(
    current_connections: u32,
    default_limit: u32,
    override_limit: Option<u32>,
) -> Result<()> {
    let limit = override_limit.unwrap_or(default_limit);
    if current_connections >= limit {
        return Err(Error::ConnectionLimitExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeTokens(HashMap<String, TokenPrincipal>);

    #[async_trait]
    impl TokenStore for FakeTokens {
        async fn verify(&self, token: &str) -> Result<Option<TokenPrincipal>> {
            Ok(self.0.get(token).cloned())
        }
    }

    struct FakeRevocations(Mutex<HashMap<String, i64>>);

    #[async_trait]
    impl RevocationStore for FakeRevocations {
        async fn revoked_after(&self, principal_id: &str) -> Result<Option<i64>> {
            Ok(self.0.lock().unwrap().get(principal_id).copied())
        }
    }

    #[tokio::test]
    async fn valid_unrevoked_token_authenticates() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok1".to_string(),
            TokenPrincipal {
                principal_id: "user1".into(),
                issued_at_epoch: 1000,
                connection_limit_override: None,
            },
        );
        let tokens = FakeTokens(tokens);
        let revocations = FakeRevocations(Mutex::new(HashMap::new()));

        let principal = authenticate(&tokens, &revocations, "tok1").await.unwrap();
        assert_eq!(principal.principal_id, "user1");
    }

    #[tokio::test]
    async fn token_issued_before_revocation_epoch_is_rejected() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok1".to_string(),
            TokenPrincipal {
                principal_id: "user1".into(),
                issued_at_epoch: 1000,
                connection_limit_override: None,
            },
        );
        let tokens = FakeTokens(tokens);
        let mut revoked = HashMap::new();
        revoked.insert("user1".to_string(), 2000);
        let revocations = FakeRevocations(Mutex::new(revoked));

        let result = authenticate(&tokens, &revocations, "tok1").await;
        assert!(matches!(result, Err(Error::Revoked)));
    }

    #[test]
    fn connection_limit_enforced() {
        assert!(enforce_connection_limit(9, 10, None).is_ok());
        assert!(enforce_connection_limit(10, 10, None).is_err());
        assert!(enforce_connection_limit(3, 10, Some(3)).is_err());
    }
}
