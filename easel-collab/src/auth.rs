//! Identity verification for inbound sockets.
//!
//! The engine never issues credentials. It hands the bearer token from the
//! connect URL to an [`IdentityVerifier`] and either gets back a verified
//! [`Identity`] or refuses the socket.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A verified user, attached to the connection before it touches a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), display_name: display_name.into() }
    }
}

/// Every way a credential can be refused. All of them close the socket
/// with the same code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Token expired")]
    Expired,
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("Identity verification timed out")]
    Timeout,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verify `token` under `timeout`. An absent or blank token never reaches
/// the verifier.
pub async fn authenticate(
    verifier: &dyn IdentityVerifier,
    token: Option<&str>,
    timeout: Duration,
) -> Result<Identity, AuthError> {
    let token = token.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
    tokio::time::timeout(timeout, verifier.verify(token))
        .await
        .map_err(|_| AuthError::Timeout)?
}

// ─── JWT ─────────────────────────────────────────────────────────────

/// Claims carried by tokens accepted by [`JwtVerifier`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Display name, defaults to the user id
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry as seconds since the epoch
    pub exp: u64,
}

/// HS256 tokens signed with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Clock skew tolerated on `exp`, in seconds.
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        })?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        let display_name = claims.name.unwrap_or_else(|| claims.sub.clone());
        Ok(Identity { user_id: claims.sub, display_name })
    }
}

// ─── Static tokens ───────────────────────────────────────────────────

/// Fixed token table, for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: &str, display_name: &str) -> Self {
        self.tokens.insert(token.into(), Identity::new(user_id, display_name));
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or_else(|| AuthError::Invalid("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn token(sub: &str, name: Option<&str>, exp: u64) -> String {
        let claims = Claims { sub: sub.into(), name: name.map(String::from), exp };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn in_one_hour() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    struct Stalled;

    #[async_trait]
    impl IdentityVerifier for Stalled {
        async fn verify(&self, _token: &str) -> Result<Identity, AuthError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(AuthError::Unavailable("never".into()))
        }
    }

    #[tokio::test]
    async fn test_jwt_valid() {
        let verifier = JwtVerifier::new(SECRET);
        let identity = verifier.verify(&token("u-1", Some("Ada"), in_one_hour())).await.unwrap();
        assert_eq!(identity, Identity::new("u-1", "Ada"));

        let identity = verifier.verify(&token("u-2", None, in_one_hour())).await.unwrap();
        assert_eq!(identity.display_name, "u-2");
    }

    #[tokio::test]
    async fn test_jwt_expired_and_tampered() {
        let verifier = JwtVerifier::new(SECRET).with_leeway(0);
        let expired = token("u-1", None, (chrono::Utc::now().timestamp() - 600) as u64);
        assert_eq!(verifier.verify(&expired).await, Err(AuthError::Expired));

        let other = JwtVerifier::new(b"other-secret");
        assert!(matches!(other.verify(&token("u-1", None, in_one_hour())).await, Err(AuthError::Invalid(_))));
        assert!(matches!(verifier.verify("not.a.jwt").await, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_authenticate_missing_and_timeout() {
        let verifier = StaticVerifier::new().with_token("t", "alice", "Alice");
        assert_eq!(authenticate(&verifier, None, Duration::from_secs(1)).await, Err(AuthError::MissingToken));
        assert_eq!(authenticate(&verifier, Some("  "), Duration::from_secs(1)).await, Err(AuthError::MissingToken));
        assert_eq!(
            authenticate(&verifier, Some("t"), Duration::from_secs(1)).await.unwrap().user_id,
            "alice"
        );
        assert_eq!(
            authenticate(&Stalled, Some("t"), Duration::from_millis(20)).await,
            Err(AuthError::Timeout)
        );
    }
}
