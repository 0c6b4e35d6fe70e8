//! Credential verification at connect time.
//!
//! Identity issuance lives elsewhere; the gateway only needs to turn a
//! bearer credential into a user id. [`JwtIdentity`] accepts the identity
//! service's signed access tokens; [`TokenTable`] is a static map for
//! development and tests.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing token")]
    Missing,
    #[error("Invalid token")]
    Invalid,
}

/// Resolves a bearer credential to the id of the user it was issued to.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Uuid, AuthError>;
}

/// Static credential → user map.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Uuid>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: Uuid) -> Self {
        self.insert(token, user_id);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: Uuid) {
        self.tokens.insert(token.into(), user_id);
    }

    /// Parse `token=user-uuid` pairs separated by commas.
    pub fn parse(entries: &str) -> Result<Self, String> {
        let mut table = Self::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, user) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected token=user-id, got '{entry}'"))?;
            let token = token.trim();
            if token.is_empty() {
                return Err(format!("empty token in '{entry}'"));
            }
            let user_id = Uuid::parse_str(user.trim())
                .map_err(|e| format!("bad user id in '{entry}': {e}"))?;
            table.insert(token, user_id);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for TokenTable {
    async fn resolve(&self, credential: &str) -> Result<Uuid, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens.get(credential).copied().ok_or(AuthError::Invalid)
    }
}

/// Claims the identity service puts in its access tokens.
#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
}

/// HS256-signed JWTs whose `sub` claim is the user id. Expiry is enforced.
#[derive(Clone)]
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl std::fmt::Debug for JwtIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentity").finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn resolve(&self, credential: &str) -> Result<Uuid, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<AccessClaims>(credential, &self.key, &self.validation)
            .map_err(|e| {
                log::debug!("Rejected JWT: {e}");
                AuthError::Invalid
            })?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: u64,
    }

    fn sign(secret: &str, sub: &str, exp: u64) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            exp,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_an_hour() -> u64 {
        jsonwebtoken::get_current_timestamp() + 3600
    }

    #[tokio::test]
    async fn test_jwt_valid_token_resolves_subject() {
        let user = Uuid::new_v4();
        let identity = JwtIdentity::new("s3cret");
        let token = sign("s3cret", &user.to_string(), in_an_hour());
        assert_eq!(identity.resolve(&token).await, Ok(user));
    }

    #[tokio::test]
    async fn test_jwt_expired_token_is_invalid() {
        let identity = JwtIdentity::new("s3cret");
        let expired = jsonwebtoken::get_current_timestamp() - 3600;
        let token = sign("s3cret", &Uuid::new_v4().to_string(), expired);
        assert_eq!(identity.resolve(&token).await, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn test_jwt_bad_signature_is_invalid() {
        let identity = JwtIdentity::new("s3cret");
        let token = sign("other-secret", &Uuid::new_v4().to_string(), in_an_hour());
        assert_eq!(identity.resolve(&token).await, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn test_jwt_rejects_non_uuid_subject_and_garbage() {
        let identity = JwtIdentity::new("s3cret");
        let token = sign("s3cret", "alice", in_an_hour());
        assert_eq!(identity.resolve(&token).await, Err(AuthError::Invalid));
        assert_eq!(identity.resolve("not.a.jwt").await, Err(AuthError::Invalid));
        assert_eq!(identity.resolve("").await, Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn test_resolve_known_token() {
        let user = Uuid::new_v4();
        let table = TokenTable::new().with_token("secret", user);
        assert_eq!(table.resolve("secret").await, Ok(user));
        assert_eq!(table.resolve("nope").await, Err(AuthError::Invalid));
        assert_eq!(table.resolve("").await, Err(AuthError::Missing));
    }

    #[test]
    fn test_parse_pairs() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let table = TokenTable::parse(&format!("alice={a}, bob = {b},")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.tokens.get("bob"), Some(&b));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TokenTable::parse("alice").is_err());
        assert!(TokenTable::parse("alice=not-a-uuid").is_err());
        assert!(TokenTable::parse(&format!("={}", Uuid::nil())).is_err());
        assert!(TokenTable::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_error_reasons() {
        assert_eq!(AuthError::Missing.to_string(), "Missing token");
        assert_eq!(AuthError::Invalid.to_string(), "Invalid token");
    }
}
