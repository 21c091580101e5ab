//! Bearer token verification.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the numeric principal id and
//! whose `role` claim names the session namespace the principal lives in.

use async_trait::async_trait;
use danmu_core::{CollaboratorError, CredentialVerifier, VerifiedCredential};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// Claims carried by a danmu bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id, as a decimal string.
    pub sub: String,
    /// Session role, e.g. `user`.
    pub role: String,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
}

/// Verifies bearer tokens against a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for the given HS256 secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn claims(&self, token: &str) -> Result<Claims, CollaboratorError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| CollaboratorError::Rejected(format!("invalid token: {e}")))
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, CollaboratorError> {
        let claims = self.claims(token)?;

        let principal_id = claims
            .sub
            .parse::<u64>()
            .map_err(|_| CollaboratorError::Rejected(format!("non-numeric subject: {}", claims.sub)))?;

        debug!(principal = principal_id, role = %claims.role, "Token verified");
        Ok(VerifiedCredential {
            principal_id,
            role: claims.role,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) const SECRET: &str = "test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    pub(crate) fn token(secret: &str, sub: &str, exp: u64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            role: "user".to_string(),
            exp,
        };
        encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    pub(crate) fn valid_token(sub: &str) -> String {
        token(SECRET, sub, now() + 3600)
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let credential = verifier.verify(&valid_token("7")).await.unwrap();
        assert_eq!(credential.principal_id, 7);
        assert_eq!(credential.role, "user");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let verifier = JwtVerifier::new(SECRET);
        let expired = token(SECRET, "7", now() - 3600);
        assert!(matches!(
            verifier.verify(&expired).await,
            Err(CollaboratorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let verifier = JwtVerifier::new(SECRET);
        let forged = token("other-secret", "7", now() + 3600);
        assert!(matches!(
            verifier.verify(&forged).await,
            Err(CollaboratorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_non_numeric_subject() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&valid_token("alice")).await,
            Err(CollaboratorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(verifier.verify("not.a.jwt").await.is_err());
    }
}
