//! JWT validation
//!
//! The API never issues tokens. Users authenticate against the identity
//! provider, which signs HS256 access tokens with a shared secret; this
//! module only validates them.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a provider-issued access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Email address, when the provider includes it
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration (unix seconds)
    pub exp: i64,
    /// Audience
    #[serde(default)]
    pub aud: Option<String>,
    /// Issued at (unix seconds)
    #[serde(default)]
    pub iat: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Validates provider-issued access tokens
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        validation.set_audience(&["authenticated"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Decode and validate an access token
    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(err.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const TEST_SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn issue(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode token")
    }

    fn valid_claims() -> Claims {
        Claims {
            sub: "7f8a3a60-9f2e-4c1d-8f6a-0b1c2d3e4f5a".to_string(),
            email: Some("user@example.com".to_string()),
            exp: OffsetDateTime::now_utc().unix_timestamp() + 3600,
            aud: Some("authenticated".to_string()),
            iat: Some(OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    #[test]
    fn test_valid_token_round_trip() {
        let manager = JwtManager::new(TEST_SECRET);
        let token = issue(&valid_claims(), TEST_SECRET);

        let claims = manager.validate(&token).expect("valid token");
        assert_eq!(claims.sub, "7f8a3a60-9f2e-4c1d-8f6a-0b1c2d3e4f5a");
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(TEST_SECRET);
        let mut claims = valid_claims();
        claims.exp = OffsetDateTime::now_utc().unix_timestamp() - 3700;
        let token = issue(&claims, TEST_SECRET);

        assert!(matches!(manager.validate(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let manager = JwtManager::new(TEST_SECRET);
        let token = issue(
            &valid_claims(),
            "a-completely-different-secret-of-sufficient-length",
        );

        assert!(matches!(manager.validate(&token), Err(JwtError::Invalid(_))));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let manager = JwtManager::new(TEST_SECRET);
        let mut claims = valid_claims();
        claims.aud = Some("service_role".to_string());
        let token = issue(&claims, TEST_SECRET);

        assert!(matches!(manager.validate(&token), Err(JwtError::Invalid(_))));
    }
}
