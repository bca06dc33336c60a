//! Connection authentication.
//!
//! Clients present an HS256 access token, either as the `token` query
//! parameter or as a `Bearer` authorization header. The token is checked
//! before the WebSocket upgrade; a failed check never reaches the core.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_core::Identity;
use parley_protocol::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing access token")]
    MissingToken,

    /// The token has expired.
    #[error("Access token expired")]
    Expired,

    /// The token is malformed or its signature does not verify.
    #[error("Invalid access token: {0}")]
    Invalid(String),

    /// The server has no signing secret configured.
    #[error("No JWT secret configured")]
    MissingSecret,
}

/// Access token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Turns a presented token into an identity.
pub trait Authenticator: Send + Sync {
    /// Verify a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is missing, expired or invalid.
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWT authenticator.
pub struct JwtAuthenticator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator for a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSecret`] if the secret is empty.
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Ok(Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issue a token for a user, valid for `ttl_secs` seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be signed.
    pub fn issue(&self, user_id: UserId, username: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id,
            username: username.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.user_id == 0 {
            return Err(AuthError::Invalid("missing user_id".to_string()));
        }
        Ok(Identity::new(data.claims.user_id, data.claims.username))
    }
}

/// Extract the bearer token from an `Authorization` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
