//! Connection authentication.
//!
//! Every new connection (including reconnects) presents a signed token at
//! handshake time carrying the user id and session id. The token signature
//! and expiry are checked first, then the (user, session) pair is looked up
//! in the active-session table — a token from a logged-out session is
//! rejected even if its expiry has not passed.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::storage::{Storage, StorageError};

/// Clock-skew tolerance applied to `exp` validation.
const VALIDATION_LEEWAY_SECS: u64 = 30;

#[derive(Debug)]
pub enum AuthError {
    /// Bad signature, malformed token, or expired token.
    Token(jsonwebtoken::errors::Error),
    /// Well-formed token whose session has been invalidated (logout).
    SessionInactive,
    /// Session table lookup failed.
    Storage(StorageError),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Token(e) => write!(f, "invalid token: {e}"),
            AuthError::SessionInactive => write!(f, "session is not active"),
            AuthError::Storage(e) => write!(f, "session lookup failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        AuthError::Token(e)
    }
}

impl From<StorageError> for AuthError {
    fn from(e: StorageError) -> Self {
        AuthError::Storage(e)
    }
}

/// Claims carried by a connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier.
    pub sub: String,
    /// Session identifier; must be present in the active-session table.
    pub sid: String,
    /// Issued-at (seconds since epoch).
    pub iat: u64,
    /// Expiry (seconds since epoch).
    pub exp: u64,
}

/// Identity bound to a connection for its lifetime.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub session_id: String,
}

/// Verifies connection tokens against a shared HMAC secret.
#[derive(Clone)]
pub struct TokenValidator {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = VALIDATION_LEEWAY_SECS;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature and expiry, returning the claims.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

/// Full connection-time check: token validity plus active-session lookup.
pub fn authenticate(
    validator: &TokenValidator,
    storage: &Storage,
    token: &str,
) -> Result<AuthedUser, AuthError> {
    let claims = validator.decode(token)?;
    if !storage.is_session_active(&claims.sub, &claims.sid)? {
        return Err(AuthError::SessionInactive);
    }
    Ok(AuthedUser {
        user_id: claims.sub,
        session_id: claims.sid,
    })
}
