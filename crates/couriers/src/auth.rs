use courier_common::types::BEARER_PREFIX;
use courier_common::Identity;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a connection attempt is refused before the upgrade.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No `Authorization` header was sent.
    #[error("missing credential")]
    MissingCredential,
    /// The header was present but not a bearer credential.
    #[error("malformed credential")]
    MalformedCredential,
    /// The token failed signature, expiry or issuer checks.
    #[error("invalid or expired token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    /// The token verified but names no identity.
    #[error("identity not found in token")]
    MissingIdentity,
}

/// Turns a bearer credential into a verified identity.
///
/// Called synchronously, once per connection attempt, from inside the
/// WebSocket handshake.
pub trait IdentityVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the credential is not acceptable.
    fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Claims carried by relay access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, typically the account id.
    #[serde(default)]
    pub sub: String,
    /// Identity used for routing.
    #[serde(default)]
    pub email: String,
    /// Token issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Issued-at, unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Expiry, unix seconds.
    pub exp: u64,
}

/// HMAC (HS256/384/512) JWT verifier. The `email` claim is the identity;
/// `exp` is required.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Build a verifier for `secret`, optionally pinning the issuer.
    #[must_use]
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation)?;
        let email = data.claims.email;
        if email.is_empty() {
            return Err(AuthError::MissingIdentity);
        }
        Ok(email)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// # Errors
///
/// Returns [`AuthError::MissingCredential`] when no header is present and
/// [`AuthError::MalformedCredential`] when it is not a non-empty bearer token.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingCredential)?;
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::MalformedCredential)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MalformedCredential);
    }
    Ok(token)
}
