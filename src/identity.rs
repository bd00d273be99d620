//! Plugin Identity Tokens
//!
//! A plugin that authenticates to an external identity provider asks the host
//! for a short-lived token. The token value never shows up in `Display` or
//! `Debug` output; the raw string is only reachable through
//! [`IdentityToken::token`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What an identity token formats as.
pub const REDACTED_TOKEN: &str = "[REDACTED]";

/// An opaque identity token.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED_TOKEN)
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityToken").field(&REDACTED_TOKEN).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTokenRequest {
    /// Name of the signing key.
    pub key: String,
    pub audience: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTokenResponse {
    pub token: IdentityToken,
    /// May be shorter than requested.
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("missing signing key name")]
    MissingKey,

    #[error("missing audience")]
    MissingAudience,

    #[error("ttl must be greater than zero")]
    ZeroTtl,

    #[error("ttl of {0:?} is out of range")]
    TtlOutOfRange(Duration),

    #[error("failed to encode token claims: {0}")]
    Encode(String),
}

#[async_trait]
pub trait IdentityTokenIssuer: Send + Sync {
    async fn generate_identity_token(
        &self,
        req: IdentityTokenRequest,
    ) -> Result<IdentityTokenResponse, IdentityError>;
}

/// Claims carried inside tokens minted by [`LocalIssuer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub key: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues `base64url(claims).base64url(sha256(secret || claims))` tokens,
/// capping the TTL at `max_ttl`.
pub struct LocalIssuer {
    secret: [u8; 32],
    max_ttl: Duration,
}

impl LocalIssuer {
    pub fn new(max_ttl: Duration) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret, max_ttl }
    }

    fn mac(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Claims of a token this issuer minted, if the signature matches.
    pub fn verify(&self, token: &IdentityToken) -> Option<TokenClaims> {
        let (payload, mac) = token.token().split_once('.')?;
        if self.mac(payload) != mac {
            return None;
        }
        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

#[async_trait]
impl IdentityTokenIssuer for LocalIssuer {
    async fn generate_identity_token(
        &self,
        req: IdentityTokenRequest,
    ) -> Result<IdentityTokenResponse, IdentityError> {
        if req.key.is_empty() {
            return Err(IdentityError::MissingKey);
        }
        if req.audience.is_empty() {
            return Err(IdentityError::MissingAudience);
        }
        if req.ttl.is_zero() {
            return Err(IdentityError::ZeroTtl);
        }

        let ttl = req.ttl.min(self.max_ttl);
        let now = Utc::now().timestamp();
        let exp = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| now.checked_add(secs))
            .ok_or(IdentityError::TtlOutOfRange(ttl))?;
        let claims = TokenClaims {
            key: req.key,
            aud: req.audience,
            iat: now,
            exp,
        };
        let json = serde_json::to_vec(&claims).map_err(|e| IdentityError::Encode(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let token = format!("{payload}.{}", self.mac(&payload));

        tracing::debug!(key = %claims.key, audience = %claims.aud, ?ttl, "identity token issued");
        Ok(IdentityTokenResponse {
            token: IdentityToken(token),
            ttl,
        })
    }
}
