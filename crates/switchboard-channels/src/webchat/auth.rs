//! Bearer token verification for browser clients.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use switchboard_core::secrets::ApiKey;

/// Why a token was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Signature, expiry, or issuer check failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token was issued for another tenant.
    #[error("token issued for tenant {0}")]
    WrongTenant(String),
}

/// An authenticated browser user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user ID.
    pub user_id: String,
    /// Display name, when the token carries one.
    pub display_name: Option<String>,
}

/// Verifies the token carried by an `auth` frame.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a token to a user.
    async fn verify(&self, token: &str) -> Result<Identity, AuthFailure>;
}

/// Claims read from HS256 tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tenant the token was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 JWT verifier bound to one tenant.
pub struct JwtTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    tenant: String,
}

impl JwtTokenVerifier {
    /// Create a verifier. When `issuer` is set, tokens must carry it.
    #[must_use]
    pub fn new(secret: &ApiKey, issuer: Option<&str>, tenant: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose().as_bytes()),
            validation,
            tenant: tenant.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthFailure::InvalidToken(e.to_string()))?
            .claims;

        if let Some(tenant) = claims.tenant.filter(|t| *t != self.tenant) {
            return Err(AuthFailure::WrongTenant(tenant));
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthFailure::InvalidToken("empty subject".to_string()));
        }
        Ok(Identity {
            user_id: claims.sub,
            display_name: claims.name,
        })
    }
}
