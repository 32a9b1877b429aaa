use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::jwt;
use crate::error::GatewayError;

/// JWT claims extracted from Authorization: Bearer header.
/// Implements axum's FromRequestParts for use as an extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID (UUID)
    pub sub: String,
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

/// The authenticated caller: a verified token whose subject is a valid id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl TryFrom<Claims> for Identity {
    type Error = GatewayError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let user_id = claims.user_id().ok_or(GatewayError::AuthenticationFailed)?;
        Ok(Self {
            user_id,
            username: claims.username,
        })
    }
}

/// Validate a raw token. Every failure is reported the same way.
pub fn authenticate(secret: &[u8], token: Option<&str>) -> Result<Identity, GatewayError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::AuthenticationFailed)?;
    let claims = jwt::validate_access_token(secret, token).map_err(|e| {
        tracing::debug!(error = %e, "Token rejected");
        GatewayError::AuthenticationFailed
    })?;
    Identity::try_from(claims)
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        // Get JWT secret from request extensions (set by middleware layer)
        let jwt_secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or(GatewayError::AuthenticationFailed)?;

        authenticate(&jwt_secret.0, token)
    }
}

/// JWT secret stored in request extensions for the Identity extractor
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);
