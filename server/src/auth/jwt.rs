use std::path::Path;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use uuid::Uuid;

use crate::auth::middleware::Claims;

/// Access token lifetime in seconds.
pub const ACCESS_TOKEN_TTL_SECS: i64 = 900;

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(
    data_dir: &str,
) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token (15-minute expiry).
/// Claims: sub=user_id, username, iat, exp
pub fn issue_access_token(
    secret: &[u8],
    user_id: Uuid,
    username: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate an access token and return its claims.
pub fn validate_access_token(
    secret: &[u8],
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips_identity() {
        let secret = [7u8; 32];
        let user_id = Uuid::new_v4();
        let token = issue_access_token(&secret, user_id, "ana").unwrap();

        let claims = validate_access_token(&secret, &token).unwrap();
        assert_eq!(claims.user_id(), Some(user_id));
        assert_eq!(claims.username, "ana");
    }

    #[test]
    fn token_signed_with_other_key_is_rejected() {
        let token = issue_access_token(&[1u8; 32], Uuid::new_v4(), "ana").unwrap();
        assert!(validate_access_token(&[2u8; 32], &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = [3u8; 32];
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            username: "old".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(&secret)).unwrap();
        assert!(validate_access_token(&secret, &token).is_err());
    }

    #[test]
    fn secret_is_persisted_between_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = load_or_generate_jwt_secret(path).unwrap();
        let second = load_or_generate_jwt_secret(path).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }
}
