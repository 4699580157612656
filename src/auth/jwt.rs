use std::path::Path;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;

use crate::auth::middleware::Claims;
use crate::auth::{Identity, TokenValidator};

/// Access token lifetime in seconds (15 minutes).
const ACCESS_TOKEN_TTL_SECS: i64 = 900;

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        // Invalid key file — regenerate
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    // Generate new 256-bit random key
    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token (15-minute expiry).
/// Claims: user_id, nombre, role, iat, exp
pub fn issue_access_token(
    secret: &[u8],
    user_id: i64,
    nombre: &str,
    role: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        user_id,
        nombre: nombre.to_string(),
        role: role.to_string(),
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret),
    )
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

/// Production TokenValidator backed by the server's JWT signing key.
pub struct JwtValidator {
    secret: Vec<u8>,
}

impl JwtValidator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Option<Identity> {
        match validate_access_token(&self.secret, token) {
            Ok(claims) => Some(Identity {
                user_id: claims.user_id,
                nombre: claims.nombre,
                role: claims.role,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Access token rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let secret = vec![7u8; 32];
        let token = issue_access_token(&secret, 42, "Ana", "empleado").unwrap();
        let claims = validate_access_token(&secret, &token).unwrap();
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.nombre, "Ana");
        assert_eq!(claims.role, "empleado");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_access_token(&[1u8; 32], 1, "X", "cliente").unwrap();
        let validator = JwtValidator::new(vec![2u8; 32]);
        assert!(validator.validate(&token).is_none());
    }

    #[test]
    fn garbage_token_rejected() {
        let validator = JwtValidator::new(vec![3u8; 32]);
        assert!(validator.validate("not-a-jwt").is_none());
    }
}
