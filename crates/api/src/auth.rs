//! JWT identity extraction
//!
//! Tokens are issued by the identity subsystem; this side only validates
//! them and pulls out the user id and role for quota decisions.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lagen_shared::UserRole;

use crate::{error::ApiError, state::AppState};

/// JWT claims structure for Lagen-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// User role
    pub role: String,
    /// User identifier (email or external id)
    pub identifier: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Authenticated request identity
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: UserRole,
    pub identifier: String,
}

/// Validate a bearer token and decode its claims
///
/// Explicit algorithm prevents algorithm confusion attacks.
pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 60; // 60 second clock skew tolerance

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        ApiError::Unauthorized
    })
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = decode_claims(token, &state.config.jwt_secret)?;

        Ok(AuthUser {
            user_id: claims.sub,
            role: UserRole::from_str_lossy(&claims.role),
            identifier: claims.identifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    const SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn make_token(role: &str, expires_in: Duration, secret: &str) -> String {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: Uuid::new_v4(),
            role: role.to_string(),
            identifier: "test@example.com".to_string(),
            iat: now.unix_timestamp(),
            exp: (now + expires_in).unix_timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("Failed to encode token")
    }

    #[test]
    fn test_valid_token_decodes() {
        let token = make_token("ADMIN", Duration::hours(1), SECRET);
        let claims = decode_claims(&token, SECRET).expect("Token should validate");
        assert_eq!(UserRole::from_str_lossy(&claims.role), UserRole::Admin);
        assert_eq!(claims.identifier, "test@example.com");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = make_token("USER", Duration::hours(1), "some-other-secret-that-is-32-chars!!");
        assert!(matches!(
            decode_claims(&token, SECRET),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Past the 60s leeway
        let token = make_token("USER", Duration::minutes(-5), SECRET);
        assert!(matches!(
            decode_claims(&token, SECRET),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn test_unknown_role_defaults_to_user() {
        let token = make_token("superuser", Duration::hours(1), SECRET);
        let claims = decode_claims(&token, SECRET).expect("Token should validate");
        assert_eq!(UserRole::from_str_lossy(&claims.role), UserRole::User);
    }
}
