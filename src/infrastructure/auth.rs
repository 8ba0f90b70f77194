use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::infrastructure::config::env_or;

const DEV_JWT_SECRET: &str = "core-ledger-dev-secret";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token creation error")]
    TokenCreation,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::TokenCreation => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallerRole {
    Worker,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub role: CallerRole,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiry_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_expiry_secs: 3600,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, using the development secret");
            defaults.jwt_secret.clone()
        });
        Self {
            jwt_secret,
            token_expiry_secs: env_or("JWT_TOKEN_EXPIRY_SECS", defaults.token_expiry_secs),
        }
    }
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

/// HS256 validation for callers of the worker-notification endpoints.
/// Issuing user tokens happens elsewhere; this side only mints the
/// service token workers present when they call back.
pub struct AuthService {
    keys: Keys,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            keys: Keys::new(config.jwt_secret.as_bytes()),
            config,
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.keys.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!("Rejected bearer token: {}", e);
                    AuthError::InvalidToken
                }
            })
    }

    pub fn token_expiry_secs(&self) -> i64 {
        self.config.token_expiry_secs
    }

    pub fn issue_service_token(&self, subject: &str, role: CallerRole) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + ChronoDuration::seconds(self.config.token_expiry_secs)).timestamp(),
            jti: Uuid::new_v4().to_string(),
            role,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.keys.encoding)
            .map_err(|_| AuthError::TokenCreation)
    }
}

/// Extractor for handlers that require a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller(pub Claims);

impl<S> FromRequestParts<S> for AuthenticatedCaller
where
    Arc<AuthService>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::MissingCredentials)?;

        let auth = Arc::<AuthService>::from_ref(state);
        auth.validate_token(bearer.token()).map(AuthenticatedCaller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(secret: &str) -> AuthService {
        AuthService::new(AuthConfig {
            jwt_secret: secret.to_string(),
            token_expiry_secs: 60,
        })
    }

    #[test]
    fn test_issued_token_validates() {
        let auth = service("secret");
        let token = auth.issue_service_token("worker-1", CallerRole::Worker).unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "worker-1");
        assert_eq!(claims.role, CallerRole::Worker);
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let token = service("one")
            .issue_service_token("worker-1", CallerRole::Worker)
            .unwrap();
        assert!(matches!(
            service("two").validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let auth = AuthService::new(AuthConfig {
            jwt_secret: "secret".to_string(),
            token_expiry_secs: -600,
        });
        let token = auth.issue_service_token("worker-1", CallerRole::Worker).unwrap();
        assert!(matches!(auth.validate_token(&token), Err(AuthError::TokenExpired)));
    }
}
