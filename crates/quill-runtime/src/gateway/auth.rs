use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::response::WebhookResponse;

/// Claims the broker puts in its bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerClaims {
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Verifies broker requests against a shared HS256 key.
///
/// Without a key every request is accepted, which is only meant for local
/// development.
#[derive(Clone)]
pub struct BrokerAuth {
    key: Option<DecodingKey>,
}

impl std::fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAuth")
            .field("enabled", &self.key.is_some())
            .finish()
    }
}

impl BrokerAuth {
    pub fn new(signing_key: Option<&str>) -> Self {
        Self {
            key: signing_key
                .filter(|k| !k.is_empty())
                .map(|k| DecodingKey::from_secret(k.as_bytes())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Check an `Authorization` header value.
    pub fn verify(&self, authorization: Option<&str>) -> Result<Option<BrokerClaims>, AuthError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let header = authorization.ok_or(AuthError::MissingHeader)?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::InvalidHeader)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        decode::<BrokerClaims>(token, key, &validation)
            .map(|data| Some(data.claims))
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidSignature => AuthError::InvalidToken("invalid signature".into()),
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}

/// Authentication errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,
    #[error("Invalid authorization header format")]
    InvalidHeader,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    TokenExpired,
}

/// Reject unauthenticated broker requests with a fatal 401.
pub async fn auth_middleware(
    State(auth): State<Arc<BrokerAuth>>,
    req: Request,
    next: Next,
) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth.verify(authorization) {
        Ok(claims) => {
            let mut req = req;
            if let Some(claims) = claims {
                req.extensions_mut().insert(claims);
            }
            next.run(req).await
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected webhook request");
            WebhookResponse::fatal(StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}
