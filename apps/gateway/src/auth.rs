//! Bearer authentication for the API routes. Tokens are HS256 JWTs
//! issued by the account service; the subject claim is the user id.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use intake_core::UserId;

use crate::http::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct BearerClaims {
    pub sub: String,
    pub exp: i64,
}

/// Verifies bearer tokens against the shared secret.
#[derive(Clone)]
pub struct BearerVerifier {
    secret: Vec<u8>,
}

impl BearerVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<BearerClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|err| AuthError(format!("invalid bearer token: {err}")))?;
        UserId::new(data.claims.sub)
            .map_err(|_| AuthError("token subject is not a usable user id".into()))
    }
}

/// Authenticated user, extracted from the `Authorization` header.
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AuthError("missing authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError("authorization header is not a bearer token".into()))?;
        state.auth.verify(token).map(AuthUser)
    }
}

#[derive(Debug)]
pub struct AuthError(String);

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::debug!(reason = %self.0, "rejected unauthenticated request");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized", "message": self.0 })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    fn token(secret: &str, sub: &str, ttl: Duration) -> String {
        let claims = BearerClaims {
            sub: sub.to_string(),
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let verifier = BearerVerifier::new("secret");
        let user = verifier
            .verify(&token("secret", "user-1", Duration::minutes(5)))
            .unwrap();
        assert_eq!(user.as_str(), "user-1");
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let verifier = BearerVerifier::new("secret");
        assert!(verifier
            .verify(&token("other", "user-1", Duration::minutes(5)))
            .is_err());
        assert!(verifier
            .verify(&token("secret", "user-1", Duration::minutes(-5)))
            .is_err());
    }

    #[test]
    fn rejects_hostile_subject() {
        let verifier = BearerVerifier::new("secret");
        assert!(verifier
            .verify(&token("secret", "../other", Duration::minutes(5)))
            .is_err());
    }
}
