use std::env;

use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use intake_core::{Service, UserId};

/// Claims embedded in an OAuth state token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateClaims {
    /// Owning user id.
    pub sub: String,
    pub service: Service,
    pub exp: i64,
    pub iat: i64,
    /// Token id; also the pending-store key, so consumption is keyed to
    /// this exact issuance.
    pub jti: String,
}

impl StateClaims {
    pub fn new(user: &UserId, service: Service, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            sub: user.as_str().to_string(),
            service,
            exp: (now + ttl).unix_timestamp(),
            iat: now.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }
}

/// Signs and verifies state tokens with a shared HS256 secret.
#[derive(Clone)]
pub struct StateSigner {
    secret: Vec<u8>,
}

impl StateSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let secret = env::var("STATE_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .context("STATE_SECRET or JWT_SECRET must be set")?;
        Ok(Self::new(secret.into_bytes()))
    }

    pub fn sign(&self, claims: &StateClaims) -> Result<String> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(
            &header,
            claims,
            &EncodingKey::from_secret(&self.secret),
        )?)
    }

    /// Verifies signature and expiry. Expired or tampered tokens fail
    /// here, before the pending store is ever consulted.
    pub fn verify(&self, token: &str) -> Result<StateClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<StateClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )?;
        Ok(data.claims)
    }
}
