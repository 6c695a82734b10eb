use std::net::SocketAddr;

use anyhow::{Context, Result};

/// Gateway configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Where OAuth callbacks send the browser back to.
    pub frontend_url: String,
    /// Shared secret for the bearer tokens on authenticated routes.
    pub auth_secret: String,
    /// How long an issued state token stays redeemable.
    pub state_ttl_secs: u64,
    /// Tokens expiring within this window are refreshed before use.
    pub refresh_skew_secs: i64,
    /// Newest-N window kept per user for webhook-delivered messages.
    pub message_cap: usize,
    pub whatsapp_verify_token: Option<String>,
    pub whatsapp_app_secret: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".into())
            .parse()
            .context("BIND_ADDR is not a valid socket address")?;
        Ok(Self {
            bind,
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            auth_secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            state_ttl_secs: parse_or("STATE_TTL_SECS", 600)?,
            refresh_skew_secs: parse_or("REFRESH_SKEW_SECS", 300)?,
            message_cap: parse_or("MESSAGE_RETENTION_CAP", 10)?,
            whatsapp_verify_token: std::env::var("WHATSAPP_VERIFY_TOKEN").ok(),
            whatsapp_app_secret: std::env::var("WHATSAPP_APP_SECRET").ok(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} is not a valid number: {raw}")),
        Err(_) => Ok(default),
    }
}
