//! Intake gateway: connects user mailboxes and messengers to the
//! document pipeline. Credential state lives in the configured store;
//! the process itself is stateless and safe to restart.

mod auth;
mod config;
mod http;
mod orchestrator;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::auth::BearerVerifier;
use crate::config::GatewayConfig;
use crate::http::{build_router, AppState};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env()?;

    let http_client = reqwest::Client::new();
    let registry = intake_providers::ProviderRegistry::from_env(http_client)?;
    let credentials = intake_store::credential_store_from_env().await?;
    let messages = intake_store::message_store_from_env().await?;
    let pending = intake_security::pending_store_from_env().await?;
    let signer = intake_security::StateSigner::from_env()?;

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        credentials,
        messages,
        pending,
        signer,
        OrchestratorConfig {
            state_ttl_secs: config.state_ttl_secs,
            refresh_skew_secs: config.refresh_skew_secs,
            message_cap: config.message_cap,
        },
    ));

    let state = AppState {
        orchestrator,
        auth: BearerVerifier::new(config.auth_secret.clone()),
        frontend_url: config.frontend_url.clone(),
        whatsapp_verify_token: config.whatsapp_verify_token.clone(),
        whatsapp_app_secret: config.whatsapp_app_secret.clone(),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "intake gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}
