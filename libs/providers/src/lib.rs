//! Provider adapters behind one capability contract.
//!
//! Every adapter is stateless with respect to storage: it receives a
//! materialized [`CredentialMap`] and returns results or typed failures.
//! OAuth-only operations (authorization URL, code exchange, refresh) and
//! direct-only operations (validate) have default implementations that
//! fail with the typed unsupported error, so each adapter only overrides
//! the capabilities its provider actually offers.
//!
//! Endpoints accept a `mock://` base so unit tests and local development
//! never touch the network.

mod gmail;
mod outlook;
mod telegram;
mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use intake_core::{CredentialMap, IntegrationError, Service};

pub use gmail::GmailAdapter;
pub use outlook::OutlookAdapter;
pub use telegram::TelegramAdapter;
pub use whatsapp::WhatsAppAdapter;

/// Outcome of a successful OAuth code exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub credentials: CredentialMap,
    /// Display metadata for the connected account (email address etc.).
    pub metadata: Value,
}

/// One entry in a message listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
}

/// A page of message summaries plus the cursor for the next page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Reference to downloadable content attached to a message. The pipeline
/// fetches bytes itself; adapters only hand out identifiers and, where
/// the provider issues them, short-lived download URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Full content of one message: extracted text plus attachment references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

/// Capability contract shared by the four adapters.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn service(&self) -> Service;

    /// OAuth adapters only: the URL the browser is redirected to.
    fn build_authorization_url(&self, _state: &str) -> Result<String, IntegrationError> {
        Err(IntegrationError::unsupported(
            self.service(),
            "build_authorization_url",
        ))
    }

    /// OAuth adapters only: exchanges an authorization code for tokens
    /// and account metadata.
    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, IntegrationError> {
        Err(IntegrationError::unsupported(self.service(), "exchange_code"))
    }

    /// OAuth adapters only: trades a refresh token for a fresh credential
    /// map. `Ok(None)` means the provider issues non-expiring credentials.
    async fn refresh(
        &self,
        _credentials: &CredentialMap,
    ) -> Result<Option<CredentialMap>, IntegrationError> {
        Ok(None)
    }

    /// Direct-credential adapters only: lightweight authenticated call
    /// proving the supplied credentials work; returns account metadata.
    async fn validate(&self, _credentials: &CredentialMap) -> Result<Value, IntegrationError> {
        Err(IntegrationError::unsupported(self.service(), "validate"))
    }

    async fn list_messages(
        &self,
        credentials: &CredentialMap,
        cursor: Option<&str>,
    ) -> Result<MessagePage, IntegrationError>;

    async fn get_message_content(
        &self,
        credentials: &CredentialMap,
        message_id: &str,
    ) -> Result<MessageContent, IntegrationError>;
}

/// Adapters keyed by service, selected by the enumerated value.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<Service, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.service(), adapter);
    }

    pub fn get(&self, service: Service) -> Result<Arc<dyn ProviderAdapter>, IntegrationError> {
        self.adapters
            .get(&service)
            .cloned()
            .ok_or_else(|| IntegrationError::unsupported(service, "provider not configured"))
    }

    /// Builds all four adapters from the environment, sharing one HTTP
    /// client.
    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(GmailAdapter::from_env(http.clone())?));
        registry.register(Arc::new(OutlookAdapter::from_env(http.clone())?));
        registry.register(Arc::new(WhatsAppAdapter::from_env(http.clone())));
        registry.register(Arc::new(TelegramAdapter::from_env(http)));
        Ok(registry)
    }
}

pub(crate) const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps transport failures onto the taxonomy: elapsed deadlines become
/// `ProviderTimeout`, everything else is internal.
pub(crate) fn transport_error(err: reqwest::Error) -> IntegrationError {
    if err.is_timeout() {
        tracing::warn!(error = %err, "provider call timed out");
        IntegrationError::ProviderTimeout {
            timeout_secs: PROVIDER_TIMEOUT.as_secs(),
        }
    } else {
        IntegrationError::Internal(anyhow::Error::new(err).context("provider call failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DirectOnly;

    #[async_trait]
    impl ProviderAdapter for DirectOnly {
        fn service(&self) -> Service {
            Service::Telegram
        }

        async fn list_messages(
            &self,
            _credentials: &CredentialMap,
            _cursor: Option<&str>,
        ) -> Result<MessagePage, IntegrationError> {
            Ok(MessagePage::default())
        }

        async fn get_message_content(
            &self,
            _credentials: &CredentialMap,
            message_id: &str,
        ) -> Result<MessageContent, IntegrationError> {
            Ok(MessageContent {
                id: message_id.to_string(),
                text: None,
                attachments: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn oauth_operations_default_to_unsupported() {
        let adapter = DirectOnly;
        let err = adapter.build_authorization_url("state").unwrap_err();
        assert_eq!(err.code(), "unsupported");
        let err = adapter.exchange_code("code").await.unwrap_err();
        assert_eq!(err.code(), "unsupported");
    }

    #[tokio::test]
    async fn registry_selects_by_service() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(DirectOnly));
        assert!(registry.get(Service::Telegram).is_ok());
        match registry.get(Service::Gmail) {
            Ok(_) => panic!("gmail adapter was never registered"),
            Err(err) => assert_eq!(err.code(), "unsupported"),
        }
    }
}
