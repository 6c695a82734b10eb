//! WhatsApp Business adapter. Credentials are supplied directly (system
//! user access token plus phone number id) and validated against the
//! Graph API. WhatsApp has no history API; inbound messages arrive over
//! the webhook, so listing is a typed unsupported operation and content
//! lookup resolves media ids to short-lived download URLs.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use intake_core::{CredentialMap, IntegrationError, Service};

use crate::{
    transport_error, AttachmentRef, MessageContent, MessagePage, ProviderAdapter, PROVIDER_TIMEOUT,
};

const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v18.0";

pub struct WhatsAppAdapter {
    http: Client,
    api_base: String,
}

impl WhatsAppAdapter {
    pub fn from_env(http: Client) -> Self {
        Self {
            api_base: std::env::var("WHATSAPP_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            http,
        }
    }

    pub fn new(http: Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for WhatsAppAdapter {
    fn service(&self) -> Service {
        Service::WhatsApp
    }

    async fn validate(&self, credentials: &CredentialMap) -> Result<Value, IntegrationError> {
        let access_token = credentials.get_str("access_token").ok_or_else(|| {
            IntegrationError::InvalidCredentials("access_token is required".into())
        })?;
        let phone_number_id = credentials.get_str("phone_number_id").ok_or_else(|| {
            IntegrationError::InvalidCredentials("phone_number_id is required".into())
        })?;

        if let Some(scenario) = self.api_base.strip_prefix("mock://") {
            return match scenario {
                "success" => Ok(json!({
                    "phone_number": "+15550001111",
                    "verified_name": "Acme Support",
                    "phone_number_id": phone_number_id,
                })),
                "invalid" => Err(IntegrationError::InvalidCredentials(
                    "mock graph rejected the token".into(),
                )),
                "timeout" => Err(IntegrationError::ProviderTimeout {
                    timeout_secs: PROVIDER_TIMEOUT.as_secs(),
                }),
                other => Err(IntegrationError::Internal(anyhow::anyhow!(
                    "unknown mock scenario `{other}`"
                ))),
            };
        }

        let url = format!(
            "{}/{}?fields=display_phone_number,verified_name",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(phone_number_id)
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::InvalidCredentials(format!(
                "graph rejected the whatsapp credentials: {body}"
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "graph api returned {status} during validation"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        Ok(json!({
            "phone_number": body["display_phone_number"],
            "verified_name": body["verified_name"],
            "phone_number_id": phone_number_id,
        }))
    }

    async fn list_messages(
        &self,
        _credentials: &CredentialMap,
        _cursor: Option<&str>,
    ) -> Result<MessagePage, IntegrationError> {
        // Inbound traffic is webhook-push only; the gateway stores it as
        // it arrives and serves listings from that store.
        Err(IntegrationError::unsupported(
            Service::WhatsApp,
            "list_messages",
        ))
    }

    async fn get_message_content(
        &self,
        credentials: &CredentialMap,
        media_id: &str,
    ) -> Result<MessageContent, IntegrationError> {
        let access_token = credentials.get_str("access_token").ok_or_else(|| {
            IntegrationError::InvalidCredentials("access_token is required".into())
        })?;

        if self.api_base.starts_with("mock://") {
            return Ok(MessageContent {
                id: media_id.to_string(),
                text: None,
                attachments: vec![AttachmentRef {
                    id: media_id.to_string(),
                    filename: None,
                    mime_type: Some("image/jpeg".into()),
                    size: Some(1024),
                    download_url: Some(format!("mock://media/{media_id}")),
                }],
            });
        }

        let url = format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(media_id)
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::InvalidCredentials(format!(
                "graph rejected the media lookup: {body}"
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "graph api returned {status} resolving media {media_id}"
            )));
        }
        let media: Value = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        Ok(MessageContent {
            id: media_id.to_string(),
            text: None,
            attachments: vec![AttachmentRef {
                id: media_id.to_string(),
                filename: None,
                mime_type: media["mime_type"].as_str().map(str::to_string),
                size: media["file_size"].as_u64(),
                download_url: media["url"].as_str().map(str::to_string),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CredentialMap {
        [
            ("access_token", "EAAG-token"),
            ("phone_number_id", "123456789"),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn validate_requires_both_fields() {
        let adapter = WhatsAppAdapter::new(Client::new(), "mock://success");
        let partial: CredentialMap = [("access_token", "tok")].into_iter().collect();
        let err = adapter.validate(&partial).await.unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[tokio::test]
    async fn mock_validate_returns_display_metadata() {
        let adapter = WhatsAppAdapter::new(Client::new(), "mock://success");
        let metadata = adapter.validate(&creds()).await.unwrap();
        assert_eq!(metadata["verified_name"], "Acme Support");
        assert_eq!(metadata["phone_number_id"], "123456789");
    }

    #[tokio::test]
    async fn mock_validate_invalid_maps_to_invalid_credentials() {
        let adapter = WhatsAppAdapter::new(Client::new(), "mock://invalid");
        let err = adapter.validate(&creds()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[tokio::test]
    async fn listing_is_unsupported() {
        let adapter = WhatsAppAdapter::new(Client::new(), "mock://success");
        let err = adapter.list_messages(&creds(), None).await.unwrap_err();
        assert_eq!(err.code(), "unsupported");
    }

    #[tokio::test]
    async fn media_lookup_yields_download_ref() {
        let adapter = WhatsAppAdapter::new(Client::new(), "mock://success");
        let content = adapter.get_message_content(&creds(), "media-9").await.unwrap();
        assert_eq!(content.attachments.len(), 1);
        assert!(content.attachments[0].download_url.is_some());
    }
}
