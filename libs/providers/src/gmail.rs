//! Gmail adapter: Google OAuth code flow plus the Gmail REST API for
//! listing messages and pulling bodies/attachment references.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use intake_core::{CredentialMap, IntegrationError, Service};

use crate::{
    transport_error, AttachmentRef, MessageContent, MessagePage, MessageSummary, ProviderAdapter,
    TokenGrant, PROVIDER_TIMEOUT,
};

const SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com";
const PAGE_SIZE: u32 = 10;

pub struct GmailAdapter {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_url: String,
    token_url: String,
    api_base: String,
}

impl GmailAdapter {
    pub fn from_env(http: Client) -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            http,
            client_id: std::env::var("GMAIL_CLIENT_ID").context("GMAIL_CLIENT_ID must be set")?,
            client_secret: std::env::var("GMAIL_CLIENT_SECRET")
                .context("GMAIL_CLIENT_SECRET must be set")?,
            redirect_uri: std::env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| {
                "http://localhost:8080/integrations/gmail/callback".into()
            }),
            auth_url: std::env::var("GMAIL_AUTH_URL").unwrap_or_else(|_| DEFAULT_AUTH_URL.into()),
            token_url: std::env::var("GMAIL_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.into()),
            api_base: std::env::var("GMAIL_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.into()),
        })
    }

    #[cfg(test)]
    fn for_tests(token_url: &str, api_base: &str) -> Self {
        Self {
            http: Client::new(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://example.com/integrations/gmail/callback".into(),
            auth_url: DEFAULT_AUTH_URL.into(),
            token_url: token_url.into(),
            api_base: api_base.into(),
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<String, IntegrationError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Profile {
            email_address: String,
        }

        let url = format!(
            "{}/gmail/v1/users/me/profile",
            self.api_base.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::InvalidCredentials(format!(
                "gmail profile lookup rejected: {body}"
            )));
        }
        let profile: Profile = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;
        Ok(profile.email_address)
    }

    fn credentials_from_tokens(&self, tokens: &TokenResponse) -> CredentialMap {
        let mut credentials = CredentialMap::new();
        credentials.insert("access_token", tokens.access_token.clone());
        if let Some(refresh) = &tokens.refresh_token {
            credentials.insert("refresh_token", refresh.clone());
        }
        credentials.insert("token_uri", self.token_url.clone());
        credentials.insert("scopes", json!([SCOPE]));
        if let Some(expires_in) = tokens.expires_in {
            let expires_at = OffsetDateTime::now_utc().unix_timestamp() + expires_in;
            credentials.insert("expires_at", expires_at);
        }
        credentials
    }

    async fn message_summary(
        &self,
        access_token: &str,
        id: &str,
    ) -> Result<MessageSummary, IntegrationError> {
        let url = format!(
            "{}/gmail/v1/users/me/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=Subject",
            self.api_base.trim_end_matches('/'),
            id
        );
        let message: Value = self
            .api_get(&url, access_token)
            .await?
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let headers = message["payload"]["headers"].as_array().cloned().unwrap_or_default();
        let header = |name: &str| {
            headers
                .iter()
                .find(|h| h["name"].as_str() == Some(name))
                .and_then(|h| h["value"].as_str())
                .map(str::to_string)
        };

        Ok(MessageSummary {
            id: id.to_string(),
            from: header("From"),
            subject: header("Subject"),
            snippet: message["snippet"].as_str().map(str::to_string),
            timestamp: message["internalDate"].as_str().map(str::to_string),
            has_attachments: false,
        })
    }

    async fn api_get(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<reqwest::Response, IntegrationError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IntegrationError::InvalidCredentials(
                "gmail rejected the access token".into(),
            ));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "gmail api returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn service(&self) -> Service {
        Service::Gmail
    }

    fn build_authorization_url(&self, state: &str) -> Result<String, IntegrationError> {
        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&include_granted_scopes=true&prompt=consent&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(SCOPE),
            urlencoding::encode(state)
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IntegrationError> {
        if let Some(scenario) = self.token_url.strip_prefix("mock://") {
            return mock_grant(scenario, code);
        }

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::ExchangeFailed(format!(
                "google token endpoint rejected the code: {body}"
            )));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let email = self.fetch_profile(&tokens.access_token).await?;
        Ok(TokenGrant {
            credentials: self.credentials_from_tokens(&tokens),
            metadata: json!({ "email": email }),
        })
    }

    async fn refresh(
        &self,
        credentials: &CredentialMap,
    ) -> Result<Option<CredentialMap>, IntegrationError> {
        let refresh_token = credentials.get_str("refresh_token").ok_or_else(|| {
            IntegrationError::InvalidCredentials(
                "stored gmail credentials carry no refresh token; reconnect required".into(),
            )
        })?;

        if let Some(scenario) = self.token_url.strip_prefix("mock://") {
            return match scenario {
                "success" => {
                    let mut refreshed = credentials.clone();
                    refreshed.insert("access_token", "refreshed-token");
                    Ok(Some(refreshed))
                }
                _ => Err(IntegrationError::InvalidCredentials(
                    "mock refresh rejected".into(),
                )),
            };
        }

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::InvalidCredentials(format!(
                "gmail token refresh rejected: {body}"
            )));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let mut refreshed = self.credentials_from_tokens(&tokens);
        // Google omits the refresh token on refresh responses; keep the one
        // we already have.
        if refreshed.get_str("refresh_token").is_none() {
            refreshed.insert("refresh_token", refresh_token);
        }
        Ok(Some(refreshed))
    }

    async fn list_messages(
        &self,
        credentials: &CredentialMap,
        cursor: Option<&str>,
    ) -> Result<MessagePage, IntegrationError> {
        let access_token = require_access_token(credentials)?;
        if let Some(scenario) = self.api_base.strip_prefix("mock://") {
            return mock_page(scenario);
        }

        let mut url = format!(
            "{}/gmail/v1/users/me/messages?maxResults={}",
            self.api_base.trim_end_matches('/'),
            PAGE_SIZE
        );
        if let Some(token) = cursor {
            url.push_str("&pageToken=");
            url.push_str(&urlencoding::encode(token));
        }

        let listing: Value = self
            .api_get(&url, access_token)
            .await?
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let ids: Vec<String> = listing["messages"]
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            messages.push(self.message_summary(access_token, id).await?);
        }

        Ok(MessagePage {
            messages,
            next_cursor: listing["nextPageToken"].as_str().map(str::to_string),
        })
    }

    async fn get_message_content(
        &self,
        credentials: &CredentialMap,
        message_id: &str,
    ) -> Result<MessageContent, IntegrationError> {
        let access_token = require_access_token(credentials)?;
        if self.api_base.starts_with("mock://") {
            return Ok(MessageContent {
                id: message_id.to_string(),
                text: Some("mock body".into()),
                attachments: Vec::new(),
            });
        }

        let url = format!(
            "{}/gmail/v1/users/me/messages/{}?format=full",
            self.api_base.trim_end_matches('/'),
            message_id
        );
        let message: Value = self
            .api_get(&url, access_token)
            .await?
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let mut text = String::new();
        let mut attachments = Vec::new();
        collect_parts(&message["payload"], &mut text, &mut attachments);

        Ok(MessageContent {
            id: message_id.to_string(),
            text: (!text.is_empty()).then_some(text),
            attachments,
        })
    }
}

fn require_access_token(credentials: &CredentialMap) -> Result<&str, IntegrationError> {
    credentials.get_str("access_token").ok_or_else(|| {
        IntegrationError::InvalidCredentials("stored gmail credentials carry no access token".into())
    })
}

/// Depth-first walk over a Gmail payload tree, accumulating decoded
/// `text/plain` bodies and attachment references.
fn collect_parts(part: &Value, text: &mut String, attachments: &mut Vec<AttachmentRef>) {
    let filename = part["filename"].as_str().unwrap_or_default();
    let mime_type = part["mimeType"].as_str().unwrap_or_default();

    if !filename.is_empty() {
        if let Some(attachment_id) = part["body"]["attachmentId"].as_str() {
            attachments.push(AttachmentRef {
                id: attachment_id.to_string(),
                filename: Some(filename.to_string()),
                mime_type: Some(mime_type.to_string()),
                size: part["body"]["size"].as_u64(),
                download_url: None,
            });
        }
    } else if mime_type == "text/plain" {
        if let Some(data) = part["body"]["data"].as_str() {
            if let Ok(decoded) = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')) {
                text.push_str(&String::from_utf8_lossy(&decoded));
            }
        }
    }

    if let Some(parts) = part["parts"].as_array() {
        for child in parts {
            collect_parts(child, text, attachments);
        }
    }
}

fn mock_grant(scenario: &str, _code: &str) -> Result<TokenGrant, IntegrationError> {
    match scenario {
        "success" => {
            let credentials: CredentialMap = [
                ("access_token", "mock-access"),
                ("refresh_token", "mock-refresh"),
            ]
            .into_iter()
            .collect();
            Ok(TokenGrant {
                credentials,
                metadata: json!({ "email": "user@example.com" }),
            })
        }
        "reject" => Err(IntegrationError::ExchangeFailed(
            "mock token endpoint rejected the code".into(),
        )),
        "timeout" => Err(IntegrationError::ProviderTimeout {
            timeout_secs: PROVIDER_TIMEOUT.as_secs(),
        }),
        other => Err(IntegrationError::Internal(anyhow::anyhow!(
            "unknown mock scenario `{other}`"
        ))),
    }
}

fn mock_page(scenario: &str) -> Result<MessagePage, IntegrationError> {
    match scenario {
        "success" => Ok(MessagePage {
            messages: vec![MessageSummary {
                id: "mock-1".into(),
                from: Some("sender@example.com".into()),
                subject: Some("Invoice".into()),
                snippet: None,
                timestamp: None,
                has_attachments: false,
            }],
            next_cursor: None,
        }),
        other => Err(IntegrationError::Internal(anyhow::anyhow!(
            "unknown mock scenario `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_embeds_state_and_scope() {
        let adapter = GmailAdapter::for_tests("mock://success", "mock://success");
        let url = adapter.build_authorization_url("state-abc").unwrap();
        assert!(url.starts_with(DEFAULT_AUTH_URL));
        assert!(url.contains("state=state-abc"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains(&*urlencoding::encode(SCOPE)));
    }

    #[tokio::test]
    async fn mock_exchange_returns_grant_with_email() {
        let adapter = GmailAdapter::for_tests("mock://success", "mock://success");
        let grant = adapter.exchange_code("code").await.unwrap();
        assert_eq!(grant.metadata["email"], "user@example.com");
        assert_eq!(
            grant.credentials.get_str("access_token"),
            Some("mock-access")
        );
    }

    #[tokio::test]
    async fn mock_exchange_rejection_is_exchange_failed() {
        let adapter = GmailAdapter::for_tests("mock://reject", "mock://success");
        let err = adapter.exchange_code("code").await.unwrap_err();
        assert_eq!(err.code(), "exchange_failed");
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails() {
        let adapter = GmailAdapter::for_tests("mock://success", "mock://success");
        let creds: CredentialMap = [("access_token", "only")].into_iter().collect();
        let err = adapter.refresh(&creds).await.unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[tokio::test]
    async fn mock_refresh_keeps_refresh_token() {
        let adapter = GmailAdapter::for_tests("mock://success", "mock://success");
        let creds: CredentialMap = [
            ("access_token", "stale"),
            ("refresh_token", "keep-me"),
        ]
        .into_iter()
        .collect();
        let refreshed = adapter.refresh(&creds).await.unwrap().unwrap();
        assert_eq!(refreshed.get_str("access_token"), Some("refreshed-token"));
        assert_eq!(refreshed.get_str("refresh_token"), Some("keep-me"));
    }

    #[test]
    fn collect_parts_decodes_text_and_references_attachments() {
        let payload = serde_json::json!({
            "mimeType": "multipart/mixed",
            "filename": "",
            "parts": [
                {
                    "mimeType": "text/plain",
                    "filename": "",
                    "body": { "data": URL_SAFE_NO_PAD.encode("hello world") }
                },
                {
                    "mimeType": "application/pdf",
                    "filename": "invoice.pdf",
                    "body": { "attachmentId": "att-1", "size": 2048 }
                }
            ]
        });
        let mut text = String::new();
        let mut attachments = Vec::new();
        collect_parts(&payload, &mut text, &mut attachments);
        assert_eq!(text, "hello world");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].id, "att-1");
        assert_eq!(attachments[0].filename.as_deref(), Some("invoice.pdf"));
        assert_eq!(attachments[0].size, Some(2048));
    }
}
