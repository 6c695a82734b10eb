//! Outlook adapter: Microsoft identity platform OAuth plus the Graph
//! API for mail listing and content.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use intake_core::{CredentialMap, IntegrationError, Service};

use crate::{
    transport_error, AttachmentRef, MessageContent, MessagePage, MessageSummary, ProviderAdapter,
    TokenGrant, PROVIDER_TIMEOUT,
};

// Multi-tenant authority: both personal and work accounts sign in here.
const DEFAULT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const DEFAULT_API_BASE: &str = "https://graph.microsoft.com";
const SCOPES: &str =
    "offline_access https://graph.microsoft.com/Mail.Read https://graph.microsoft.com/User.Read";
const PAGE_SIZE: u32 = 10;

pub struct OutlookAdapter {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_url: String,
    token_url: String,
    api_base: String,
}

impl OutlookAdapter {
    pub fn from_env(http: Client) -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            http,
            client_id: std::env::var("OUTLOOK_CLIENT_ID")
                .context("OUTLOOK_CLIENT_ID must be set")?,
            client_secret: std::env::var("OUTLOOK_CLIENT_SECRET")
                .context("OUTLOOK_CLIENT_SECRET must be set")?,
            redirect_uri: std::env::var("OUTLOOK_REDIRECT_URI").unwrap_or_else(|_| {
                "http://localhost:8080/integrations/outlook/callback".into()
            }),
            auth_url: std::env::var("OUTLOOK_AUTH_URL")
                .unwrap_or_else(|_| DEFAULT_AUTH_URL.into()),
            token_url: std::env::var("OUTLOOK_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.into()),
            api_base: std::env::var("OUTLOOK_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.into()),
        })
    }

    #[cfg(test)]
    fn for_tests(token_url: &str, api_base: &str) -> Self {
        Self {
            http: Client::new(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_uri: "https://example.com/integrations/outlook/callback".into(),
            auth_url: DEFAULT_AUTH_URL.into(),
            token_url: token_url.into(),
            api_base: api_base.into(),
        }
    }

    async fn fetch_account(&self, access_token: &str) -> Result<Value, IntegrationError> {
        let url = format!("{}/v1.0/me", self.api_base.trim_end_matches('/'));
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
                "graph /me lookup rejected: {body}"
            )));
        }
        let me: Value = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;
        let email = me["mail"]
            .as_str()
            .or_else(|| me["userPrincipalName"].as_str())
            .unwrap_or_default();
        Ok(json!({ "email": email, "display_name": me["displayName"] }))
    }

    fn credentials_from_tokens(&self, tokens: &TokenResponse) -> CredentialMap {
        let mut credentials = CredentialMap::new();
        credentials.insert("access_token", tokens.access_token.clone());
        if let Some(refresh) = &tokens.refresh_token {
            credentials.insert("refresh_token", refresh.clone());
        }
        credentials.insert("token_uri", self.token_url.clone());
        credentials.insert("scopes", SCOPES);
        if let Some(expires_in) = tokens.expires_in {
            let expires_at = OffsetDateTime::now_utc().unix_timestamp() + expires_in;
            credentials.insert("expires_at", expires_at);
        }
        credentials
    }

    async fn graph_get(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<Value, IntegrationError> {
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
                "graph rejected the access token".into(),
            ));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "graph api returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))
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
impl ProviderAdapter for OutlookAdapter {
    fn service(&self) -> Service {
        Service::Outlook
    }

    fn build_authorization_url(&self, state: &str) -> Result<String, IntegrationError> {
        Ok(format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(SCOPES),
            urlencoding::encode(state)
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IntegrationError> {
        if let Some(scenario) = self.token_url.strip_prefix("mock://") {
            return mock_grant(scenario);
        }

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("scope", SCOPES),
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
                "microsoft token endpoint rejected the code: {body}"
            )));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let metadata = self.fetch_account(&tokens.access_token).await?;
        Ok(TokenGrant {
            credentials: self.credentials_from_tokens(&tokens),
            metadata,
        })
    }

    async fn refresh(
        &self,
        credentials: &CredentialMap,
    ) -> Result<Option<CredentialMap>, IntegrationError> {
        let refresh_token = credentials.get_str("refresh_token").ok_or_else(|| {
            IntegrationError::InvalidCredentials(
                "stored outlook credentials carry no refresh token; reconnect required".into(),
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
            ("scope", SCOPES),
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
                "outlook token refresh rejected: {body}"
            )));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;

        let mut refreshed = self.credentials_from_tokens(&tokens);
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

        let api_base = self.api_base.trim_end_matches('/');
        let url = match cursor {
            // Graph paginates with opaque @odata.nextLink URLs. Only follow
            // links that point back at the configured Graph host.
            Some(link) => {
                if !link.starts_with(api_base) {
                    return Err(IntegrationError::InvalidCredentials(
                        "pagination cursor does not point at the graph api".into(),
                    ));
                }
                link.to_string()
            }
            None => format!(
                "{api_base}/v1.0/me/messages?$top={PAGE_SIZE}&$select=sender,subject,bodyPreview,receivedDateTime,hasAttachments&$orderby=receivedDateTime%20desc"
            ),
        };

        let listing = self.graph_get(&url, access_token).await?;
        let messages = listing["value"]
            .as_array()
            .map(|entries| entries.iter().map(summary_from_graph).collect())
            .unwrap_or_default();

        Ok(MessagePage {
            messages,
            next_cursor: listing["@odata.nextLink"].as_str().map(str::to_string),
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

        let api_base = self.api_base.trim_end_matches('/');
        let message = self
            .graph_get(
                &format!(
                    "{api_base}/v1.0/me/messages/{}?$select=body,hasAttachments",
                    urlencoding::encode(message_id)
                ),
                access_token,
            )
            .await?;

        let text = message["body"]["content"].as_str().map(str::to_string);
        let mut attachments = Vec::new();
        if message["hasAttachments"].as_bool().unwrap_or(false) {
            let listing = self
                .graph_get(
                    &format!(
                        "{api_base}/v1.0/me/messages/{}/attachments?$select=id,name,contentType,size",
                        urlencoding::encode(message_id)
                    ),
                    access_token,
                )
                .await?;
            if let Some(entries) = listing["value"].as_array() {
                for entry in entries {
                    let Some(id) = entry["id"].as_str() else {
                        continue;
                    };
                    attachments.push(AttachmentRef {
                        id: id.to_string(),
                        filename: entry["name"].as_str().map(str::to_string),
                        mime_type: entry["contentType"].as_str().map(str::to_string),
                        size: entry["size"].as_u64(),
                        download_url: None,
                    });
                }
            }
        }

        Ok(MessageContent {
            id: message_id.to_string(),
            text,
            attachments,
        })
    }
}

fn require_access_token(credentials: &CredentialMap) -> Result<&str, IntegrationError> {
    credentials.get_str("access_token").ok_or_else(|| {
        IntegrationError::InvalidCredentials(
            "stored outlook credentials carry no access token".into(),
        )
    })
}

fn summary_from_graph(entry: &Value) -> MessageSummary {
    MessageSummary {
        id: entry["id"].as_str().unwrap_or_default().to_string(),
        from: entry["sender"]["emailAddress"]["address"]
            .as_str()
            .map(str::to_string),
        subject: entry["subject"].as_str().map(str::to_string),
        snippet: entry["bodyPreview"].as_str().map(str::to_string),
        timestamp: entry["receivedDateTime"].as_str().map(str::to_string),
        has_attachments: entry["hasAttachments"].as_bool().unwrap_or(false),
    }
}

fn mock_grant(scenario: &str) -> Result<TokenGrant, IntegrationError> {
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
                subject: Some("Quarterly report".into()),
                snippet: Some("Please find attached".into()),
                timestamp: Some("2026-01-05T09:00:00Z".into()),
                has_attachments: true,
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
    fn authorization_url_requests_offline_access() {
        let adapter = OutlookAdapter::for_tests("mock://success", "mock://success");
        let url = adapter.build_authorization_url("state-xyz").unwrap();
        assert!(url.starts_with(DEFAULT_AUTH_URL));
        assert!(url.contains("state=state-xyz"));
        assert!(url.contains("offline_access"));
    }

    #[tokio::test]
    async fn mock_exchange_yields_refreshable_grant() {
        let adapter = OutlookAdapter::for_tests("mock://success", "mock://success");
        let grant = adapter.exchange_code("code").await.unwrap();
        assert!(grant.credentials.get_str("refresh_token").is_some());
        assert_eq!(grant.metadata["email"], "user@example.com");
    }

    #[tokio::test]
    async fn foreign_pagination_cursor_is_rejected() {
        let adapter = OutlookAdapter::for_tests("mock://success", "https://graph.microsoft.com");
        let creds: CredentialMap = [("access_token", "tok")].into_iter().collect();
        let err = adapter
            .list_messages(&creds, Some("https://evil.example.com/v1.0/me/messages"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[test]
    fn graph_summary_mapping() {
        let entry = serde_json::json!({
            "id": "AAMk",
            "sender": { "emailAddress": { "address": "boss@corp.example" } },
            "subject": "Quarterly numbers",
            "bodyPreview": "Numbers attached",
            "receivedDateTime": "2026-02-01T10:00:00Z",
            "hasAttachments": true
        });
        let summary = summary_from_graph(&entry);
        assert_eq!(summary.id, "AAMk");
        assert_eq!(summary.from.as_deref(), Some("boss@corp.example"));
        assert!(summary.has_attachments);
    }
}
