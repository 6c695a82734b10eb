//! Telegram adapter. Credentials are a bot token supplied directly and
//! validated with `getMe`. Listing maps `getUpdates` onto the shared
//! page shape; content lookup treats the id as a `file_id` and resolves
//! it to a download URL via `getFile`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use intake_core::{CredentialMap, IntegrationError, Service};

use crate::{
    transport_error, AttachmentRef, MessageContent, MessagePage, MessageSummary, ProviderAdapter,
    PROVIDER_TIMEOUT,
};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const PAGE_SIZE: u32 = 10;

/// Bot API envelope: `{ ok, result?, description? }`. Missing fields
/// deserialize to `None`.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

pub struct TelegramAdapter {
    http: Client,
    api_base: String,
}

impl TelegramAdapter {
    pub fn from_env(http: Client) -> Self {
        Self {
            api_base: std::env::var("TELEGRAM_API_BASE")
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

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        bot_token: &str,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, IntegrationError> {
        let url = format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            bot_token,
            method
        );
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|err| IntegrationError::Internal(anyhow::Error::new(err)))?;
        if !envelope.ok {
            return Err(IntegrationError::InvalidCredentials(
                envelope
                    .description
                    .unwrap_or_else(|| format!("telegram {method} call failed")),
            ));
        }
        envelope.result.ok_or_else(|| {
            IntegrationError::Internal(anyhow::anyhow!("telegram {method} returned ok without result"))
        })
    }
}

fn require_bot_token(credentials: &CredentialMap) -> Result<&str, IntegrationError> {
    credentials
        .get_str("bot_token")
        .ok_or_else(|| IntegrationError::InvalidCredentials("bot_token is required".into()))
}

#[async_trait]
impl ProviderAdapter for TelegramAdapter {
    fn service(&self) -> Service {
        Service::Telegram
    }

    async fn validate(&self, credentials: &CredentialMap) -> Result<Value, IntegrationError> {
        let bot_token = require_bot_token(credentials)?;

        if let Some(scenario) = self.api_base.strip_prefix("mock://") {
            return match scenario {
                "success" => Ok(json!({
                    "bot_username": "intake_bot",
                    "bot_name": "Intake Bot",
                })),
                "invalid" => Err(IntegrationError::InvalidCredentials(
                    "mock getMe rejected the token".into(),
                )),
                "timeout" => Err(IntegrationError::ProviderTimeout {
                    timeout_secs: PROVIDER_TIMEOUT.as_secs(),
                }),
                other => Err(IntegrationError::Internal(anyhow::anyhow!(
                    "unknown mock scenario `{other}`"
                ))),
            };
        }

        let me: Value = self.call(bot_token, "getMe", &[]).await?;
        Ok(json!({
            "bot_username": me["username"],
            "bot_name": me["first_name"],
        }))
    }

    async fn list_messages(
        &self,
        credentials: &CredentialMap,
        cursor: Option<&str>,
    ) -> Result<MessagePage, IntegrationError> {
        let bot_token = require_bot_token(credentials)?;

        if let Some(scenario) = self.api_base.strip_prefix("mock://") {
            return match scenario {
                "success" => Ok(MessagePage {
                    messages: vec![MessageSummary {
                        id: "42".into(),
                        from: Some("alice".into()),
                        subject: None,
                        snippet: Some("here is the document".into()),
                        timestamp: Some("1767600000".into()),
                        has_attachments: true,
                    }],
                    next_cursor: Some("1001".into()),
                }),
                other => Err(IntegrationError::Internal(anyhow::anyhow!(
                    "unknown mock scenario `{other}`"
                ))),
            };
        }

        let mut query = vec![("limit", PAGE_SIZE.to_string())];
        if let Some(offset) = cursor {
            let offset: i64 = offset.parse().map_err(|_| {
                IntegrationError::InvalidCredentials("pagination cursor is not numeric".into())
            })?;
            query.push(("offset", offset.to_string()));
        }

        let updates: Vec<Value> = self.call(bot_token, "getUpdates", &query).await?;
        let mut messages = Vec::new();
        let mut last_update_id = None;
        for update in &updates {
            if let Some(update_id) = update["update_id"].as_i64() {
                last_update_id = Some(update_id);
            }
            let message = &update["message"];
            if message.is_null() {
                continue;
            }
            messages.push(summary_from_update(message));
        }

        Ok(MessagePage {
            messages,
            next_cursor: last_update_id.map(|id| (id + 1).to_string()),
        })
    }

    async fn get_message_content(
        &self,
        credentials: &CredentialMap,
        file_id: &str,
    ) -> Result<MessageContent, IntegrationError> {
        let bot_token = require_bot_token(credentials)?;

        if self.api_base.starts_with("mock://") {
            return Ok(MessageContent {
                id: file_id.to_string(),
                text: None,
                attachments: vec![AttachmentRef {
                    id: file_id.to_string(),
                    filename: Some("document.pdf".into()),
                    mime_type: None,
                    size: Some(512),
                    download_url: Some(format!("mock://file/{file_id}")),
                }],
            });
        }

        let file: Value = self
            .call(bot_token, "getFile", &[("file_id", file_id.to_string())])
            .await?;
        let download_url = file["file_path"].as_str().map(|path| {
            format!(
                "{}/file/bot{}/{}",
                self.api_base.trim_end_matches('/'),
                bot_token,
                path
            )
        });

        Ok(MessageContent {
            id: file_id.to_string(),
            text: None,
            attachments: vec![AttachmentRef {
                id: file_id.to_string(),
                filename: file["file_path"]
                    .as_str()
                    .and_then(|p| p.rsplit('/').next())
                    .map(str::to_string),
                mime_type: None,
                size: file["file_size"].as_u64(),
                download_url,
            }],
        })
    }
}

fn summary_from_update(message: &Value) -> MessageSummary {
    let from = message["from"]["username"]
        .as_str()
        .map(str::to_string)
        .or_else(|| message["from"]["id"].as_i64().map(|id| id.to_string()));
    let has_attachments =
        !message["document"].is_null() || message["photo"].as_array().is_some_and(|p| !p.is_empty());
    MessageSummary {
        id: message["message_id"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_default(),
        from,
        subject: None,
        snippet: message["text"]
            .as_str()
            .or_else(|| message["caption"].as_str())
            .map(str::to_string),
        timestamp: message["date"].as_i64().map(|d| d.to_string()),
        has_attachments,
    }
}
