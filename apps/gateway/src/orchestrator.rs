//! Connection state machine.
//!
//! Disconnected -> Pending -> Connected for OAuth services, with the
//! pending entry held server-side under the state token's `jti` and
//! consumed exactly once by the callback. Direct-credential services go
//! straight to Connected after a validation call. The credential store
//! is the single source of truth; nothing here caches records.

use std::time::Duration as StdDuration;

use metrics::counter;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use intake_core::{
    ConnectFlow, ConnectionSummary, CredentialMap, CredentialRecord, IntegrationError, Service,
    UserId,
};
use intake_providers::{MessageContent, MessagePage, MessageSummary, ProviderRegistry};
use intake_security::{PendingAuth, SharedPendingStore, StateClaims, StateSigner};
use intake_store::{SharedCredentialStore, SharedMessageStore, StoredMessage};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub state_ttl_secs: u64,
    pub refresh_skew_secs: i64,
    pub message_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: 600,
            refresh_skew_secs: 300,
            message_cap: 10,
        }
    }
}

/// What `initiate_connect` hands back: a browser redirect for OAuth
/// services, or an immediately-established connection for direct ones.
#[derive(Debug)]
pub enum ConnectOutcome {
    Redirect { authorization_url: String },
    Connected { service: Service, metadata: Value },
}

pub struct Orchestrator {
    registry: ProviderRegistry,
    credentials: SharedCredentialStore,
    messages: SharedMessageStore,
    pending: SharedPendingStore,
    signer: StateSigner,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: ProviderRegistry,
        credentials: SharedCredentialStore,
        messages: SharedMessageStore,
        pending: SharedPendingStore,
        signer: StateSigner,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            credentials,
            messages,
            pending,
            signer,
            config,
        }
    }

    /// Starts a connection. OAuth services get an authorization URL and
    /// a pending entry; direct services validate the supplied credentials
    /// and persist the record in one step.
    pub async fn initiate_connect(
        &self,
        user: &UserId,
        service: Service,
        body: Option<Value>,
    ) -> Result<ConnectOutcome, IntegrationError> {
        let adapter = self.registry.get(service)?;
        match service.flow() {
            ConnectFlow::OAuth => {
                let claims = StateClaims::new(
                    user,
                    service,
                    Duration::seconds(self.config.state_ttl_secs as i64),
                );
                let state = self
                    .signer
                    .sign(&claims)
                    .map_err(IntegrationError::Internal)?;
                self.pending
                    .put(
                        &claims.jti,
                        PendingAuth::new(
                            user.clone(),
                            service,
                            StdDuration::from_secs(self.config.state_ttl_secs),
                        ),
                    )
                    .await?;
                let authorization_url = adapter.build_authorization_url(&state)?;
                counter!("connect_initiated_total", "service" => service.as_str()).increment(1);
                Ok(ConnectOutcome::Redirect { authorization_url })
            }
            ConnectFlow::Direct => {
                let credentials = credentials_from_body(body)?;
                let metadata = adapter.validate(&credentials).await?;
                let record = CredentialRecord::new(service, credentials, metadata.clone());
                self.credentials.put(user, record).await?;
                counter!("connect_success_total", "service" => service.as_str()).increment(1);
                tracing::info!(user = %user, service = %service, "service connected");
                Ok(ConnectOutcome::Connected { service, metadata })
            }
        }
    }

    /// Redeems an OAuth callback. Verification order matters: signature
    /// and expiry first, then the single-use pending entry, then the code
    /// exchange. Nothing is written to the store unless every step
    /// succeeds.
    pub async fn complete_oauth_callback(
        &self,
        path_service: Service,
        code: &str,
        state: &str,
    ) -> Result<(UserId, Service), IntegrationError> {
        let result = self.redeem_callback(path_service, code, state).await;
        match &result {
            Ok((user, service)) => {
                counter!("oauth_callback_success_total", "service" => service.as_str())
                    .increment(1);
                tracing::info!(user = %user, service = %service, "oauth connection established");
            }
            Err(err) => {
                counter!("oauth_callback_failure_total", "error" => err.code()).increment(1);
                match err {
                    IntegrationError::StateMismatch(reason) => {
                        tracing::warn!(service = %path_service, reason = %reason,
                            "rejected oauth callback state token");
                    }
                    other => {
                        tracing::error!(service = %path_service, error = %other,
                            "oauth callback failed");
                    }
                }
            }
        }
        result
    }

    async fn redeem_callback(
        &self,
        path_service: Service,
        code: &str,
        state: &str,
    ) -> Result<(UserId, Service), IntegrationError> {
        let claims = self
            .signer
            .verify(state)
            .map_err(|err| IntegrationError::StateMismatch(err.to_string()))?;
        if claims.service != path_service {
            return Err(IntegrationError::StateMismatch(format!(
                "state token was issued for {}, callback arrived on {path_service}",
                claims.service
            )));
        }
        let pending = self.pending.take(&claims.jti).await?.ok_or_else(|| {
            IntegrationError::StateMismatch("state token expired or already used".into())
        })?;
        if pending.user.as_str() != claims.sub || pending.service != claims.service {
            return Err(IntegrationError::StateMismatch(
                "state token does not match its pending entry".into(),
            ));
        }

        let adapter = self.registry.get(claims.service)?;
        let grant = adapter.exchange_code(code).await?;
        let record = CredentialRecord::new(claims.service, grant.credentials, grant.metadata);
        self.credentials.put(&pending.user, record).await?;
        Ok((pending.user, claims.service))
    }

    /// Deletes the record outright. Idempotent: disconnecting an absent
    /// service succeeds.
    pub async fn disconnect(
        &self,
        user: &UserId,
        service: Service,
    ) -> Result<(), IntegrationError> {
        self.credentials.delete(user, service).await?;
        counter!("disconnect_total", "service" => service.as_str()).increment(1);
        tracing::info!(user = %user, service = %service, "service disconnected");
        Ok(())
    }

    pub async fn list_connections(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConnectionSummary>, IntegrationError> {
        let records = self.credentials.list(user).await?;
        Ok(records.iter().map(CredentialRecord::summary).collect())
    }

    pub async fn connection_status(
        &self,
        user: &UserId,
        service: Service,
    ) -> Result<Option<Value>, IntegrationError> {
        let record = self.credentials.get(user, service).await?;
        Ok(record.map(|r| r.metadata))
    }

    /// Returns the live credential map for a pipeline call, refreshing
    /// OAuth tokens that are within the expiry skew window. Refresh
    /// rewrites `credentials` and `updated_at` only.
    pub async fn resolve_credentials(
        &self,
        user: &UserId,
        service: Service,
    ) -> Result<CredentialMap, IntegrationError> {
        let mut record = self
            .credentials
            .get(user, service)
            .await?
            .ok_or(IntegrationError::NotConnected(service))?;

        if service.flow() == ConnectFlow::OAuth {
            if let Some(expires_at) = record.credentials.get_i64("expires_at") {
                let now = OffsetDateTime::now_utc().unix_timestamp();
                if expires_at - now <= self.config.refresh_skew_secs {
                    let adapter = self.registry.get(service)?;
                    if let Some(fresh) = adapter.refresh(&record.credentials).await? {
                        record.replace_credentials(fresh);
                        self.credentials.put(user, record.clone()).await?;
                        counter!("token_refresh_total", "service" => service.as_str())
                            .increment(1);
                        tracing::debug!(user = %user, service = %service, "refreshed oauth tokens");
                    }
                }
            }
        }

        Ok(record.credentials)
    }

    /// Pipeline entry point: lists messages for a connected service.
    /// WhatsApp serves from the webhook-fed retained window; everything
    /// else pulls from the provider.
    pub async fn fetch_messages(
        &self,
        user: &UserId,
        service: Service,
        cursor: Option<&str>,
    ) -> Result<MessagePage, IntegrationError> {
        let credentials = self.resolve_credentials(user, service).await?;
        if service == Service::WhatsApp {
            let stored = self
                .messages
                .list(user, service, self.config.message_cap)
                .await?;
            return Ok(MessagePage {
                messages: stored.iter().map(summary_from_stored).collect(),
                next_cursor: None,
            });
        }
        self.registry
            .get(service)?
            .list_messages(&credentials, cursor)
            .await
    }

    pub async fn fetch_message_content(
        &self,
        user: &UserId,
        service: Service,
        message_id: &str,
    ) -> Result<MessageContent, IntegrationError> {
        let credentials = self.resolve_credentials(user, service).await?;
        self.registry
            .get(service)?
            .get_message_content(&credentials, message_id)
            .await
    }

    /// Routes a webhook-delivered WhatsApp message to its owning user by
    /// the stored phone number id. Returns false when no tenant owns the
    /// number (the message is dropped).
    pub async fn route_whatsapp_inbound(
        &self,
        phone_number_id: &str,
        message: StoredMessage,
    ) -> Result<bool, IntegrationError> {
        let Some(user) = self
            .credentials
            .find_owner(Service::WhatsApp, "phone_number_id", phone_number_id)
            .await?
        else {
            tracing::debug!(phone_number_id, "inbound whatsapp message for unknown number");
            return Ok(false);
        };
        self.messages
            .save(&user, Service::WhatsApp, message, self.config.message_cap)
            .await?;
        counter!("whatsapp_inbound_total").increment(1);
        Ok(true)
    }
}

fn credentials_from_body(body: Option<Value>) -> Result<CredentialMap, IntegrationError> {
    let Some(Value::Object(map)) = body else {
        return Err(IntegrationError::InvalidCredentials(
            "request body must be a JSON object of credentials".into(),
        ));
    };
    let credentials: CredentialMap = map.into_iter().collect();
    if credentials.is_empty() {
        return Err(IntegrationError::InvalidCredentials(
            "credentials must not be empty".into(),
        ));
    }
    Ok(credentials)
}

fn summary_from_stored(message: &StoredMessage) -> MessageSummary {
    MessageSummary {
        id: message.message_id.clone(),
        from: Some(message.from.clone()),
        subject: None,
        snippet: message.text.clone(),
        timestamp: Some(message.timestamp.clone()),
        has_attachments: message.media.is_some(),
    }
}
