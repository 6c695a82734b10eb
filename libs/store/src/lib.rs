//! Persistence for the intake service.
//!
//! Two traits live here: [`CredentialStore`] (one record per user and
//! service) and [`MessageStore`] (a small retained window of inbound
//! webhook messages per user). Both ship an in-memory implementation for
//! development and tests, and a NATS JetStream KV implementation for
//! deployments. Key scoping comes from `intake_core::credential_key`; no
//! caller assembles raw keys.

mod memory;
#[cfg(feature = "nats-store")]
mod nats_kv;

use std::{env, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use intake_core::{CredentialRecord, Service, UserId};

pub use memory::{MemoryCredentialStore, MemoryMessageStore};
#[cfg(feature = "nats-store")]
pub use nats_kv::{KvCredentialStore, KvMessageStore};

/// Shared handles used across the gateway.
pub type SharedCredentialStore = Arc<dyn CredentialStore>;
pub type SharedMessageStore = Arc<dyn MessageStore>;

/// Single source of truth for connections. Puts are full overwrites
/// (last writer wins); deletes are idempotent.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put(&self, user: &UserId, record: CredentialRecord) -> Result<()>;
    async fn get(&self, user: &UserId, service: Service) -> Result<Option<CredentialRecord>>;
    async fn delete(&self, user: &UserId, service: Service) -> Result<()>;
    /// All of the user's records, in no particular order. Absent services
    /// simply do not appear.
    async fn list(&self, user: &UserId) -> Result<Vec<CredentialRecord>>;
    /// Finds the user owning a record whose credential field `key` equals
    /// `value`. Used to route provider webhooks to their tenant.
    async fn find_owner(
        &self,
        service: Service,
        key: &str,
        value: &str,
    ) -> Result<Option<UserId>>;
}

/// Inbound message retained from a provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub from: String,
    /// Provider-side timestamp, kept as received (epoch seconds for
    /// WhatsApp).
    pub timestamp: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    pub raw: Value,
}

/// Retained-window message store: keeps the newest `cap` messages per
/// `(user, service)` and drops the rest.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(
        &self,
        user: &UserId,
        service: Service,
        message: StoredMessage,
        cap: usize,
    ) -> Result<()>;
    /// Newest first, at most `limit` entries.
    async fn list(
        &self,
        user: &UserId,
        service: Service,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;
}

pub fn shared_memory_credential_store() -> SharedCredentialStore {
    Arc::new(MemoryCredentialStore::new())
}

pub fn shared_memory_message_store() -> SharedMessageStore {
    Arc::new(MemoryMessageStore::new())
}

/// Builds the credential store from the environment.
///
/// `CREDENTIALS_NATS_URL` selects the JetStream KV backend; without it the
/// in-memory store is used (development only, records do not survive a
/// restart).
pub async fn credential_store_from_env() -> Result<SharedCredentialStore> {
    match env::var("CREDENTIALS_NATS_URL") {
        Ok(url) => {
            let bucket =
                env::var("CREDENTIALS_BUCKET").unwrap_or_else(|_| "intake-credentials".into());
            build_kv_credential_store(&url, &bucket).await
        }
        Err(_) => {
            tracing::warn!("CREDENTIALS_NATS_URL not set; using in-memory credential store");
            Ok(shared_memory_credential_store())
        }
    }
}

/// Same selection for the message store, sharing the NATS connection
/// settings.
pub async fn message_store_from_env() -> Result<SharedMessageStore> {
    match env::var("CREDENTIALS_NATS_URL") {
        Ok(url) => {
            let bucket = env::var("MESSAGES_BUCKET").unwrap_or_else(|_| "intake-messages".into());
            build_kv_message_store(&url, &bucket).await
        }
        Err(_) => Ok(shared_memory_message_store()),
    }
}

#[cfg(feature = "nats-store")]
async fn build_kv_credential_store(url: &str, bucket: &str) -> Result<SharedCredentialStore> {
    let store = KvCredentialStore::connect(url, bucket).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "nats-store"))]
async fn build_kv_credential_store(_url: &str, _bucket: &str) -> Result<SharedCredentialStore> {
    tracing::warn!("nats-store feature disabled; using in-memory credential store");
    Ok(shared_memory_credential_store())
}

#[cfg(feature = "nats-store")]
async fn build_kv_message_store(url: &str, bucket: &str) -> Result<SharedMessageStore> {
    let store = KvMessageStore::connect(url, bucket).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "nats-store"))]
async fn build_kv_message_store(_url: &str, _bucket: &str) -> Result<SharedMessageStore> {
    Ok(shared_memory_message_store())
}
