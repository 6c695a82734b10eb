use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use intake_core::{credential_key, message_key_prefix, CredentialRecord, Service, UserId};

use crate::{CredentialStore, MessageStore, StoredMessage};

/// Dashmap-backed credential store for development and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: DashMap<String, CredentialRecord>,
    owners: DashMap<String, UserId>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn put(&self, user: &UserId, record: CredentialRecord) -> Result<()> {
        self.owners
            .insert(credential_key(user, record.service), user.clone());
        self.records
            .insert(credential_key(user, record.service), record);
        Ok(())
    }

    async fn get(&self, user: &UserId, service: Service) -> Result<Option<CredentialRecord>> {
        Ok(self
            .records
            .get(&credential_key(user, service))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, user: &UserId, service: Service) -> Result<()> {
        let key = credential_key(user, service);
        self.records.remove(&key);
        self.owners.remove(&key);
        Ok(())
    }

    async fn list(&self, user: &UserId) -> Result<Vec<CredentialRecord>> {
        let prefix = format!("users/{}/integrations/", user.as_str());
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_owner(
        &self,
        service: Service,
        key: &str,
        value: &str,
    ) -> Result<Option<UserId>> {
        for entry in self.records.iter() {
            let record = entry.value();
            if record.service == service && record.credentials.get_str(key) == Some(value) {
                return Ok(self.owners.get(entry.key()).map(|o| o.value().clone()));
            }
        }
        Ok(None)
    }
}

/// In-memory retained-window message store.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: DashMap<String, Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(
        &self,
        user: &UserId,
        service: Service,
        message: StoredMessage,
        cap: usize,
    ) -> Result<()> {
        let key = message_key_prefix(user, service);
        let mut entry = self.messages.entry(key).or_default();
        entry.retain(|m| m.message_id != message.message_id);
        entry.push(message);
        entry.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entry.truncate(cap);
        Ok(())
    }

    async fn list(
        &self,
        user: &UserId,
        service: Service,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let key = message_key_prefix(user, service);
        Ok(self
            .messages
            .get(&key)
            .map(|entry| entry.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
