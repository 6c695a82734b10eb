use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    context::KeyValueErrorKind,
    kv,
};
use async_trait::async_trait;
use futures::TryStreamExt;

use intake_core::{credential_key, message_key_prefix, CredentialRecord, Service, UserId};

use crate::{CredentialStore, MessageStore, StoredMessage};

async fn open_bucket(js: &jetstream::Context, bucket: &str) -> Result<kv::Store> {
    match js.get_key_value(bucket).await {
        Ok(store) => Ok(store),
        Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                max_age: Duration::from_secs(0),
                ..Default::default()
            })
            .await
            .with_context(|| format!("create kv bucket {bucket}")),
        Err(err) => Err(err.into()),
    }
}

/// Credential store on a JetStream KV bucket. One key per
/// `(user, service)`, JSON-encoded record values, purge on delete so no
/// tombstone survives a disconnect.
pub struct KvCredentialStore {
    bucket: kv::Store,
}

impl KvCredentialStore {
    pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connect to nats at {url}"))?;
        let js = jetstream::new(client);
        Ok(Self {
            bucket: open_bucket(&js, bucket).await?,
        })
    }

    pub async fn with_bucket(js: &jetstream::Context, bucket: &str) -> Result<Self> {
        Ok(Self {
            bucket: open_bucket(js, bucket).await?,
        })
    }
}

#[async_trait]
impl CredentialStore for KvCredentialStore {
    async fn put(&self, user: &UserId, record: CredentialRecord) -> Result<()> {
        let key = credential_key(user, record.service);
        let payload = serde_json::to_vec(&record).context("encode credential record")?;
        self.bucket
            .put(key, payload.into())
            .await
            .context("store credential record")?;
        Ok(())
    }

    async fn get(&self, user: &UserId, service: Service) -> Result<Option<CredentialRecord>> {
        let key = credential_key(user, service);
        let entry = self
            .bucket
            .get(key)
            .await
            .context("fetch credential record")?;
        entry
            .map(|raw| serde_json::from_slice(&raw).context("decode credential record"))
            .transpose()
    }

    async fn delete(&self, user: &UserId, service: Service) -> Result<()> {
        let key = credential_key(user, service);
        self.bucket
            .purge(key)
            .await
            .context("purge credential record")?;
        Ok(())
    }

    async fn list(&self, user: &UserId) -> Result<Vec<CredentialRecord>> {
        let prefix = format!("users/{}/integrations/", user.as_str());
        let keys: Vec<String> = self
            .bucket
            .keys()
            .await
            .context("list credential keys")?
            .try_filter(|key| futures::future::ready(key.starts_with(&prefix)))
            .try_collect()
            .await
            .context("collect credential keys")?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.bucket.get(key).await.context("fetch credential record")? {
                records.push(serde_json::from_slice(&raw).context("decode credential record")?);
            }
        }
        Ok(records)
    }

    async fn find_owner(
        &self,
        service: Service,
        key: &str,
        value: &str,
    ) -> Result<Option<UserId>> {
        let suffix = format!("/integrations/{}", service.as_str());
        let keys: Vec<String> = self
            .bucket
            .keys()
            .await
            .context("list credential keys")?
            .try_filter(|k| {
                futures::future::ready(k.starts_with("users/") && k.ends_with(&suffix))
            })
            .try_collect()
            .await
            .context("collect credential keys")?;

        for record_key in keys {
            let Some(raw) = self
                .bucket
                .get(record_key.clone())
                .await
                .context("fetch credential record")?
            else {
                continue;
            };
            let record: CredentialRecord =
                serde_json::from_slice(&raw).context("decode credential record")?;
            if record.credentials.get_str(key) == Some(value) {
                let user_raw = record_key
                    .trim_start_matches("users/")
                    .trim_end_matches(&suffix);
                return Ok(Some(UserId::new(user_raw)?));
            }
        }
        Ok(None)
    }
}

/// Message retention window on a JetStream KV bucket. One key per
/// message; pruning walks the per-user prefix and purges everything past
/// the cap.
pub struct KvMessageStore {
    bucket: kv::Store,
}

impl KvMessageStore {
    pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connect to nats at {url}"))?;
        let js = jetstream::new(client);
        Ok(Self {
            bucket: open_bucket(&js, bucket).await?,
        })
    }

    async fn load_window(
        &self,
        user: &UserId,
        service: Service,
    ) -> Result<Vec<(String, StoredMessage)>> {
        let prefix = message_key_prefix(user, service);
        let keys: Vec<String> = self
            .bucket
            .keys()
            .await
            .context("list message keys")?
            .try_filter(|key| futures::future::ready(key.starts_with(&prefix)))
            .try_collect()
            .await
            .context("collect message keys")?;

        let mut window = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.bucket.get(key.clone()).await.context("fetch message")? {
                let message: StoredMessage =
                    serde_json::from_slice(&raw).context("decode message")?;
                window.push((key, message));
            }
        }
        // Newest first by provider timestamp.
        window.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        Ok(window)
    }
}

#[async_trait]
impl MessageStore for KvMessageStore {
    async fn save(
        &self,
        user: &UserId,
        service: Service,
        message: StoredMessage,
        cap: usize,
    ) -> Result<()> {
        let key = format!(
            "{}{}",
            message_key_prefix(user, service),
            sanitize_message_id(&message.message_id)
        );
        let payload = serde_json::to_vec(&message).context("encode message")?;
        self.bucket
            .put(key, payload.into())
            .await
            .context("store message")?;

        let window = self.load_window(user, service).await?;
        for (stale_key, _) in window.into_iter().skip(cap) {
            self.bucket
                .purge(stale_key)
                .await
                .context("purge stale message")?;
        }
        Ok(())
    }

    async fn list(
        &self,
        user: &UserId,
        service: Service,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let window = self.load_window(user, service).await?;
        Ok(window
            .into_iter()
            .take(limit)
            .map(|(_, message)| message)
            .collect())
    }
}

/// KV keys accept a narrower charset than provider message ids
/// (`wamid.HBg...=` carries `=`; Telegram file ids carry `+`).
fn sanitize_message_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_made_key_safe() {
        assert_eq!(sanitize_message_id("wamid.ABC=="), "wamid.ABC==");
        assert_eq!(sanitize_message_id("id with/slash"), "id_with_slash");
    }
}
