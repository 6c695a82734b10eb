use std::{env, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use intake_core::{Service, UserId};

/// Server-side record of an issued-but-unconsumed authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuth {
    pub user: UserId,
    pub service: Service,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl PendingAuth {
    pub fn new(user: UserId, service: Service, ttl: StdDuration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            user,
            service,
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

/// One entry per issued state token, keyed by `jti`.
///
/// `take` is check-and-remove: the first callback wins, every later one
/// (replay) observes an absent entry. Expired entries count as absent.
#[async_trait]
pub trait PendingStore: Send + Sync {
    async fn put(&self, jti: &str, pending: PendingAuth) -> Result<()>;
    async fn take(&self, jti: &str) -> Result<Option<PendingAuth>>;
}

pub type SharedPendingStore = Arc<dyn PendingStore>;

/// In-memory pending store. Entries do not survive a restart; the
/// KV-backed store is preferred outside development.
#[derive(Default)]
pub struct MemoryPendingStore {
    entries: DashMap<String, PendingAuth>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn put(&self, jti: &str, pending: PendingAuth) -> Result<()> {
        self.entries.insert(jti.to_string(), pending);
        Ok(())
    }

    async fn take(&self, jti: &str) -> Result<Option<PendingAuth>> {
        let taken = self.entries.remove(jti).map(|(_, pending)| pending);
        Ok(taken.filter(|pending| !pending.is_expired()))
    }
}

pub fn shared_memory_pending_store() -> SharedPendingStore {
    Arc::new(MemoryPendingStore::new())
}

/// Builds the pending store from the environment, mirroring the
/// credential-store selection: `CREDENTIALS_NATS_URL` enables the
/// KV-backed store so in-flight connects survive a gateway restart.
pub async fn pending_store_from_env() -> Result<SharedPendingStore> {
    match env::var("CREDENTIALS_NATS_URL") {
        Ok(url) => {
            let bucket = env::var("PENDING_BUCKET").unwrap_or_else(|_| "intake-pending".into());
            build_kv_pending_store(&url, &bucket).await
        }
        Err(_) => {
            tracing::warn!("CREDENTIALS_NATS_URL not set; pending connects will not survive restarts");
            Ok(shared_memory_pending_store())
        }
    }
}

#[cfg(feature = "nats-store")]
async fn build_kv_pending_store(url: &str, bucket: &str) -> Result<SharedPendingStore> {
    let store = KvPendingStore::connect(url, bucket).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "nats-store"))]
async fn build_kv_pending_store(_url: &str, _bucket: &str) -> Result<SharedPendingStore> {
    tracing::warn!("nats-store feature disabled; using in-memory pending store");
    Ok(shared_memory_pending_store())
}

#[cfg(feature = "nats-store")]
pub use kv_impl::KvPendingStore;

#[cfg(feature = "nats-store")]
mod kv_impl {
    use super::*;
    use async_nats::jetstream::{
        self,
        context::KeyValueErrorKind,
        kv::{self, CreateErrorKind},
    };

    /// Pending store on a JetStream KV bucket. Entries are created with
    /// the state-token TTL so the server forgets abandoned connects on
    /// its own; consumption is a revision-checked purge, so a replayed
    /// callback can never take the same entry twice.
    pub struct KvPendingStore {
        bucket: kv::Store,
    }

    impl KvPendingStore {
        pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
            let client = async_nats::connect(url)
                .await
                .with_context(|| format!("connect to nats at {url}"))?;
            let js = jetstream::new(client);
            Self::with_context(&js, bucket).await
        }

        pub async fn with_context(js: &jetstream::Context, bucket: &str) -> Result<Self> {
            let bucket = match js.get_key_value(bucket).await {
                Ok(store) => store,
                Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        max_age: StdDuration::from_secs(0),
                        ..Default::default()
                    })
                    .await
                    .context("create pending bucket")?,
                Err(err) => return Err(err.into()),
            };
            Ok(Self { bucket })
        }

        fn key(jti: &str) -> String {
            format!("pending/{jti}")
        }
    }

    #[async_trait]
    impl PendingStore for KvPendingStore {
        async fn put(&self, jti: &str, pending: PendingAuth) -> Result<()> {
            let ttl = (pending.expires_at - OffsetDateTime::now_utc())
                .try_into()
                .unwrap_or(StdDuration::from_secs(1));
            let payload = serde_json::to_vec(&pending).context("encode pending entry")?;
            match self
                .bucket
                .create_with_ttl(Self::key(jti), payload.into(), ttl)
                .await
            {
                Ok(_) => Ok(()),
                // jti collisions do not happen for UUID tokens; an existing
                // entry means the same token was issued twice, which is a bug.
                Err(err) if err.kind() == CreateErrorKind::AlreadyExists => {
                    Err(anyhow::anyhow!("pending entry already exists for jti {jti}"))
                }
                Err(err) => Err(anyhow::anyhow!(err).context("store pending entry")),
            }
        }

        async fn take(&self, jti: &str) -> Result<Option<PendingAuth>> {
            let key = Self::key(jti);
            let Some(entry) = self
                .bucket
                .entry(key.clone())
                .await
                .context("fetch pending entry")?
            else {
                return Ok(None);
            };
            if entry.operation != kv::Operation::Put {
                return Ok(None);
            }
            // Revision-checked purge: losing the race means someone else
            // consumed the token first, which is exactly a replay.
            if self
                .bucket
                .purge_expect_revision(key, Some(entry.revision))
                .await
                .is_err()
            {
                return Ok(None);
            }
            let pending: PendingAuth =
                serde_json::from_slice(&entry.value).context("decode pending entry")?;
            Ok(Some(pending).filter(|p| !p.is_expired()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(ttl: StdDuration) -> PendingAuth {
        PendingAuth::new(UserId::new("user-1").unwrap(), Service::Gmail, ttl)
    }

    #[tokio::test]
    async fn take_consumes_exactly_once() {
        let store = MemoryPendingStore::new();
        store
            .put("jti-1", pending(StdDuration::from_secs(600)))
            .await
            .unwrap();

        let first = store.take("jti-1").await.unwrap();
        assert!(first.is_some());
        let second = store.take("jti-1").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn unknown_jti_is_absent() {
        let store = MemoryPendingStore::new();
        assert!(store.take("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_count_as_absent() {
        let store = MemoryPendingStore::new();
        store
            .put("jti-1", pending(StdDuration::from_secs(0)))
            .await
            .unwrap();
        assert!(store.take("jti-1").await.unwrap().is_none());
    }
}
