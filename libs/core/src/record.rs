use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

use crate::Service;

/// Sealed credential payload.
///
/// Serializes only on the storage path; the listing projection
/// [`ConnectionSummary`] cannot carry it by construction, and `Debug`
/// redacts values so tokens never reach logs.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialMap(BTreeMap<String, Value>);

impl CredentialMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String-typed lookup; `None` for absent, null, or non-string values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for CredentialMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys only; values are secrets.
        f.debug_struct("CredentialMap")
            .field("keys", &self.0.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for CredentialMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Stored credential bundle, one per `(user, service)`.
///
/// This is the storage shape only. Anything returned to API callers goes
/// through [`ConnectionSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub service: Service,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    pub credentials: CredentialMap,
    #[serde(default)]
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CredentialRecord {
    pub fn new(service: Service, credentials: CredentialMap, metadata: Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            service,
            connected_at: now,
            credentials,
            metadata,
            updated_at: now,
        }
    }

    /// Replaces the credential payload in place, bumping `updated_at` and
    /// leaving `connected_at` untouched. Used by lazy token refresh.
    pub fn replace_credentials(&mut self, credentials: CredentialMap) {
        self.credentials = credentials;
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            service: self.service,
            connected_at: self.connected_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// What listings expose: service, connection time, display metadata.
/// No credential field exists on this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub service: Service,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(default)]
    pub metadata: Value,
}
