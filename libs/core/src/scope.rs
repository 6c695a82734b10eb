//! Store key scoping. Every persisted object lives under a namespace
//! derived from the owning user; callers never assemble keys by hand.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{IntegrationError, Service};

/// Validated user identifier.
///
/// Rejecting separators and whitespace here keeps a hostile id from
/// escaping its namespace in any key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Result<Self, IntegrationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "user id must not be empty"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IntegrationError::Internal(anyhow::anyhow!(
                "user id contains characters not allowed in store keys"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the credential record for `(user, service)`.
pub fn credential_key(user: &UserId, service: Service) -> String {
    format!("users/{}/integrations/{}", user.as_str(), service.as_str())
}

/// Prefix under which a user's retained inbound messages are stored.
pub fn message_key_prefix(user: &UserId, service: Service) -> String {
    format!("users/{}/messages/{}/", user.as_str(), service.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_user_and_service() {
        let user = UserId::new("user-1").unwrap();
        assert_eq!(
            credential_key(&user, Service::Gmail),
            "users/user-1/integrations/gmail"
        );
        assert_eq!(
            message_key_prefix(&user, Service::WhatsApp),
            "users/user-1/messages/whatsapp/"
        );
    }

    #[test]
    fn hostile_user_ids_are_rejected() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("../other-user").is_err());
        assert!(UserId::new("a/b").is_err());
        assert!(UserId::new("has space").is_err());
        assert!(UserId::new("firebase-uid_01").is_ok());
    }
}
