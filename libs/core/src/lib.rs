//! Shared types for the intake credential service.
//!
//! Everything that crosses a crate boundary lives here: the `Service`
//! enumeration, the sealed credential payload, the stored record and its
//! listing projection, and the error taxonomy.

mod error;
mod record;
mod scope;

pub use error::IntegrationError;
pub use record::{ConnectionSummary, CredentialMap, CredentialRecord};
pub use scope::{credential_key, message_key_prefix, UserId};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External services a user can connect (kept small and stable).
///
/// ```
/// use intake_core::Service;
///
/// let s = Service::Telegram;
/// assert_eq!(s.as_str(), "telegram");
/// assert_eq!("gmail".parse::<Service>().unwrap(), Service::Gmail);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Gmail,
    Outlook,
    WhatsApp,
    Telegram,
}

/// How a service is connected: browser OAuth redirect, or credentials
/// supplied directly in the connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFlow {
    OAuth,
    Direct,
}

impl Service {
    /// Lowercase identifier used in routes, store keys, and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Gmail => "gmail",
            Service::Outlook => "outlook",
            Service::WhatsApp => "whatsapp",
            Service::Telegram => "telegram",
        }
    }

    pub fn flow(&self) -> ConnectFlow {
        match self {
            Service::Gmail | Service::Outlook => ConnectFlow::OAuth,
            Service::WhatsApp | Service::Telegram => ConnectFlow::Direct,
        }
    }

    pub const ALL: [Service; 4] = [
        Service::Gmail,
        Service::Outlook,
        Service::WhatsApp,
        Service::Telegram,
    ];
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = IntegrationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "gmail" => Ok(Service::Gmail),
            "outlook" => Ok(Service::Outlook),
            "whatsapp" => Ok(Service::WhatsApp),
            "telegram" => Ok(Service::Telegram),
            other => Err(IntegrationError::UnknownService(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_round_trips_through_str() {
        for service in Service::ALL {
            let parsed: Service = service.as_str().parse().unwrap();
            assert_eq!(parsed, service);
        }
    }

    #[test]
    fn unknown_service_is_rejected() {
        let err = "slack".parse::<Service>().unwrap_err();
        assert_eq!(err.code(), "unknown_service");
    }

    #[test]
    fn oauth_and_direct_split() {
        assert_eq!(Service::Gmail.flow(), ConnectFlow::OAuth);
        assert_eq!(Service::Outlook.flow(), ConnectFlow::OAuth);
        assert_eq!(Service::WhatsApp.flow(), ConnectFlow::Direct);
        assert_eq!(Service::Telegram.flow(), ConnectFlow::Direct);
    }

    #[test]
    fn service_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Service::WhatsApp).unwrap(),
            "\"whatsapp\""
        );
    }
}
