use crate::Service;
use thiserror::Error;

/// Failure taxonomy shared by the orchestrator, adapters, and HTTP layer.
///
/// Each variant carries a stable machine-readable code: API error bodies
/// and callback redirect indicators are built from `code()`, never from
/// the display text.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// The provider rejected the supplied or exchanged credentials.
    #[error("provider rejected credentials: {0}")]
    InvalidCredentials(String),

    /// The OAuth authorization code could not be exchanged for tokens.
    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    /// No credential record exists for the requested service.
    #[error("{0} is not connected")]
    NotConnected(Service),

    /// A bounded provider call exceeded its deadline.
    #[error("provider call timed out after {timeout_secs}s")]
    ProviderTimeout { timeout_secs: u64 },

    /// The callback state token was invalid, expired, or already consumed.
    /// Treated as a security event by callers.
    #[error("state token rejected: {0}")]
    StateMismatch(String),

    /// The provider does not offer this capability.
    #[error("{service} does not support {operation}")]
    Unsupported {
        service: Service,
        operation: &'static str,
    },

    /// The path parameter did not name a known service.
    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntegrationError {
    pub fn unsupported(service: Service, operation: &'static str) -> Self {
        IntegrationError::Unsupported { service, operation }
    }

    /// Stable code used in API bodies and `error=` redirect parameters.
    pub fn code(&self) -> &'static str {
        match self {
            IntegrationError::InvalidCredentials(_) => "invalid_credentials",
            IntegrationError::ExchangeFailed(_) => "exchange_failed",
            IntegrationError::NotConnected(_) => "not_connected",
            IntegrationError::ProviderTimeout { .. } => "provider_timeout",
            IntegrationError::StateMismatch(_) => "state_mismatch",
            IntegrationError::Unsupported { .. } => "unsupported",
            IntegrationError::UnknownService(_) => "unknown_service",
            IntegrationError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IntegrationError::ProviderTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            IntegrationError::InvalidCredentials("nope".into()).code(),
            "invalid_credentials"
        );
        assert_eq!(
            IntegrationError::NotConnected(Service::Gmail).code(),
            "not_connected"
        );
        assert_eq!(
            IntegrationError::ProviderTimeout { timeout_secs: 10 }.code(),
            "provider_timeout"
        );
    }

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(IntegrationError::ProviderTimeout { timeout_secs: 5 }.is_retryable());
        assert!(!IntegrationError::StateMismatch("reused".into()).is_retryable());
        assert!(!IntegrationError::ExchangeFailed("bad code".into()).is_retryable());
    }
}
