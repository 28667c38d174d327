//! Error types for anchoring operations

use custody_core::ValidationError;
use custody_queue::FailureClass;
use std::time::Duration;
use thiserror::Error;

/// Errors a chain provider can report
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The RPC endpoint asked us to slow down
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Connection or HTTP failure
    #[error("Network error: {0}")]
    Network(String),

    /// The call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Signer or destination address is malformed
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] ValidationError),

    /// The signing account cannot pay for the transaction
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The chain refused the transaction
    #[error("Rejected by chain: {0}")]
    Rejected(String),

    /// JSON-RPC error object not covered by a more specific variant
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider is missing required configuration
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Map a JSON-RPC error object onto the taxonomy
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if code == 429
            || code == -32005
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            Self::RateLimited {
                message,
                retry_after: None,
            }
        } else if lower.contains("insufficient funds") || lower.contains("insufficient lamports") {
            Self::InsufficientFunds(message)
        } else {
            Self::Rpc { code, message }
        }
    }

    /// How the outbox should treat this failure
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidAddress(_) => FailureClass::Validation,
            Self::RateLimited { .. }
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Serialization(_) => FailureClass::Transient,
            Self::InsufficientFunds(_) | Self::Rejected(_) | Self::NotConfigured(_) => {
                FailureClass::Permanent
            }
            // -32603 internal error and the -32000..-32099 server range are
            // node-side conditions; the rest are malformed requests
            Self::Rpc { code, .. } => match code {
                -32603 | -32099..=-32000 => FailureClass::Transient,
                _ => FailureClass::Permanent,
            },
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_errors_are_classified() {
        assert!(ProviderError::from_rpc(-32005, "limit exceeded").is_rate_limited());
        assert!(ProviderError::from_rpc(-32000, "Too Many Requests").is_rate_limited());
        assert!(matches!(
            ProviderError::from_rpc(-32000, "insufficient funds for gas * price + value"),
            ProviderError::InsufficientFunds(_)
        ));
        assert_eq!(
            ProviderError::from_rpc(-32000, "nonce too low").class(),
            FailureClass::Transient
        );
        assert_eq!(
            ProviderError::from_rpc(-32602, "invalid params").class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_taxonomy() {
        let invalid: ProviderError = ValidationError::InvalidChecksum("0xabc".into()).into();
        assert_eq!(invalid.class(), FailureClass::Validation);
        assert_eq!(
            ProviderError::Network("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            ProviderError::InsufficientFunds("0 wei".into()).class(),
            FailureClass::Permanent
        );
    }
}
