//! Validation errors shared across the pipeline

use thiserror::Error;

/// Malformed input: content, metadata, addresses or keys.
///
/// Never retried. A job that fails with one of these goes straight to
/// `Failed` without consuming a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("evidence content is empty")]
    EmptyContent,

    #[error("evidence content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: usize, max: usize },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("invalid characters: {0}")]
    InvalidCharacters(String),

    #[error("invalid checksum for address {0}")]
    InvalidChecksum(String),

    #[error("base58 decode error: {0}")]
    Base58(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}
