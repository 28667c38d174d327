//! Core provider trait for chain anchoring

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custody_core::{Chain, Hash};
use custody_queue::TxRef;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Chain-native identifier (tx hash, signature)
    pub tx_reference: String,
    pub submitted_at: DateTime<Utc>,
}

/// Where a submitted transaction stands, in the provider's own finality terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    /// Known or not yet seen; not final
    Pending { confirmations: u64 },
    /// Meets the provider's confirmation threshold
    Confirmed { confirmations: u64 },
    /// Irreversible under the chain's own finality rule
    Finalized { confirmations: u64 },
    /// Reverted, failed, or evicted; must be resubmitted
    Dropped { reason: String },
}

impl ConfirmationStatus {
    /// `Confirmed` or `Finalized`
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Finalized { .. })
    }

    pub fn confirmations(&self) -> u64 {
        match self {
            Self::Pending { confirmations }
            | Self::Confirmed { confirmations }
            | Self::Finalized { confirmations } => *confirmations,
            Self::Dropped { .. } => 0,
        }
    }
}

/// One blockchain anchoring target.
///
/// Implementations hold no job state; every result is written back to the
/// outbox by the caller.
#[async_trait]
pub trait ChainAnchorProvider: Send + Sync {
    fn chain(&self) -> Chain;

    /// Signer address, checked before every submission
    fn address(&self) -> &str;

    /// Recipient of anchor transactions, if the chain has one. Checked
    /// alongside the signer.
    fn destination(&self) -> Option<&str> {
        None
    }

    /// Submit `root` to the chain. `memo` is free-form context
    /// (e.g. the batch id) that providers may embed.
    async fn submit(&self, root: &Hash, memo: &str) -> Result<SubmitReceipt, ProviderError>;

    /// Query the status of an earlier submission
    async fn confirm(&self, tx: &TxRef) -> Result<ConfirmationStatus, ProviderError>;

    /// Look for an earlier anchor of `root` by this provider's signer.
    ///
    /// Chains without a cheap lookup return `Ok(None)`; resubmitting an
    /// already anchored root is harmless there.
    async fn find_existing(&self, _root: &Hash) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    /// Get the human-readable name of this provider
    fn name(&self) -> &str;

    /// Check if the provider's endpoint is reachable
    async fn is_healthy(&self) -> bool;
}
