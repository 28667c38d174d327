//! Scripted provider for tests and stub deployments
//!
//! Submit and confirm responses are popped from queues; once a queue is
//! empty the provider falls back to success and to `default_confirm`.

use async_trait::async_trait;
use chrono::Utc;
use custody_core::{Chain, Hash};
use custody_queue::TxRef;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::address::AddressValidator;
use crate::error::ProviderError;
use crate::provider::{ChainAnchorProvider, ConfirmationStatus, SubmitReceipt};

#[derive(Debug)]
pub struct MockChainProvider {
    chain: Chain,
    address: String,
    destination: Option<String>,
    submit_script: Mutex<VecDeque<Result<String, ProviderError>>>,
    confirm_script: Mutex<VecDeque<ConfirmationStatus>>,
    default_confirm: ConfirmationStatus,
    existing: Mutex<Option<String>>,
    submitted_roots: Mutex<Vec<Hash>>,
    submit_delay: Option<Duration>,
    submit_calls: AtomicU32,
    confirm_calls: AtomicU32,
}

impl MockChainProvider {
    /// Provider that accepts every submission and confirms on first poll
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            address: AddressValidator::describe(chain).example.to_string(),
            destination: None,
            submit_script: Mutex::new(VecDeque::new()),
            confirm_script: Mutex::new(VecDeque::new()),
            default_confirm: ConfirmationStatus::Finalized { confirmations: 1 },
            existing: Mutex::new(None),
            submitted_roots: Mutex::new(Vec::new()),
            submit_delay: None,
            submit_calls: AtomicU32::new(0),
            confirm_calls: AtomicU32::new(0),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Queue a failure for the next unscripted submission
    pub fn fail_next_submit(self, err: ProviderError) -> Self {
        lock(&self.submit_script).push_back(Err(err));
        self
    }

    pub fn then_confirm(self, status: ConfirmationStatus) -> Self {
        lock(&self.confirm_script).push_back(status);
        self
    }

    /// Status returned once the confirm script runs out
    pub fn with_default_confirm(mut self, status: ConfirmationStatus) -> Self {
        self.default_confirm = status;
        self
    }

    /// Pretend `tx_reference` already anchors whatever root is asked about
    pub fn with_existing(self, tx_reference: impl Into<String>) -> Self {
        *lock(&self.existing) = Some(tx_reference.into());
        self
    }

    /// Sleep inside `submit`, to exercise caller timeouts
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn confirm_calls(&self) -> u32 {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    pub fn submitted_roots(&self) -> Vec<Hash> {
        lock(&self.submitted_roots).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ChainAnchorProvider for MockChainProvider {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    async fn submit(&self, root: &Hash, _memo: &str) -> Result<SubmitReceipt, ProviderError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.submit_script).pop_front();
        let tx_reference = match scripted {
            Some(result) => result?,
            None => format!("mock-{}-{}-{}", self.chain, &root.to_hex()[..8], n),
        };
        lock(&self.submitted_roots).push(*root);
        *lock(&self.existing) = Some(tx_reference.clone());

        Ok(SubmitReceipt {
            tx_reference,
            submitted_at: Utc::now(),
        })
    }

    async fn confirm(&self, _tx: &TxRef) -> Result<ConfirmationStatus, ProviderError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.confirm_script)
            .pop_front()
            .unwrap_or_else(|| self.default_confirm.clone()))
    }

    async fn find_existing(&self, _root: &Hash) -> Result<Option<String>, ProviderError> {
        Ok(lock(&self.existing).clone())
    }

    fn name(&self) -> &str {
        "mock"
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = MockChainProvider::new(Chain::Evm).fail_next_submit(
            ProviderError::RateLimited {
                message: "429".into(),
                retry_after: None,
            },
        );
        let root = Hash::digest(b"root");

        assert!(provider.submit(&root, "m").await.unwrap_err().is_rate_limited());
        let receipt = provider.submit(&root, "m").await.unwrap();
        assert!(receipt.tx_reference.starts_with("mock-evm-"));
        assert_eq!(provider.submit_calls(), 2);
        assert_eq!(provider.submitted_roots(), vec![root]);

        let tx = TxRef::new(Uuid::new_v4(), Chain::Evm, receipt.tx_reference, Utc::now());
        assert!(provider.confirm(&tx).await.unwrap().is_final());
        assert_eq!(
            provider.find_existing(&root).await.unwrap(),
            Some(tx.tx_reference.clone())
        );
    }
}
