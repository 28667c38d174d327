//! Solana anchor provider
//!
//! Anchors Merkle roots in SPL Memo transactions. Transaction signing is
//! delegated to a [`MemoSigner`] so payer keys stay outside this process.
//! Memos have the form `custody:<root_hex>:<memo>`, which makes earlier
//! anchors discoverable through `getSignaturesForAddress`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use custody_core::{Chain, Hash};
use custody_queue::TxRef;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::provider::{ChainAnchorProvider, ConfirmationStatus, SubmitReceipt};
use crate::rpc::RpcClient;

const MEMO_PREFIX: &str = "custody:";

/// How many recent payer signatures `find_existing` inspects
const SIGNATURE_SCAN_LIMIT: u64 = 100;

/// Commitment level at which a transaction counts as confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Confirmed,
    #[default]
    Finalized,
}

#[derive(Debug, Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    /// Fee payer and memo signer
    pub payer: String,
    pub commitment: Commitment,
    pub rpc_timeout: Duration,
}

impl SolanaConfig {
    pub fn new(rpc_url: impl Into<String>, payer: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            payer: payer.into(),
            commitment: Commitment::default(),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds and signs a memo transaction for the payer
#[async_trait]
pub trait MemoSigner: Send + Sync {
    /// Return a base64-encoded signed transaction
    async fn sign_memo(
        &self,
        payer: &str,
        recent_blockhash: &str,
        memo: &str,
    ) -> Result<String, ProviderError>;
}

#[derive(Serialize)]
struct SignMemoRequest<'a> {
    payer: &'a str,
    recent_blockhash: &'a str,
    memo: &'a str,
}

#[derive(Deserialize)]
struct SignMemoResponse {
    transaction: String,
}

/// Signs through an external signing service over HTTP
#[derive(Debug, Clone)]
pub struct RemoteMemoSigner {
    url: String,
    client: reqwest::Client,
}

impl RemoteMemoSigner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl MemoSigner for RemoteMemoSigner {
    async fn sign_memo(
        &self,
        payer: &str,
        recent_blockhash: &str,
        memo: &str,
    ) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&SignMemoRequest {
                payer,
                recent_blockhash,
                memo,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("signer: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ProviderError::Network(format!(
                "signer returned HTTP {}",
                resp.status()
            )));
        }
        let body: SignMemoResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Network(format!("signer response: {}", e)))?;
        Ok(body.transaction)
    }
}

pub fn memo_text(root: &Hash, memo: &str) -> String {
    format!("{}{}:{}", MEMO_PREFIX, root.to_hex(), memo)
}

pub struct SolanaAnchorProvider {
    config: SolanaConfig,
    rpc: RpcClient,
    signer: Arc<dyn MemoSigner>,
}

impl std::fmt::Debug for SolanaAnchorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaAnchorProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SolanaAnchorProvider {
    pub fn new(config: SolanaConfig, signer: Arc<dyn MemoSigner>) -> Result<Self, ProviderError> {
        let rpc = RpcClient::new(&config.rpc_url, config.rpc_timeout)?;
        Ok(Self {
            config,
            rpc,
            signer,
        })
    }

    async fn latest_blockhash(&self) -> Result<String, ProviderError> {
        let v = self
            .rpc
            .call(
                "getLatestBlockhash",
                json!([{"commitment": "finalized"}]),
            )
            .await?;
        v.pointer("/value/blockhash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Rpc {
                code: 0,
                message: "getLatestBlockhash: missing blockhash".into(),
            })
    }
}

/// Interpret one entry of `getSignatureStatuses`
fn signature_status(status: &Value, commitment: Commitment) -> ConfirmationStatus {
    if status.is_null() {
        return ConfirmationStatus::Pending { confirmations: 0 };
    }
    if let Some(err) = status.get("err").filter(|e| !e.is_null()) {
        return ConfirmationStatus::Dropped {
            reason: format!("transaction failed: {}", err),
        };
    }
    // `confirmations` is null once rooted
    let confirmations = status
        .get("confirmations")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    match status.get("confirmationStatus").and_then(Value::as_str) {
        Some("finalized") => ConfirmationStatus::Finalized {
            confirmations: confirmations.max(1),
        },
        Some("confirmed") if commitment == Commitment::Confirmed => {
            ConfirmationStatus::Confirmed {
                confirmations: confirmations.max(1),
            }
        }
        _ => ConfirmationStatus::Pending { confirmations },
    }
}

#[async_trait]
impl ChainAnchorProvider for SolanaAnchorProvider {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn address(&self) -> &str {
        &self.config.payer
    }

    async fn submit(&self, root: &Hash, memo: &str) -> Result<SubmitReceipt, ProviderError> {
        let blockhash = self.latest_blockhash().await?;
        let text = memo_text(root, memo);
        let signed = self
            .signer
            .sign_memo(&self.config.payer, &blockhash, &text)
            .await?;
        STANDARD
            .decode(&signed)
            .map_err(|e| ProviderError::Rejected(format!("signer returned invalid base64: {}", e)))?;

        let result = self
            .rpc
            .call(
                "sendTransaction",
                json!([signed, {"encoding": "base64", "preflightCommitment": "confirmed"}]),
            )
            .await?;
        let signature = result
            .as_str()
            .ok_or_else(|| ProviderError::Rejected(format!("unexpected signature: {}", result)))?
            .to_string();

        info!(signature = %signature, root = %root, "Root submitted to Solana");

        Ok(SubmitReceipt {
            tx_reference: signature,
            submitted_at: Utc::now(),
        })
    }

    async fn confirm(&self, tx: &TxRef) -> Result<ConfirmationStatus, ProviderError> {
        let v = self
            .rpc
            .call(
                "getSignatureStatuses",
                json!([[tx.tx_reference], {"searchTransactionHistory": true}]),
            )
            .await?;
        let status = v.pointer("/value/0").cloned().unwrap_or(Value::Null);
        Ok(signature_status(&status, self.config.commitment))
    }

    async fn find_existing(&self, root: &Hash) -> Result<Option<String>, ProviderError> {
        let v = self
            .rpc
            .call(
                "getSignaturesForAddress",
                json!([self.config.payer, {"limit": SIGNATURE_SCAN_LIMIT}]),
            )
            .await?;

        let needle = format!("{}{}", MEMO_PREFIX, root.to_hex());
        let found = v
            .as_array()
            .into_iter()
            .flatten()
            .filter(|entry| entry.get("err").map(Value::is_null).unwrap_or(true))
            .find(|entry| {
                entry
                    .get("memo")
                    .and_then(Value::as_str)
                    .map(|m| m.contains(&needle))
                    .unwrap_or(false)
            })
            .and_then(|entry| entry.get("signature").and_then(Value::as_str))
            .map(str::to_string);

        debug!(root = %root, found = found.is_some(), "Scanned payer history for root");
        Ok(found)
    }

    fn name(&self) -> &str {
        "solana"
    }

    async fn is_healthy(&self) -> bool {
        self.rpc.call("getHealth", json!([])).await.is_ok()
    }
}
