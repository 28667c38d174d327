//! EVM anchor provider
//!
//! Anchors Merkle roots as calldata on an Ethereum-compatible chain via
//! JSON-RPC. The node holds the signing key (`eth_sendTransaction`), so this
//! provider never touches private keys.

use async_trait::async_trait;
use chrono::Utc;
use custody_core::{Chain, Hash};
use custody_queue::TxRef;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::provider::{ChainAnchorProvider, ConfirmationStatus, SubmitReceipt};
use crate::rpc::{parse_quantity, RpcClient};

/// Calldata prefix: "CSTD"
pub const CALLDATA_MAGIC: &str = "43535444";

#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// Node-managed account that signs anchor transactions
    pub from_address: String,
    /// Recipient of the anchor transaction; defaults to `from_address`
    pub to_address: Option<String>,
    /// Blocks on top of the receipt block before a tx counts as confirmed
    pub confirmations: u64,
    pub rpc_timeout: Duration,
    /// How long a transaction may be unknown to the node before it counts
    /// as dropped
    pub drop_grace: Duration,
    /// Recent blocks scanned for an earlier anchor of the same root
    pub lookback_blocks: u64,
}

impl EvmConfig {
    pub fn new(rpc_url: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            from_address: from_address.into(),
            to_address: None,
            confirmations: 12,
            rpc_timeout: Duration::from_secs(30),
            drop_grace: Duration::from_secs(60),
            lookback_blocks: 64,
        }
    }
}

/// Encode a root as anchor calldata
pub fn anchor_calldata(root: &Hash) -> String {
    format!("0x{}{}", CALLDATA_MAGIC, root.to_hex())
}

#[derive(Debug)]
pub struct EvmAnchorProvider {
    config: EvmConfig,
    rpc: RpcClient,
}

impl EvmAnchorProvider {
    pub fn new(config: EvmConfig) -> Result<Self, ProviderError> {
        let rpc = RpcClient::new(&config.rpc_url, config.rpc_timeout)?;
        Ok(Self { config, rpc })
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        let v = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&v)
    }
}

/// Hash of the first transaction in `block` sent by `from` with `calldata`
fn find_anchor_tx(block: &Value, from: &str, calldata: &str) -> Option<String> {
    block
        .get("transactions")?
        .as_array()?
        .iter()
        .filter(|tx| {
            let field = |k: &str| tx.get(k).and_then(Value::as_str).unwrap_or_default();
            field("from").eq_ignore_ascii_case(from) && field("input").eq_ignore_ascii_case(calldata)
        })
        .find_map(|tx| tx.get("hash").and_then(Value::as_str).map(str::to_string))
}

/// Interpret a receipt against the current head
fn receipt_status(receipt: &Value, head: u64, required: u64) -> Result<ConfirmationStatus, ProviderError> {
    if receipt.get("status").and_then(Value::as_str) == Some("0x0") {
        return Ok(ConfirmationStatus::Dropped {
            reason: "transaction reverted".into(),
        });
    }
    let Some(block) = receipt.get("blockNumber").filter(|b| !b.is_null()) else {
        return Ok(ConfirmationStatus::Pending { confirmations: 0 });
    };
    let block = parse_quantity(block)?;
    let confirmations = head.saturating_sub(block) + 1;
    if confirmations >= required.max(1) {
        Ok(ConfirmationStatus::Confirmed { confirmations })
    } else {
        Ok(ConfirmationStatus::Pending { confirmations })
    }
}

#[async_trait]
impl ChainAnchorProvider for EvmAnchorProvider {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    fn address(&self) -> &str {
        &self.config.from_address
    }

    fn destination(&self) -> Option<&str> {
        self.config.to_address.as_deref()
    }

    async fn submit(&self, root: &Hash, memo: &str) -> Result<SubmitReceipt, ProviderError> {
        let to = self
            .config
            .to_address
            .as_deref()
            .unwrap_or(&self.config.from_address);

        let result = self
            .rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": self.config.from_address,
                    "to": to,
                    "value": "0x0",
                    "data": anchor_calldata(root),
                }]),
            )
            .await?;

        let tx_hash = result
            .as_str()
            .filter(|h| h.starts_with("0x"))
            .ok_or_else(|| ProviderError::Rejected(format!("unexpected tx hash: {}", result)))?
            .to_string();

        info!(tx_hash = %tx_hash, root = %root, memo = %memo, "Root submitted to EVM");

        Ok(SubmitReceipt {
            tx_reference: tx_hash,
            submitted_at: Utc::now(),
        })
    }

    async fn confirm(&self, tx: &TxRef) -> Result<ConfirmationStatus, ProviderError> {
        let receipt = self
            .rpc
            .call("eth_getTransactionReceipt", json!([tx.tx_reference]))
            .await?;

        if receipt.is_null() {
            let known = self
                .rpc
                .call("eth_getTransactionByHash", json!([tx.tx_reference]))
                .await?;
            if !known.is_null() {
                debug!(tx_hash = %tx.tx_reference, "In mempool, no receipt yet");
                return Ok(ConfirmationStatus::Pending { confirmations: 0 });
            }

            // Nodes can lag right after broadcast
            let age = (Utc::now() - tx.submitted_at).to_std().unwrap_or_default();
            if age < self.config.drop_grace {
                debug!(tx_hash = %tx.tx_reference, "Not yet visible to node");
                return Ok(ConfirmationStatus::Pending { confirmations: 0 });
            }
            warn!(tx_hash = %tx.tx_reference, age_secs = age.as_secs(), "Transaction unknown to node");
            return Ok(ConfirmationStatus::Dropped {
                reason: "transaction unknown to node".into(),
            });
        }

        let head = self.block_number().await?;
        receipt_status(&receipt, head, self.config.confirmations)
    }

    async fn find_existing(&self, root: &Hash) -> Result<Option<String>, ProviderError> {
        let calldata = anchor_calldata(root);
        let head = self.block_number().await?;
        let oldest = head.saturating_sub(self.config.lookback_blocks.saturating_sub(1));

        for number in (oldest..=head).rev() {
            let block = self
                .rpc
                .call(
                    "eth_getBlockByNumber",
                    json!([format!("0x{:x}", number), true]),
                )
                .await?;
            if let Some(hash) = find_anchor_tx(&block, &self.config.from_address, &calldata) {
                debug!(tx_hash = %hash, block = number, root = %root, "Found earlier anchor");
                return Ok(Some(hash));
            }
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "evm"
    }

    async fn is_healthy(&self) -> bool {
        self.block_number().await.is_ok()
    }
}
