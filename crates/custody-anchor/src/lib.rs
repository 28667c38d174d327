//! # Custody Anchor
//!
//! Chain-specific anchoring behind one contract.
//!
//! ## Providers
//!
//! - **EvmAnchorProvider**: Merkle root as calldata via `eth_sendTransaction`,
//!   confirmed after N blocks
//! - **SolanaAnchorProvider**: Merkle root in a memo transaction, confirmed at
//!   the configured commitment level
//! - **MockChainProvider**: scripted responses for tests and stub deployments
//!
//! The orchestrator only ever sees [`ChainAnchorProvider`]; finality rules,
//! RPC shapes and address formats stay inside each provider.

mod error;
mod rpc;

pub mod address;
pub mod evm;
pub mod mock;
pub mod provider;
pub mod registry;
pub mod solana;
pub mod throttle;

pub use address::{AddressFormat, AddressValidator};
pub use error::ProviderError;
pub use evm::{EvmAnchorProvider, EvmConfig};
pub use mock::MockChainProvider;
pub use provider::{ChainAnchorProvider, ConfirmationStatus, SubmitReceipt};
pub use registry::ProviderRegistry;
pub use solana::{Commitment, MemoSigner, RemoteMemoSigner, SolanaAnchorProvider, SolanaConfig};
pub use throttle::RateLimitGate;
