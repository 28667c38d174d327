//! # Custody Keeper
//!
//! The long-running side of the pipeline:
//! - [`BatchPipeline`] cuts incoming evidence into Merkle batches and
//!   enqueues one job per target chain
//! - [`AnchorOrchestrator`] claims jobs, submits roots, polls confirmations
//!   and recovers interrupted submissions
//!
//! Any number of keepers may share one outbox; the store's atomic claim is
//! what keeps them from submitting the same job twice.

pub mod config;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod telemetry;

pub use config::{ConfigError, KeeperConfig, SolanaSettings};
pub use orchestrator::{AnchorOrchestrator, ConfirmSummary, OrchestratorConfig, SubmitOutcome};
pub use pipeline::{BatchPipeline, EvidenceSender};
pub use providers::build_registry;
