//! # Custody Core
//!
//! Core types for the evidence anchoring pipeline:
//! - [`EvidenceRecord`]: immutable, content-addressed evidence entry
//! - [`MerkleTree`]: pairwise SHA-256 commitment over ordered digests
//! - [`MerkleBatcher`]: size/age bounded batching into [`AnchorBatch`]es
//! - [`AttestationSigner`]: Ed25519 attestations that do not wait for a chain

pub mod attestation;
pub mod batch;
pub mod chain;
pub mod error;
pub mod evidence;
pub mod merkle;

pub use attestation::{verify_attestation, Attestation, AttestationSigner};
pub use batch::{AnchorBatch, BatchConfig, BatchId, BatchMember, MerkleBatcher};
pub use chain::Chain;
pub use error::ValidationError;
pub use evidence::{EvidenceContent, EvidenceId, EvidenceRecord, EvidenceRecorder, SourceType};
pub use merkle::{Hash, MerkleProof, MerkleProofStep, MerkleTree};
