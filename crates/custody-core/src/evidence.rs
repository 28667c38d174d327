//! Evidence records and their content digests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::merkle::Hash;

/// Evidence identifier
pub type EvidenceId = Uuid;

/// Where a piece of evidence came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    DetectionSession,
    SimulatorExport,
    EngagementSummary,
    SensorCapture,
    Manual,
    Custom(String),
}

/// Raw evidence content before digesting
#[derive(Debug, Clone)]
pub enum EvidenceContent {
    /// Opaque bytes, digested exactly as given
    Bytes(Vec<u8>),
    /// Structured JSON, digested over its RFC 8785 canonical form
    Json(serde_json::Value),
}

impl EvidenceContent {
    /// Canonical byte serialization the digest is computed over
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Json(value) => serde_jcs::to_vec(value)
                .map_err(|e| ValidationError::InvalidMetadata(format!("canonicalization failed: {e}"))),
        }
    }
}

/// Immutable, content-addressed evidence entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: EvidenceId,
    pub content_hash: Hash,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Computes digests and builds [`EvidenceRecord`]s
#[derive(Debug, Clone)]
pub struct EvidenceRecorder {
    max_content_bytes: usize,
}

impl Default for EvidenceRecorder {
    fn default() -> Self {
        Self {
            max_content_bytes: Self::DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}

impl EvidenceRecorder {
    pub const DEFAULT_MAX_CONTENT_BYTES: usize = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_content_bytes(mut self, max: usize) -> Self {
        self.max_content_bytes = max;
        self
    }

    /// Digest of the canonical serialization. Pure.
    pub fn digest(&self, content: &EvidenceContent) -> Result<Hash, ValidationError> {
        let bytes = content.canonical_bytes()?;
        if bytes.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if bytes.len() > self.max_content_bytes {
            return Err(ValidationError::ContentTooLarge {
                size: bytes.len(),
                max: self.max_content_bytes,
            });
        }
        Ok(Hash::digest(&bytes))
    }

    /// Build a new record with a fresh id and the current time
    pub fn record(
        &self,
        content: &EvidenceContent,
        source_type: SourceType,
        metadata: serde_json::Value,
    ) -> Result<EvidenceRecord, ValidationError> {
        self.record_at(content, source_type, metadata, Uuid::new_v4(), Utc::now())
    }

    /// Build a record with caller-supplied identity and timestamp
    pub fn record_at(
        &self,
        content: &EvidenceContent,
        source_type: SourceType,
        metadata: serde_json::Value,
        id: EvidenceId,
        created_at: DateTime<Utc>,
    ) -> Result<EvidenceRecord, ValidationError> {
        if !(metadata.is_object() || metadata.is_null()) {
            return Err(ValidationError::InvalidMetadata(
                "metadata must be a JSON object".to_string(),
            ));
        }
        if let SourceType::Custom(label) = &source_type {
            if label.trim().is_empty() {
                return Err(ValidationError::InvalidMetadata(
                    "custom source type needs a label".to_string(),
                ));
            }
        }

        let content_hash = self.digest(content)?;

        Ok(EvidenceRecord {
            id,
            content_hash,
            source_type,
            created_at,
            metadata,
        })
    }
}
