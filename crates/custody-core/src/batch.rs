//! Batching evidence digests into Merkle-committed anchor batches
//!
//! A batch is flushed when it reaches `max_batch_size` records or when the
//! oldest pending record is `max_batch_age` old, whichever comes first.
//! Only the root is anchored on-chain; each member keeps an inclusion proof.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::{EvidenceId, EvidenceRecord};
use crate::merkle::{Hash, MerkleProof, MerkleTree};

/// Batch identifier
pub type BatchId = Uuid;

/// Configuration for batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of evidence items per batch
    pub max_batch_size: usize,
    /// Maximum age of the oldest pending item before a partial batch is flushed
    pub max_batch_age: Duration,
    /// Minimum batch size for an age-triggered flush
    pub min_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_age: Duration::seconds(60),
            min_batch_size: 1,
        }
    }
}

/// One leaf of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub evidence_id: EvidenceId,
    pub digest: Hash,
}

/// An ordered set of digests committed to a single Merkle root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorBatch {
    pub batch_id: BatchId,
    pub members: Vec<BatchMember>,
    pub merkle_root: Hash,
    pub created_at: DateTime<Utc>,
}

impl AnchorBatch {
    /// Build a batch, computing its root. Returns `None` for an empty member list.
    pub fn new(members: Vec<BatchMember>, created_at: DateTime<Utc>) -> Option<Self> {
        Self::with_id(Uuid::new_v4(), members, created_at)
    }

    pub fn with_id(
        batch_id: BatchId,
        members: Vec<BatchMember>,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        let tree = MerkleTree::from_leaves(members.iter().map(|m| m.digest).collect());
        let merkle_root = *tree.root_hash()?;
        Some(Self {
            batch_id,
            members,
            merkle_root,
            created_at,
        })
    }

    pub fn from_records(records: &[EvidenceRecord], created_at: DateTime<Utc>) -> Option<Self> {
        Self::new(
            records
                .iter()
                .map(|r| BatchMember {
                    evidence_id: r.id,
                    digest: r.content_hash,
                })
                .collect(),
            created_at,
        )
    }

    pub fn ordered_digests(&self) -> Vec<Hash> {
        self.members.iter().map(|m| m.digest).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Recompute the root from the member list
    pub fn tree(&self) -> MerkleTree {
        MerkleTree::from_leaves(self.ordered_digests())
    }

    pub fn verify_root(&self) -> bool {
        self.tree()
            .root_hash()
            .map(|root| root.ct_eq(&self.merkle_root))
            .unwrap_or(false)
    }

    /// Inclusion proofs for every member, in leaf order
    pub fn proofs(&self) -> Vec<MerkleProof> {
        let tree = self.tree();
        (0..self.members.len())
            .filter_map(|i| tree.proof(i))
            .collect()
    }
}

/// Collects pending evidence records and cuts them into batches
#[derive(Debug)]
pub struct MerkleBatcher {
    config: BatchConfig,
    pending: Vec<EvidenceRecord>,
    /// When the first record of the current pending set arrived
    opened_at: Option<DateTime<Utc>>,
}

impl MerkleBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            opened_at: None,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// When the current pending set becomes due by age
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.opened_at.map(|t| t + self.config.max_batch_age)
    }

    /// Add a record. Returns a batch if this push reached the size threshold.
    pub fn push(&mut self, record: EvidenceRecord, now: DateTime<Utc>) -> Option<AnchorBatch> {
        if self.pending.is_empty() {
            self.opened_at = Some(now);
        }
        self.pending.push(record);

        if self.pending.len() >= self.config.max_batch_size {
            tracing::debug!(size = self.pending.len(), "Batch size threshold reached");
            return self.take(now);
        }
        None
    }

    /// Flush if the pending set is old enough and meets the minimum size
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<AnchorBatch> {
        let deadline = self.deadline()?;
        if now >= deadline && self.pending.len() >= self.config.min_batch_size.max(1) {
            tracing::debug!(size = self.pending.len(), "Batch age threshold reached");
            return self.take(now);
        }
        None
    }

    /// Flush whatever is pending. An empty pending set yields no batch.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<AnchorBatch> {
        self.take(now)
    }

    fn take(&mut self, now: DateTime<Utc>) -> Option<AnchorBatch> {
        self.opened_at = None;
        let records = std::mem::take(&mut self.pending);
        AnchorBatch::from_records(&records, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceContent, EvidenceRecorder, SourceType};
    use serde_json::json;

    fn record(i: usize) -> EvidenceRecord {
        EvidenceRecorder::new()
            .record(
                &EvidenceContent::Bytes(format!("evidence-{i}").into_bytes()),
                SourceType::DetectionSession,
                json!({}),
            )
            .unwrap()
    }

    fn config(size: usize, age_secs: i64, min: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size: size,
            max_batch_age: Duration::seconds(age_secs),
            min_batch_size: min,
        }
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut batcher = MerkleBatcher::new(BatchConfig::default());
        let now = Utc::now();
        assert!(batcher.flush(now).is_none());
        assert!(batcher.flush(now).is_none());
        assert!(batcher.poll(now + Duration::hours(1)).is_none());
    }

    #[test]
    fn test_size_threshold_flushes() {
        let mut batcher = MerkleBatcher::new(config(3, 60, 1));
        let now = Utc::now();

        assert!(batcher.push(record(0), now).is_none());
        assert!(batcher.push(record(1), now).is_none());
        let batch = batcher.push(record(2), now).expect("third record fills the batch");

        assert_eq!(batch.len(), 3);
        assert_eq!(batcher.pending_len(), 0);
        assert!(batch.verify_root());
    }

    #[test]
    fn test_age_threshold_flushes() {
        let mut batcher = MerkleBatcher::new(config(100, 10, 1));
        let start = Utc::now();
        batcher.push(record(0), start);

        assert!(batcher.poll(start + Duration::seconds(9)).is_none());
        let batch = batcher.poll(start + Duration::seconds(10)).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batcher.deadline().is_none());
    }

    #[test]
    fn test_age_flush_respects_min_batch_size() {
        let mut batcher = MerkleBatcher::new(config(100, 1, 2));
        let start = Utc::now();
        batcher.push(record(0), start);

        assert!(batcher.poll(start + Duration::seconds(5)).is_none());
        batcher.push(record(1), start + Duration::seconds(5));
        assert_eq!(batcher.poll(start + Duration::seconds(5)).unwrap().len(), 2);
    }

    #[test]
    fn test_members_keep_push_order() {
        let mut batcher = MerkleBatcher::new(config(10, 60, 1));
        let now = Utc::now();
        let records: Vec<_> = (0..4).map(record).collect();
        for r in &records {
            batcher.push(r.clone(), now);
        }
        let batch = batcher.flush(now).unwrap();

        let ids: Vec<_> = batch.members.iter().map(|m| m.evidence_id).collect();
        assert_eq!(ids, records.iter().map(|r| r.id).collect::<Vec<_>>());
    }

    #[test]
    fn test_identical_members_give_identical_root() {
        let records: Vec<_> = (0..5).map(record).collect();
        let a = AnchorBatch::from_records(&records, Utc::now()).unwrap();
        let b = AnchorBatch::from_records(&records, Utc::now()).unwrap();

        assert_ne!(a.batch_id, b.batch_id);
        assert_eq!(a.merkle_root, b.merkle_root);
    }

    #[test]
    fn test_every_member_proof_verifies() {
        let records: Vec<_> = (0..7).map(record).collect();
        let batch = AnchorBatch::from_records(&records, Utc::now()).unwrap();
        let proofs = batch.proofs();

        assert_eq!(proofs.len(), 7);
        for (i, proof) in proofs.iter().enumerate() {
            assert_eq!(proof.leaf, batch.members[i].digest);
            assert!(proof.verify(&batch.merkle_root));
        }
    }
}
