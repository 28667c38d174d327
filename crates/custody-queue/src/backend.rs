//! Outbox store contract

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use custody_core::{AnchorBatch, BatchId, Chain, EvidenceId, MerkleProof};
use serde::{Deserialize, Serialize};

use crate::job::{JobFailure, JobId, JobState, OutboxJob, TxRef};
use crate::status::{BatchStatus, QuorumPolicy};

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    /// The job was recovered and claimed again since this claim was taken
    #[error("Claim on job {0} is no longer held")]
    ClaimLost(JobId),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub queued: u64,
    pub submitting: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub batches: u64,
}

impl OutboxStats {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Submitting => self.submitting += n,
            JobState::Submitted => self.submitted += n,
            JobState::Confirmed => self.confirmed += n,
            JobState::Failed => self.failed += n,
        }
    }
}

/// Durable, transactional job queue.
///
/// The store is the single source of truth for job state. It enforces the
/// state machine in [`JobState::can_transition_to`] and guarantees that
/// concurrent `claim_next` callers never receive the same job.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a batch and create one `Queued` job per distinct target chain
    async fn enqueue(
        &self,
        batch: &AnchorBatch,
        chains: &[Chain],
    ) -> Result<Vec<OutboxJob>, OutboxError>;

    /// Atomically claim the oldest ready job for one of `chains`,
    /// moving it to `Submitting`
    async fn claim_next(&self, chains: &[Chain]) -> Result<Option<OutboxJob>, OutboxError>;

    /// `Submitting → Submitted`, recording the transaction reference and
    /// counting the attempt.
    ///
    /// `claim` is the job as returned by `claim_next`. Writes for a claim
    /// that was recovered and handed to another caller fail with
    /// [`OutboxError::ClaimLost`].
    async fn record_submission(&self, claim: &OutboxJob, tx_reference: &str)
        -> Result<TxRef, OutboxError>;

    /// `Submitting → Submitted` for a transaction found on-chain during
    /// reconciliation; does not count as an attempt
    async fn record_existing(&self, claim: &OutboxJob, tx_reference: &str)
        -> Result<TxRef, OutboxError>;

    /// `Submitted → Confirmed`
    async fn record_confirmation(&self, job_id: JobId, confirmations: u64)
        -> Result<(), OutboxError>;

    /// Update the confirmation count of the live transaction
    async fn record_progress(&self, job_id: JobId, confirmations: u64) -> Result<(), OutboxError>;

    /// Record a failed submission attempt; re-queues with backoff or moves
    /// the job to `Failed`. Fenced on `claim` like `record_submission`.
    async fn record_failure(&self, claim: &OutboxJob, failure: &JobFailure)
        -> Result<OutboxJob, OutboxError>;

    /// `Submitted → Queued` for a dropped or stale transaction, abandoning
    /// its TxRef. Moves to `Failed` once attempts are exhausted.
    async fn record_dropped(&self, job_id: JobId, reason: &str) -> Result<OutboxJob, OutboxError>;

    /// Return jobs stuck in `Submitting` for longer than `timeout` to the queue
    async fn recover_stale(&self, timeout: Duration) -> Result<Vec<OutboxJob>, OutboxError>;

    async fn get_job(&self, job_id: JobId) -> Result<OutboxJob, OutboxError>;

    async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<OutboxJob>, OutboxError>;

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<OutboxJob>, OutboxError>;

    /// `Submitted` jobs with their live (non-abandoned) transaction
    async fn submitted_jobs(&self) -> Result<Vec<(OutboxJob, TxRef)>, OutboxError>;

    /// Every transaction ever recorded for a job, oldest first
    async fn tx_refs(&self, job_id: JobId) -> Result<Vec<TxRef>, OutboxError>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<AnchorBatch>, OutboxError>;

    async fn batch_for_evidence(&self, evidence_id: EvidenceId)
        -> Result<Option<AnchorBatch>, OutboxError>;

    async fn proof_for_evidence(&self, evidence_id: EvidenceId)
        -> Result<Option<MerkleProof>, OutboxError>;

    /// Earliest `next_attempt_at` among queued jobs for `chains`
    async fn next_ready_at(&self, chains: &[Chain]) -> Result<Option<DateTime<Utc>>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;

    async fn batch_status(
        &self,
        batch_id: BatchId,
        quorum: QuorumPolicy,
    ) -> Result<BatchStatus, OutboxError> {
        let jobs = self.jobs_for_batch(batch_id).await?;
        if jobs.is_empty() {
            return Err(OutboxError::BatchNotFound(batch_id));
        }
        Ok(BatchStatus::evaluate(&jobs, quorum))
    }
}

/// Check that `current` is still in `Submitting` under the claim `claim`
/// was handed out with
pub fn check_claim(current: &OutboxJob, claim: &OutboxJob, to: JobState) -> Result<(), OutboxError> {
    if current.state != JobState::Submitting {
        return Err(OutboxError::InvalidTransition {
            job_id: current.job_id,
            from: current.state,
            to,
        });
    }
    if claim.claimed_at.is_none() || current.claimed_at != claim.claimed_at {
        return Err(OutboxError::ClaimLost(current.job_id));
    }
    Ok(())
}

/// Deduplicate target chains, keeping first-seen order
fn distinct_chains(chains: &[Chain]) -> Vec<Chain> {
    let mut out = Vec::with_capacity(chains.len());
    for c in chains {
        if !out.contains(c) {
            out.push(*c);
        }
    }
    out
}

/// Shared enqueue precondition
pub fn validate_enqueue(batch: &AnchorBatch, chains: &[Chain]) -> Result<Vec<Chain>, OutboxError> {
    if batch.is_empty() {
        return Err(OutboxError::Invalid("batch has no members".into()));
    }
    if !batch.verify_root() {
        return Err(OutboxError::Invalid(format!(
            "batch {} root does not match its members",
            batch.batch_id
        )));
    }
    let chains = distinct_chains(chains);
    if chains.is_empty() {
        return Err(OutboxError::Invalid("no target chains".into()));
    }
    Ok(chains)
}
