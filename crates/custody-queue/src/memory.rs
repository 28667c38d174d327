//! In-memory outbox implementation
//!
//! All state sits behind one async mutex, so every operation (including
//! `claim_next`) is atomic with respect to every other. Not durable; use
//! it for tests and single-process setups.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use custody_core::{AnchorBatch, BatchId, Chain, EvidenceId, MerkleProof};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::{check_claim, validate_enqueue, OutboxError, OutboxStats, OutboxStore};
use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};
use crate::job::{FailureClass, JobFailure, JobId, JobState, OutboxJob, TxRef};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, OutboxJob>,
    /// Insertion order, for stable FIFO tie-breaking
    order: Vec<JobId>,
    tx_refs: Vec<TxRef>,
    batches: HashMap<BatchId, AnchorBatch>,
    evidence_index: HashMap<EvidenceId, (BatchId, usize)>,
}

impl Inner {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut OutboxJob, OutboxError> {
        self.jobs.get_mut(&job_id).ok_or(OutboxError::NotFound(job_id))
    }

    fn live_tx_mut(&mut self, job_id: JobId) -> Option<&mut TxRef> {
        self.tx_refs
            .iter_mut()
            .rev()
            .find(|t| t.job_id == job_id && !t.abandoned)
    }
}

fn transition(job: &mut OutboxJob, to: JobState, now: DateTime<Utc>) -> Result<(), OutboxError> {
    if !job.state.can_transition_to(to) {
        return Err(OutboxError::InvalidTransition {
            job_id: job.job_id,
            from: job.state,
            to,
        });
    }
    job.state = to;
    job.updated_at = now;
    if to != JobState::Submitting {
        job.claimed_at = None;
    }
    Ok(())
}

#[derive(Debug)]
pub struct MemoryOutbox {
    inner: Mutex<Inner>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Arc::new(SystemClock))
    }
}

impl MemoryOutbox {
    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    async fn submitted_transition(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
        count_attempt: bool,
    ) -> Result<TxRef, OutboxError> {
        let now = self.clock.now();
        let job_id = claim.job_id;
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        check_claim(job, claim, JobState::Submitted)?;
        transition(job, JobState::Submitted, now)?;
        if count_attempt {
            job.attempt_count = job.attempt_count.saturating_add(1);
        }
        job.needs_reconcile = false;
        job.last_error = None;

        let tx = TxRef::new(job_id, job.chain, tx_reference, now);
        inner.tx_refs.push(tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn enqueue(
        &self,
        batch: &AnchorBatch,
        chains: &[Chain],
    ) -> Result<Vec<OutboxJob>, OutboxError> {
        let chains = validate_enqueue(batch, chains)?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if inner.batches.contains_key(&batch.batch_id) {
            return Err(OutboxError::Invalid(format!(
                "batch {} already enqueued",
                batch.batch_id
            )));
        }

        for (index, member) in batch.members.iter().enumerate() {
            inner
                .evidence_index
                .insert(member.evidence_id, (batch.batch_id, index));
        }
        inner.batches.insert(batch.batch_id, batch.clone());

        let mut created = Vec::with_capacity(chains.len());
        for chain in chains {
            let job = OutboxJob::new(batch.batch_id, chain, batch.merkle_root, now);
            inner.order.push(job.job_id);
            inner.jobs.insert(job.job_id, job.clone());
            created.push(job);
        }

        tracing::debug!(batch_id = %batch.batch_id, jobs = created.len(), "Batch enqueued");
        Ok(created)
    }

    async fn claim_next(&self, chains: &[Chain]) -> Result<Option<OutboxJob>, OutboxError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let next = inner
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| inner.jobs.get(id).map(|j| (pos, j)))
            .filter(|(_, j)| j.is_ready(now) && chains.contains(&j.chain))
            .min_by_key(|(pos, j)| (j.next_attempt_at, *pos))
            .map(|(_, j)| j.job_id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = inner.job_mut(job_id)?;
        transition(job, JobState::Submitting, now)?;
        job.claimed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn record_submission(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
    ) -> Result<TxRef, OutboxError> {
        self.submitted_transition(claim, tx_reference, true).await
    }

    async fn record_existing(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
    ) -> Result<TxRef, OutboxError> {
        self.submitted_transition(claim, tx_reference, false).await
    }

    async fn record_confirmation(
        &self,
        job_id: JobId,
        confirmations: u64,
    ) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        if job.state == JobState::Confirmed {
            return Ok(());
        }
        transition(job, JobState::Confirmed, now)?;

        if let Some(tx) = inner.live_tx_mut(job_id) {
            tx.confirmed_at = Some(now);
            tx.confirmations = confirmations;
        }
        Ok(())
    }

    async fn record_progress(&self, job_id: JobId, confirmations: u64) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = inner.live_tx_mut(job_id) {
            tx.confirmations = confirmations;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        claim: &OutboxJob,
        failure: &JobFailure,
    ) -> Result<OutboxJob, OutboxError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(claim.job_id)?;
        check_claim(job, claim, JobState::Queued)?;

        let outcome = self
            .policy
            .on_failure(failure.class, job.attempt_count, now);
        transition(job, outcome.state, now)?;
        job.attempt_count = outcome.attempt_count;
        job.next_attempt_at = outcome.next_attempt_at;
        job.last_error = Some(failure.describe());
        Ok(job.clone())
    }

    async fn record_dropped(&self, job_id: JobId, reason: &str) -> Result<OutboxJob, OutboxError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        if job.state != JobState::Submitted {
            return Err(OutboxError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Queued,
            });
        }

        let outcome = self
            .policy
            .requeue_or_fail(FailureClass::Transient, job.attempt_count, now);
        transition(job, outcome.state, now)?;
        job.next_attempt_at = outcome.next_attempt_at;
        job.last_error = Some(format!("dropped: {reason}"));
        job.needs_reconcile = true;

        if let Some(tx) = inner.live_tx_mut(job_id) {
            tx.abandoned = true;
        }
        let job = inner.job_mut(job_id)?;
        Ok(job.clone())
    }

    async fn recover_stale(&self, timeout: Duration) -> Result<Vec<OutboxJob>, OutboxError> {
        let now = self.clock.now();
        let cutoff = now - timeout;
        let mut inner = self.inner.lock().await;

        let mut recovered = Vec::new();
        for job in inner.jobs.values_mut() {
            let stale = job.state == JobState::Submitting
                && job.claimed_at.map(|t| t <= cutoff).unwrap_or(true);
            if stale {
                transition(job, JobState::Queued, now)?;
                job.next_attempt_at = now;
                job.needs_reconcile = true;
                job.last_error = Some("recovered: submission interrupted".to_string());
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn get_job(&self, job_id: JobId) -> Result<OutboxJob, OutboxError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(OutboxError::NotFound(job_id))
    }

    async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<OutboxJob>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|j| j.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<OutboxJob>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|j| j.state == state)
            .cloned()
            .collect())
    }

    async fn submitted_jobs(&self) -> Result<Vec<(OutboxJob, TxRef)>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|j| j.state == JobState::Submitted)
            .filter_map(|j| {
                inner
                    .tx_refs
                    .iter()
                    .rev()
                    .find(|t| t.job_id == j.job_id && !t.abandoned)
                    .map(|t| (j.clone(), t.clone()))
            })
            .collect())
    }

    async fn tx_refs(&self, job_id: JobId) -> Result<Vec<TxRef>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tx_refs
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<AnchorBatch>, OutboxError> {
        Ok(self.inner.lock().await.batches.get(&batch_id).cloned())
    }

    async fn batch_for_evidence(
        &self,
        evidence_id: EvidenceId,
    ) -> Result<Option<AnchorBatch>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .evidence_index
            .get(&evidence_id)
            .and_then(|(batch_id, _)| inner.batches.get(batch_id))
            .cloned())
    }

    async fn proof_for_evidence(
        &self,
        evidence_id: EvidenceId,
    ) -> Result<Option<MerkleProof>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .evidence_index
            .get(&evidence_id)
            .and_then(|(batch_id, index)| {
                inner
                    .batches
                    .get(batch_id)
                    .and_then(|b| b.tree().proof(*index))
            }))
    }

    async fn next_ready_at(&self, chains: &[Chain]) -> Result<Option<DateTime<Utc>>, OutboxError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && chains.contains(&j.chain))
            .map(|j| j.next_attempt_at)
            .min())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let inner = self.inner.lock().await;
        let mut stats = OutboxStats {
            batches: inner.batches.len() as u64,
            ..OutboxStats::default()
        };
        for job in inner.jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}
