//! Anchor orchestrator - the keeper's scheduling loop
//!
//! Two passes share one store:
//! - the submit pass claims a ready job, validates the signer and
//!   destination addresses, asks the provider for an existing anchor when the
//!   job was interrupted before, then submits;
//! - the confirm pass polls every `Submitted` job and either confirms it,
//!   records progress, or demotes a dropped transaction back to the queue.
//!
//! Every provider call runs under its own timeout. All outcomes land in the
//! store; nothing about a job lives only in memory. Writes made under a claim
//! that was recovered and handed to another keeper are refused by the store
//! and abandoned here.

use chrono::{DateTime, Utc};
use custody_anchor::{
    AddressValidator, ChainAnchorProvider, ConfirmationStatus, ProviderError, ProviderRegistry,
};
use custody_queue::{
    Clock, JobFailure, JobId, JobState, OutboxError, OutboxJob, OutboxStore, TxRef,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Longest idle wait between submit passes
    pub poll_interval: Duration,
    pub confirm_poll_interval: Duration,
    /// Age after which a `Submitting` claim is treated as abandoned
    pub recovery_timeout: Duration,
    /// Age after which an unmined transaction is treated as dropped
    pub confirm_timeout: Duration,
    /// Deadline for each provider call
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            confirm_poll_interval: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(300),
            confirm_timeout: Duration::from_secs(900),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// What one submit pass did with the job it claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Provider accepted a new transaction
    Submitted { job_id: JobId, tx: TxRef },
    /// The root was already anchored by an earlier, interrupted attempt
    Reconciled { job_id: JobId, tx: TxRef },
    /// Failure recorded, job re-queued with backoff
    Retrying {
        job_id: JobId,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// Failure recorded, job is terminal
    Failed { job_id: JobId, error: String },
}

impl SubmitOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Submitted { job_id, .. }
            | Self::Reconciled { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Tally of one confirm pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmSummary {
    pub confirmed: usize,
    pub pending: usize,
    pub dropped: usize,
    /// Provider calls or store writes that failed; retried next pass
    pub errors: usize,
}

/// Drives outbox jobs through the chain providers
pub struct AnchorOrchestrator {
    store: Arc<dyn OutboxStore>,
    registry: Arc<ProviderRegistry>,
    validator: AddressValidator,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for AnchorOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorOrchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AnchorOrchestrator {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            validator: AddressValidator::new(),
            clock,
            config,
        }
    }

    pub fn with_validator(mut self, validator: AddressValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Return stale `Submitting` claims to the queue
    pub async fn recover(&self) -> Result<Vec<OutboxJob>, OutboxError> {
        let timeout = chrono::Duration::from_std(self.config.recovery_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let recovered = self.store.recover_stale(timeout).await?;
        for job in &recovered {
            warn!(job_id = %job.job_id, chain = %job.chain, "Recovered interrupted submission");
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Crash recovery re-queued jobs");
        }
        Ok(recovered)
    }

    /// Claim and process at most one ready job
    pub async fn submit_once(&self) -> Result<Option<SubmitOutcome>, OutboxError> {
        let chains = self.registry.ready_chains();
        if chains.is_empty() {
            return Ok(None);
        }
        let Some(job) = self.store.claim_next(&chains).await? else {
            return Ok(None);
        };
        debug!(job_id = %job.job_id, chain = %job.chain, attempt = job.attempt_count + 1, "Claimed job");

        match self.process(&job).await {
            Err(OutboxError::ClaimLost(job_id)) => {
                warn!(job_id = %job_id, chain = %job.chain, "Claim superseded by recovery; dropping result");
                Ok(None)
            }
            other => other.map(Some),
        }
    }

    async fn process(&self, job: &OutboxJob) -> Result<SubmitOutcome, OutboxError> {
        let provider: Arc<dyn ChainAnchorProvider> = match self.registry.get(job.chain) {
            Some(p) => p.clone(),
            None => {
                let failure =
                    JobFailure::permanent(format!("no provider registered for {}", job.chain));
                return self.fail(job, failure).await;
            }
        };

        // Fail fast on malformed addresses, before any provider call
        if let Err(failure) = self.check_addresses(job, provider.as_ref()) {
            return self.fail(job, failure).await;
        }

        if job.needs_reconcile || job.attempt_count > 0 {
            match self
                .call(provider.find_existing(&job.merkle_root), "find_existing")
                .await
            {
                Ok(Some(tx_reference)) => {
                    let tx = self.store.record_existing(job, &tx_reference).await?;
                    info!(
                        job_id = %job.job_id,
                        chain = %job.chain,
                        tx_reference = %tx.tx_reference,
                        "Root already anchored; adopting existing transaction"
                    );
                    return Ok(SubmitOutcome::Reconciled {
                        job_id: job.job_id,
                        tx,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_rate_limited() => {
                    return self.provider_failure(job, e).await;
                }
                Err(e) => {
                    // Resubmitting an anchored root is harmless
                    warn!(job_id = %job.job_id, error = %e, "Existing-anchor lookup failed; resubmitting");
                }
            }
        }

        let memo = format!("batch:{}", job.batch_id);
        match self
            .call(provider.submit(&job.merkle_root, &memo), "submit")
            .await
        {
            Ok(receipt) => {
                self.registry.gate().note_success(job.chain);
                let tx = self
                    .store
                    .record_submission(job, &receipt.tx_reference)
                    .await?;
                info!(
                    job_id = %job.job_id,
                    chain = %job.chain,
                    attempt = job.attempt_count + 1,
                    tx_reference = %tx.tx_reference,
                    "Batch root submitted"
                );
                Ok(SubmitOutcome::Submitted {
                    job_id: job.job_id,
                    tx,
                })
            }
            Err(e) => self.provider_failure(job, e).await,
        }
    }

    fn check_addresses(
        &self,
        job: &OutboxJob,
        provider: &dyn ChainAnchorProvider,
    ) -> Result<(), JobFailure> {
        let format = AddressValidator::describe(job.chain);
        let check = |role: &str, address: &str| {
            self.validator.validate(job.chain, address).map(|_| ()).map_err(|e| {
                JobFailure::validation(format!("{} {} (expected {})", role, e, format.format))
            })
        };
        check("signer", provider.address())?;
        if let Some(destination) = provider.destination() {
            check("destination", destination)?;
        }
        Ok(())
    }

    /// Poll every `Submitted` job once.
    ///
    /// A failed store write for one job is counted in `errors` and does not
    /// stop the pass.
    pub async fn confirm_once(&self) -> Result<ConfirmSummary, OutboxError> {
        let mut summary = ConfirmSummary::default();

        for (job, tx) in self.store.submitted_jobs().await? {
            let Some(provider) = self.registry.get(job.chain).cloned() else {
                continue;
            };
            if !self.registry.gate().is_open(job.chain) {
                continue;
            }
            if let Err(e) = self.confirm_job(provider.as_ref(), &job, &tx, &mut summary).await {
                warn!(job_id = %job.job_id, chain = %job.chain, error = %e, "Could not record confirmation result");
                summary.errors += 1;
            }
        }

        Ok(summary)
    }

    async fn confirm_job(
        &self,
        provider: &dyn ChainAnchorProvider,
        job: &OutboxJob,
        tx: &TxRef,
        summary: &mut ConfirmSummary,
    ) -> Result<(), OutboxError> {
        let status = match self.call(provider.confirm(tx), "confirm").await {
            Ok(status) => status,
            Err(e) => {
                if e.is_rate_limited() {
                    self.registry.gate().note_rate_limited(job.chain, e.retry_after());
                }
                warn!(job_id = %job.job_id, chain = %job.chain, error = %e, "Confirmation poll failed");
                summary.errors += 1;
                if self.is_stale(tx) {
                    self.drop_tx(job, tx, "confirmation timeout").await?;
                    summary.dropped += 1;
                }
                return Ok(());
            }
        };

        match status {
            ConfirmationStatus::Dropped { reason } => {
                self.drop_tx(job, tx, &reason).await?;
                summary.dropped += 1;
            }
            status if status.is_final() => {
                let confirmations = status.confirmations();
                self.store.record_confirmation(job.job_id, confirmations).await?;
                info!(
                    job_id = %job.job_id,
                    chain = %job.chain,
                    tx_reference = %tx.tx_reference,
                    confirmations,
                    "Anchor confirmed"
                );
                summary.confirmed += 1;
            }
            status => {
                let confirmations = status.confirmations();
                if confirmations == 0 && self.is_stale(tx) {
                    self.drop_tx(job, tx, "confirmation timeout").await?;
                    summary.dropped += 1;
                } else {
                    self.store.record_progress(job.job_id, confirmations).await?;
                    debug!(job_id = %job.job_id, confirmations, "Awaiting confirmation");
                    summary.pending += 1;
                }
            }
        }
        Ok(())
    }

    /// Run both passes until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(chains = ?self.registry.chains(), "Anchor orchestrator started");
        if let Err(e) = self.recover().await {
            error!(error = %e, "Startup recovery failed");
        }

        let floor = Duration::from_millis(10);
        let mut confirm_tick = tokio::time::interval(self.config.confirm_poll_interval.max(floor));
        let mut recovery_tick = tokio::time::interval(self.config.recovery_timeout.max(floor));
        recovery_tick.tick().await;

        while !*shutdown.borrow() {
            loop {
                match self.submit_once().await {
                    Ok(Some(_)) if !*shutdown.borrow() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!(error = %e, "Submit pass failed");
                        break;
                    }
                }
            }

            let idle = self.idle_delay().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = confirm_tick.tick() => {
                    match self.confirm_once().await {
                        Ok(s) if s != ConfirmSummary::default() => debug!(
                            confirmed = s.confirmed,
                            pending = s.pending,
                            dropped = s.dropped,
                            errors = s.errors,
                            "Confirm pass finished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Confirm pass failed"),
                    }
                }
                _ = recovery_tick.tick() => {
                    if let Err(e) = self.recover().await {
                        error!(error = %e, "Recovery pass failed");
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!("Anchor orchestrator stopped");
    }

    /// How long to sleep before the next submit pass
    async fn idle_delay(&self) -> Duration {
        let now = self.clock.now();
        let mut delay = self.config.poll_interval;
        let mut shorten = |at: Option<DateTime<Utc>>| {
            if let Some(wait) = at.and_then(|t| (t - now).to_std().ok()) {
                delay = delay.min(wait);
            }
        };

        match self.store.next_ready_at(&self.registry.ready_chains()).await {
            Ok(at) => shorten(at.filter(|t| *t > now)),
            Err(e) => warn!(error = %e, "Could not read next ready time"),
        }
        shorten(self.registry.next_open_at().filter(|t| *t > now));

        delay.max(Duration::from_millis(10))
    }

    async fn call<T, F>(&self, fut: F, op: &str) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "{} exceeded {:?}",
                op, self.config.call_timeout
            ))),
        }
    }

    fn is_stale(&self, tx: &TxRef) -> bool {
        let age = self.clock.now() - tx.submitted_at;
        age.to_std().map(|a| a >= self.config.confirm_timeout).unwrap_or(false)
    }

    async fn drop_tx(&self, job: &OutboxJob, tx: &TxRef, reason: &str) -> Result<(), OutboxError> {
        let updated = self.store.record_dropped(job.job_id, reason).await?;
        warn!(
            job_id = %job.job_id,
            chain = %job.chain,
            tx_reference = %tx.tx_reference,
            reason = %reason,
            state = %updated.state,
            "Transaction dropped"
        );
        Ok(())
    }

    async fn provider_failure(
        &self,
        job: &OutboxJob,
        err: ProviderError,
    ) -> Result<SubmitOutcome, OutboxError> {
        if err.is_rate_limited() {
            self.registry
                .gate()
                .note_rate_limited(job.chain, err.retry_after());
        }
        let failure = JobFailure {
            class: err.class(),
            message: err.to_string(),
        };
        self.fail(job, failure).await
    }

    async fn fail(&self, job: &OutboxJob, failure: JobFailure) -> Result<SubmitOutcome, OutboxError> {
        let updated = self.store.record_failure(job, &failure).await?;
        let error = failure.describe();

        if updated.state == JobState::Failed {
            error!(
                job_id = %job.job_id,
                chain = %job.chain,
                attempt = updated.attempt_count,
                error = %error,
                "Job failed permanently; operator action required"
            );
            return Ok(SubmitOutcome::Failed {
                job_id: job.job_id,
                error,
            });
        }

        let delay_secs = (updated.next_attempt_at - self.clock.now()).num_milliseconds() as f64 / 1000.0;
        warn!(
            job_id = %job.job_id,
            chain = %job.chain,
            attempt = updated.attempt_count,
            delay_secs,
            error = %error,
            "Submission failed, scheduling retry with backoff"
        );
        Ok(SubmitOutcome::Retrying {
            job_id: job.job_id,
            attempt: updated.attempt_count,
            next_attempt_at: updated.next_attempt_at,
            error,
        })
    }
}
