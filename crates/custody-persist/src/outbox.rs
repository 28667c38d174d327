//! Durable outbox on SQLite
//!
//! Every state change is a single guarded `UPDATE ... WHERE state = ?`, so
//! two keepers sharing one database can never both move the same job.
//! `claim_next` selects and claims in one statement.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use custody_core::{AnchorBatch, BatchId, BatchMember, Chain, EvidenceId, Hash, MerkleProof};
use custody_queue::{
    BackoffPolicy, Clock, FailureClass, JobFailure, JobId, JobState, OutboxError, OutboxJob,
    OutboxStats, OutboxStore, SystemClock, TxRef,
};
use custody_queue::backend::{check_claim, validate_enqueue};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, batch_id, chain, merkle_root, state, attempt_count, next_attempt_at, \
     last_error, claimed_at, needs_reconcile, created_at, updated_at";

const TX_COLUMNS: &str =
    "job_id, chain, tx_reference, submitted_at, confirmed_at, confirmations, abandoned";

fn db(e: sqlx::Error) -> OutboxError {
    OutboxError::Backend(e.to_string())
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(v: i64) -> Result<DateTime<Utc>, OutboxError> {
    DateTime::from_timestamp_millis(v)
        .ok_or_else(|| OutboxError::Backend(format!("Invalid timestamp in DB: {}", v)))
}

fn parse_uuid(s: &str) -> Result<Uuid, OutboxError> {
    Uuid::parse_str(s).map_err(|_| OutboxError::Backend(format!("Invalid UUID in DB: {}", s)))
}

/// `?, ?, ?` for an `IN (...)` list
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn job_from_row(row: &SqliteRow) -> Result<OutboxJob, OutboxError> {
    let id: String = row.try_get("id").map_err(db)?;
    let batch_id: String = row.try_get("batch_id").map_err(db)?;
    let chain: String = row.try_get("chain").map_err(db)?;
    let root: String = row.try_get("merkle_root").map_err(db)?;
    let state: String = row.try_get("state").map_err(db)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(db)?;
    let next_attempt_at: i64 = row.try_get("next_attempt_at").map_err(db)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(db)?;
    let claimed_at: Option<i64> = row.try_get("claimed_at").map_err(db)?;
    let needs_reconcile: i64 = row.try_get("needs_reconcile").map_err(db)?;
    let created_at: i64 = row.try_get("created_at").map_err(db)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(db)?;

    Ok(OutboxJob {
        job_id: parse_uuid(&id)?,
        batch_id: parse_uuid(&batch_id)?,
        chain: chain
            .parse::<Chain>()
            .map_err(|e| OutboxError::Backend(e.to_string()))?,
        merkle_root: Hash::from_hex(&root).map_err(|e| OutboxError::Backend(e.to_string()))?,
        state: state.parse::<JobState>().map_err(OutboxError::Backend)?,
        attempt_count: attempt_count as u32,
        next_attempt_at: from_ms(next_attempt_at)?,
        last_error,
        claimed_at: claimed_at.map(from_ms).transpose()?,
        needs_reconcile: needs_reconcile != 0,
        created_at: from_ms(created_at)?,
        updated_at: from_ms(updated_at)?,
    })
}

fn tx_from_row(row: &SqliteRow) -> Result<TxRef, OutboxError> {
    let job_id: String = row.try_get("job_id").map_err(db)?;
    let chain: String = row.try_get("chain").map_err(db)?;
    let submitted_at: i64 = row.try_get("submitted_at").map_err(db)?;
    let confirmed_at: Option<i64> = row.try_get("confirmed_at").map_err(db)?;
    let confirmations: i64 = row.try_get("confirmations").map_err(db)?;
    let abandoned: i64 = row.try_get("abandoned").map_err(db)?;

    Ok(TxRef {
        job_id: parse_uuid(&job_id)?,
        chain: chain
            .parse::<Chain>()
            .map_err(|e| OutboxError::Backend(e.to_string()))?,
        tx_reference: row.try_get("tx_reference").map_err(db)?,
        submitted_at: from_ms(submitted_at)?,
        confirmed_at: confirmed_at.map(from_ms).transpose()?,
        confirmations: confirmations.max(0) as u64,
        abandoned: abandoned != 0,
    })
}

/// Durable outbox backed by SQLite
#[derive(Debug, Clone)]
pub struct SqliteOutbox {
    pool: SqlitePool,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteOutbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_policy(pool, BackoffPolicy::default(), Arc::new(SystemClock))
    }

    pub fn with_policy(pool: SqlitePool, policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            policy,
            clock,
        }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Distinguish a missing job from one in the wrong state after a
    /// guarded update touched no rows
    async fn rejected(&self, job_id: JobId, to: JobState) -> OutboxError {
        match self.get_job(job_id).await {
            Ok(job) => OutboxError::InvalidTransition {
                job_id,
                from: job.state,
                to,
            },
            Err(e) => e,
        }
    }

    /// Same as `rejected`, for writes fenced on a claim
    async fn claim_rejected(&self, claim: &OutboxJob, to: JobState) -> OutboxError {
        match self.get_job(claim.job_id).await {
            Ok(current) => match check_claim(&current, claim, to) {
                Err(e) => e,
                // Row changed between the update and this read
                Ok(()) => OutboxError::ClaimLost(claim.job_id),
            },
            Err(e) => e,
        }
    }

    async fn mark_submitted(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
        attempt_increment: i64,
    ) -> Result<TxRef, OutboxError> {
        let now = self.clock.now();
        let job_id = claim.job_id;
        let Some(claimed_at) = claim.claimed_at else {
            return Err(self.claim_rejected(claim, JobState::Submitted).await);
        };
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET state = 'submitted',
                attempt_count = attempt_count + ?,
                needs_reconcile = 0,
                last_error = NULL,
                claimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'submitting' AND claimed_at = ?
            RETURNING chain
            "#,
        )
        .bind(attempt_increment)
        .bind(ms(now))
        .bind(job_id.to_string())
        .bind(ms(claimed_at))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.claim_rejected(claim, JobState::Submitted).await);
        };
        let chain: String = row.try_get("chain").map_err(db)?;

        sqlx::query(
            "INSERT INTO outbox_tx_refs (job_id, chain, tx_reference, submitted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(&chain)
        .bind(tx_reference)
        .bind(ms(now))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;

        Ok(TxRef::new(
            job_id,
            chain
                .parse::<Chain>()
                .map_err(|e| OutboxError::Backend(e.to_string()))?,
            tx_reference,
            from_ms(ms(now))?,
        ))
    }

    async fn fetch_jobs(
        &self,
        filter: &str,
        bind: String,
    ) -> Result<Vec<OutboxJob>, OutboxError> {
        let sql = format!(
            "SELECT {} FROM outbox_jobs WHERE {} = ? ORDER BY created_at, rowid",
            JOB_COLUMNS, filter
        );
        let rows = sqlx::query(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteOutbox {
    async fn enqueue(
        &self,
        batch: &AnchorBatch,
        chains: &[Chain],
    ) -> Result<Vec<OutboxJob>, OutboxError> {
        let chains = validate_enqueue(batch, chains)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db)?;

        let existing = sqlx::query("SELECT 1 FROM outbox_batches WHERE id = ?")
            .bind(batch.batch_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        if existing.is_some() {
            return Err(OutboxError::Invalid(format!(
                "batch {} already enqueued",
                batch.batch_id
            )));
        }

        sqlx::query(
            "INSERT INTO outbox_batches (id, merkle_root, leaf_count, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(batch.batch_id.to_string())
        .bind(batch.merkle_root.to_hex())
        .bind(batch.len() as i64)
        .bind(ms(batch.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        for (index, (member, proof)) in batch.members.iter().zip(batch.proofs()).enumerate() {
            sqlx::query(
                "INSERT INTO outbox_batch_members (batch_id, leaf_index, evidence_id, digest, proof) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(batch.batch_id.to_string())
            .bind(index as i64)
            .bind(member.evidence_id.to_string())
            .bind(member.digest.to_hex())
            .bind(serde_json::to_string(&proof)?)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        let mut created = Vec::with_capacity(chains.len());
        for chain in chains {
            let job = OutboxJob::new(batch.batch_id, chain, batch.merkle_root, now);
            sqlx::query(
                r#"
                INSERT INTO outbox_jobs
                    (id, batch_id, chain, merkle_root, state, attempt_count, next_attempt_at,
                     needs_reconcile, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'queued', 0, ?, 0, ?, ?)
                "#,
            )
            .bind(job.job_id.to_string())
            .bind(batch.batch_id.to_string())
            .bind(chain.as_str())
            .bind(batch.merkle_root.to_hex())
            .bind(ms(now))
            .bind(ms(now))
            .bind(ms(now))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
            created.push(job);
        }

        tx.commit().await.map_err(db)?;

        info!(
            batch_id = %batch.batch_id,
            root = %batch.merkle_root,
            leaves = batch.len(),
            jobs = created.len(),
            "Batch enqueued"
        );
        Ok(created)
    }

    async fn claim_next(&self, chains: &[Chain]) -> Result<Option<OutboxJob>, OutboxError> {
        if chains.is_empty() {
            return Ok(None);
        }
        let now = ms(self.clock.now());

        let sql = format!(
            r#"
            UPDATE outbox_jobs
            SET state = 'submitting', claimed_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM outbox_jobs
                WHERE state = 'queued' AND next_attempt_at <= ? AND chain IN ({})
                ORDER BY next_attempt_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            ) AND state = 'queued'
            RETURNING {}
            "#,
            placeholders(chains.len()),
            JOB_COLUMNS
        );

        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(now);
        for chain in chains {
            query = query.bind(chain.as_str());
        }
        let row = query.fetch_optional(&self.pool).await.map_err(db)?;

        match row {
            Some(row) => {
                let job = job_from_row(&row)?;
                debug!(job_id = %job.job_id, chain = %job.chain, attempt = job.attempt_count, "Job claimed");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn record_submission(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
    ) -> Result<TxRef, OutboxError> {
        self.mark_submitted(claim, tx_reference, 1).await
    }

    async fn record_existing(
        &self,
        claim: &OutboxJob,
        tx_reference: &str,
    ) -> Result<TxRef, OutboxError> {
        self.mark_submitted(claim, tx_reference, 0).await
    }

    async fn record_confirmation(
        &self,
        job_id: JobId,
        confirmations: u64,
    ) -> Result<(), OutboxError> {
        let now = ms(self.clock.now());
        let mut tx = self.pool.begin().await.map_err(db)?;

        let updated = sqlx::query(
            "UPDATE outbox_jobs SET state = 'confirmed', updated_at = ? WHERE id = ? AND state = 'submitted'",
        )
        .bind(now)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        if updated.rows_affected() == 0 {
            drop(tx);
            let job = self.get_job(job_id).await?;
            if job.state == JobState::Confirmed {
                return Ok(());
            }
            return Err(OutboxError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Confirmed,
            });
        }

        sqlx::query(
            r#"
            UPDATE outbox_tx_refs SET confirmed_at = ?, confirmations = ?
            WHERE id = (
                SELECT id FROM outbox_tx_refs
                WHERE job_id = ? AND abandoned = 0
                ORDER BY id DESC LIMIT 1
            )
            "#,
        )
        .bind(now)
        .bind(confirmations as i64)
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn record_progress(&self, job_id: JobId, confirmations: u64) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_tx_refs SET confirmations = ?
            WHERE id = (
                SELECT id FROM outbox_tx_refs
                WHERE job_id = ? AND abandoned = 0
                ORDER BY id DESC LIMIT 1
            )
            "#,
        )
        .bind(confirmations as i64)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn record_failure(
        &self,
        claim: &OutboxJob,
        failure: &JobFailure,
    ) -> Result<OutboxJob, OutboxError> {
        let job = self.get_job(claim.job_id).await?;
        check_claim(&job, claim, JobState::Queued)?;
        let Some(claimed_at) = job.claimed_at else {
            return Err(OutboxError::ClaimLost(job.job_id));
        };

        let now = self.clock.now();
        let outcome = self.policy.on_failure(failure.class, job.attempt_count, now);

        // Guarded on the claim and the attempt count read above
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_jobs
            SET state = ?, attempt_count = ?, next_attempt_at = ?, last_error = ?,
                claimed_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'submitting' AND claimed_at = ? AND attempt_count = ?
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(outcome.state.as_str())
        .bind(outcome.attempt_count as i64)
        .bind(ms(outcome.next_attempt_at))
        .bind(failure.describe())
        .bind(ms(now))
        .bind(job.job_id.to_string())
        .bind(ms(claimed_at))
        .bind(job.attempt_count as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.claim_rejected(claim, outcome.state).await),
        }
    }

    async fn record_dropped(&self, job_id: JobId, reason: &str) -> Result<OutboxJob, OutboxError> {
        let job = self.get_job(job_id).await?;
        if job.state != JobState::Submitted {
            return Err(OutboxError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Queued,
            });
        }

        let now = self.clock.now();
        let outcome = self
            .policy
            .requeue_or_fail(FailureClass::Transient, job.attempt_count, now);
        let mut tx = self.pool.begin().await.map_err(db)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_jobs
            SET state = ?, next_attempt_at = ?, last_error = ?, needs_reconcile = 1, updated_at = ?
            WHERE id = ? AND state = 'submitted'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(outcome.state.as_str())
        .bind(ms(outcome.next_attempt_at))
        .bind(format!("dropped: {}", reason))
        .bind(ms(now))
        .bind(job_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.rejected(job_id, outcome.state).await);
        };

        sqlx::query("UPDATE outbox_tx_refs SET abandoned = 1 WHERE job_id = ? AND abandoned = 0")
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        tx.commit().await.map_err(db)?;
        job_from_row(&row)
    }

    async fn recover_stale(&self, timeout: Duration) -> Result<Vec<OutboxJob>, OutboxError> {
        let now = self.clock.now();
        let cutoff = now - timeout;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_jobs
            SET state = 'queued', next_attempt_at = ?, needs_reconcile = 1, claimed_at = NULL,
                last_error = 'recovered: submission interrupted', updated_at = ?
            WHERE state = 'submitting' AND (claimed_at IS NULL OR claimed_at <= ?)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(ms(now))
        .bind(ms(now))
        .bind(ms(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn get_job(&self, job_id: JobId) -> Result<OutboxJob, OutboxError> {
        let row = sqlx::query(&format!("SELECT {} FROM outbox_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or(OutboxError::NotFound(job_id))?;
        job_from_row(&row)
    }

    async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<OutboxJob>, OutboxError> {
        self.fetch_jobs("batch_id", batch_id.to_string()).await
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<OutboxJob>, OutboxError> {
        self.fetch_jobs("state", state.as_str().to_string()).await
    }

    async fn submitted_jobs(&self) -> Result<Vec<(OutboxJob, TxRef)>, OutboxError> {
        let jobs = self.jobs_in_state(JobState::Submitted).await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let row = sqlx::query(&format!(
                "SELECT {} FROM outbox_tx_refs WHERE job_id = ? AND abandoned = 0 ORDER BY id DESC LIMIT 1",
                TX_COLUMNS
            ))
            .bind(job.job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
            if let Some(row) = row {
                out.push((job, tx_from_row(&row)?));
            }
        }
        Ok(out)
    }

    async fn tx_refs(&self, job_id: JobId) -> Result<Vec<TxRef>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_tx_refs WHERE job_id = ? ORDER BY id",
            TX_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<AnchorBatch>, OutboxError> {
        let Some(row) = sqlx::query("SELECT merkle_root, created_at FROM outbox_batches WHERE id = ?")
            .bind(batch_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
        else {
            return Ok(None);
        };
        let root: String = row.try_get("merkle_root").map_err(db)?;
        let created_at: i64 = row.try_get("created_at").map_err(db)?;

        let rows = sqlx::query(
            "SELECT evidence_id, digest FROM outbox_batch_members WHERE batch_id = ? ORDER BY leaf_index",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let evidence_id: String = row.try_get("evidence_id").map_err(db)?;
            let digest: String = row.try_get("digest").map_err(db)?;
            members.push(BatchMember {
                evidence_id: parse_uuid(&evidence_id)?,
                digest: Hash::from_hex(&digest).map_err(|e| OutboxError::Backend(e.to_string()))?,
            });
        }

        Ok(Some(AnchorBatch {
            batch_id,
            members,
            merkle_root: Hash::from_hex(&root).map_err(|e| OutboxError::Backend(e.to_string()))?,
            created_at: from_ms(created_at)?,
        }))
    }

    async fn batch_for_evidence(
        &self,
        evidence_id: EvidenceId,
    ) -> Result<Option<AnchorBatch>, OutboxError> {
        let row = sqlx::query(
            "SELECT batch_id FROM outbox_batch_members WHERE evidence_id = ? LIMIT 1",
        )
        .bind(evidence_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => {
                let batch_id: String = row.try_get("batch_id").map_err(db)?;
                self.get_batch(parse_uuid(&batch_id)?).await
            }
            None => Ok(None),
        }
    }

    async fn proof_for_evidence(
        &self,
        evidence_id: EvidenceId,
    ) -> Result<Option<MerkleProof>, OutboxError> {
        let row = sqlx::query("SELECT proof FROM outbox_batch_members WHERE evidence_id = ? LIMIT 1")
            .bind(evidence_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;

        match row {
            Some(row) => {
                let proof: String = row.try_get("proof").map_err(db)?;
                Ok(Some(serde_json::from_str(&proof)?))
            }
            None => Ok(None),
        }
    }

    async fn next_ready_at(&self, chains: &[Chain]) -> Result<Option<DateTime<Utc>>, OutboxError> {
        if chains.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT MIN(next_attempt_at) AS next FROM outbox_jobs WHERE state = 'queued' AND chain IN ({})",
            placeholders(chains.len())
        );
        let mut query = sqlx::query(&sql);
        for chain in chains {
            query = query.bind(chain.as_str());
        }
        let row = query.fetch_one(&self.pool).await.map_err(db)?;
        let next: Option<i64> = row.try_get("next").map_err(db)?;
        next.map(from_ms).transpose()
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM outbox_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(db)?;
            let n: i64 = row.try_get("n").map_err(db)?;
            stats.add(state.parse::<JobState>().map_err(OutboxError::Backend)?, n as u64);
        }

        let batches: i64 = sqlx::query("SELECT COUNT(*) AS n FROM outbox_batches")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?
            .try_get("n")
            .map_err(db)?;
        stats.batches = batches as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{connect, SqliteConfig};
    use custody_queue::ManualClock;

    async fn store() -> (SqliteOutbox, Arc<ManualClock>) {
        let pool = connect(&SqliteConfig::memory()).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let store =
            SqliteOutbox::with_policy(pool, BackoffPolicy::default().without_jitter(), clock.clone());
        (store, clock)
    }

    fn batch(n: usize) -> AnchorBatch {
        let members = (0..n)
            .map(|i| BatchMember {
                evidence_id: Uuid::new_v4(),
                digest: Hash::digest(format!("sensor-{i}").as_bytes()),
            })
            .collect();
        AnchorBatch::new(members, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let (store, _) = store().await;
        let b = batch(3);
        let jobs = store.enqueue(&b, &[Chain::Evm, Chain::Solana]).await.unwrap();
        assert_eq!(jobs.len(), 2);

        let claimed = store.claim_next(&[Chain::Solana]).await.unwrap().unwrap();
        assert_eq!(claimed.chain, Chain::Solana);
        assert_eq!(claimed.state, JobState::Submitting);
        assert_eq!(claimed.merkle_root, b.merkle_root);
        assert!(store.claim_next(&[Chain::Solana]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_roundtrip_and_proofs() {
        let (store, _) = store().await;
        let b = batch(5);
        store.enqueue(&b, &[Chain::Evm]).await.unwrap();

        let loaded = store.get_batch(b.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.members, b.members);
        assert_eq!(loaded.merkle_root, b.merkle_root);
        assert!(loaded.verify_root());

        let member = &b.members[4];
        let proof = store
            .proof_for_evidence(member.evidence_id)
            .await
            .unwrap()
            .unwrap();
        assert!(proof.verify(&b.merkle_root));

        let by_evidence = store
            .batch_for_evidence(member.evidence_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_evidence.batch_id, b.batch_id);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry() {
        let (store, clock) = store().await;
        store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();

        let failed = store
            .record_failure(&job, &JobFailure::transient("429 Too Many Requests"))
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Queued);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(
            ms(failed.next_attempt_at) - ms(clock.now()),
            2_000
        );

        assert!(store.claim_next(&[Chain::Evm]).await.unwrap().is_none());
        assert_eq!(
            store.next_ready_at(&[Chain::Evm]).await.unwrap(),
            Some(failed.next_attempt_at)
        );
        clock.advance(Duration::seconds(2));
        assert!(store.claim_next(&[Chain::Evm]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_confirmation_is_terminal() {
        let (store, _) = store().await;
        store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        store.record_submission(&job, "0xbeef").await.unwrap();

        let submitted = store.submitted_jobs().await.unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1.tx_reference, "0xbeef");

        store.record_confirmation(job.job_id, 12).await.unwrap();
        store.record_confirmation(job.job_id, 13).await.unwrap();

        let job = store.get_job(job.job_id).await.unwrap();
        assert_eq!(job.state, JobState::Confirmed);
        assert_eq!(job.attempt_count, 1);
        assert!(matches!(
            store.record_dropped(job.job_id, "reorg").await,
            Err(OutboxError::InvalidTransition { .. })
        ));
        let refs = store.tx_refs(job.job_id).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].confirmations, 12);
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let (store, _) = store().await;
        store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();
        let job = store.jobs_in_state(JobState::Queued).await.unwrap().remove(0);

        assert!(matches!(
            store.record_submission(&job, "0x1").await,
            Err(OutboxError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.record_confirmation(job.job_id, 1).await,
            Err(OutboxError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.get_job(Uuid::new_v4()).await,
            Err(OutboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_requeues_and_abandons() {
        let (store, _) = store().await;
        store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        store.record_submission(&job, "0x1").await.unwrap();

        let dropped = store.record_dropped(job.job_id, "receipt missing").await.unwrap();
        assert_eq!(dropped.state, JobState::Queued);
        assert!(dropped.needs_reconcile);
        assert_eq!(dropped.last_error.as_deref(), Some("dropped: receipt missing"));
        assert!(store.tx_refs(job.job_id).await.unwrap()[0].abandoned);
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _) = store().await;
        store.enqueue(&batch(2), &[Chain::Evm, Chain::Solana]).await.unwrap();
        store.enqueue(&batch(2), &[Chain::Evm]).await.unwrap();
        store.claim_next(&[Chain::Evm]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.submitting, 1);
        assert_eq!(stats.batches, 2);
    }
}
