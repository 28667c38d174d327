//! File-backed outbox tests: concurrent claims and restart recovery

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use custody_core::{AnchorBatch, BatchMember, Chain, Hash};
use custody_persist::{connect, SqliteConfig, SqliteOutbox};
use custody_queue::{BackoffPolicy, JobFailure, JobState, ManualClock, OutboxError, OutboxStore};
use uuid::Uuid;

fn batch(n: usize) -> AnchorBatch {
    let members = (0..n)
        .map(|i| BatchMember {
            evidence_id: Uuid::new_v4(),
            digest: Hash::digest(format!("export-{i}").as_bytes()),
        })
        .collect();
    AnchorBatch::new(members, Utc::now()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteConfig::file(&dir.path().join("outbox.db"));
    let pool = connect(&config).await.unwrap();
    let store = Arc::new(SqliteOutbox::new(pool));

    for _ in 0..8 {
        store
            .enqueue(&batch(3), &[Chain::Evm, Chain::Solana])
            .await
            .unwrap();
    }

    let claims = (0..40).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next(&Chain::ALL).await.unwrap() })
    });
    let results = futures::future::join_all(claims).await;

    let claimed: Vec<_> = results
        .into_iter()
        .filter_map(|r| r.unwrap())
        .map(|j| j.job_id)
        .collect();
    let unique: HashSet<_> = claimed.iter().collect();

    assert_eq!(claimed.len(), 16);
    assert_eq!(unique.len(), 16);
    assert_eq!(store.stats().await.unwrap().submitting, 16);
}

#[tokio::test]
async fn test_restart_recovers_interrupted_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteConfig::file(&dir.path().join("outbox.db"));
    let clock = Arc::new(ManualClock::default());
    let policy = BackoffPolicy::default().without_jitter();

    let b = batch(2);
    let claimed = {
        let pool = connect(&config).await.unwrap();
        let store = SqliteOutbox::with_policy(pool.clone(), policy, clock.clone());
        store.enqueue(&b, &[Chain::Evm]).await.unwrap();
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        pool.close().await;
        job
    };

    clock.advance(Duration::minutes(10));
    let pool = connect(&config).await.unwrap();
    let store = SqliteOutbox::with_policy(pool, policy, clock.clone());

    let recovered = store.recover_stale(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].job_id, claimed.job_id);
    assert_eq!(recovered[0].state, JobState::Queued);
    assert!(recovered[0].needs_reconcile);

    // Reconciliation finds the earlier transaction instead of resubmitting
    let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
    store.record_existing(&job, "0xfound").await.unwrap();
    let job = store.get_job(job.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Submitted);
    assert_eq!(job.attempt_count, 0);
    assert!(!job.needs_reconcile);
}

#[tokio::test]
async fn test_recent_claims_are_not_recovered() {
    let pool = connect(&SqliteConfig::memory()).await.unwrap();
    let store = SqliteOutbox::new(pool);
    store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();
    store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();

    assert!(store
        .recover_stale(Duration::minutes(5))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_superseded_claim_cannot_write() {
    let pool = connect(&SqliteConfig::memory()).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let store = SqliteOutbox::with_policy(pool, BackoffPolicy::default(), clock.clone());
    store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();

    // First keeper stalls past the recovery timeout
    let stale = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
    clock.advance(Duration::minutes(10));
    store.recover_stale(Duration::minutes(5)).await.unwrap();
    let fresh = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
    assert_eq!(fresh.job_id, stale.job_id);

    assert!(matches!(
        store.record_submission(&stale, "0xlate").await,
        Err(OutboxError::ClaimLost(id)) if id == stale.job_id
    ));
    assert!(matches!(
        store
            .record_failure(&stale, &JobFailure::transient("timeout"))
            .await,
        Err(OutboxError::ClaimLost(_))
    ));
    assert!(store.tx_refs(stale.job_id).await.unwrap().is_empty());

    store.record_submission(&fresh, "0xlive").await.unwrap();
    let job = store.get_job(fresh.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Submitted);
    assert_eq!(job.attempt_count, 1);
}
