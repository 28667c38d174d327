//! Integration tests for the in-memory outbox

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use custody_core::{AnchorBatch, BatchMember, Chain, Hash};
use custody_queue::{
    BackoffPolicy, BatchStatus, Clock, JobFailure, JobState, ManualClock, MemoryOutbox,
    OutboxStore, QuorumPolicy,
};
use uuid::Uuid;

fn batch(n: usize) -> AnchorBatch {
    let members = (0..n)
        .map(|i| BatchMember {
            evidence_id: Uuid::new_v4(),
            digest: Hash::digest(format!("capture-{i}").as_bytes()),
        })
        .collect();
    AnchorBatch::new(members, Utc::now()).unwrap()
}

fn outbox() -> (Arc<MemoryOutbox>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = MemoryOutbox::new(BackoffPolicy::default().without_jitter(), clock.clone());
    (Arc::new(store), clock)
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let (store, _) = outbox();
    for _ in 0..10 {
        store.enqueue(&batch(2), &[Chain::Evm]).await.unwrap();
    }

    let claims = (0..32).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next(&[Chain::Evm]).await.unwrap() })
    });
    let results = futures::future::join_all(claims).await;

    let claimed: Vec<_> = results
        .into_iter()
        .filter_map(|r| r.unwrap())
        .map(|j| j.job_id)
        .collect();
    let unique: HashSet<_> = claimed.iter().collect();

    assert_eq!(claimed.len(), 10);
    assert_eq!(unique.len(), 10);
}

#[tokio::test]
async fn test_retry_delays_double() {
    let (store, clock) = outbox();
    store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();

    let mut expected = Vec::new();
    for _ in 0..3 {
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        let before = clock.now();
        let failed = store
            .record_failure(&job, &JobFailure::transient("429"))
            .await
            .unwrap();
        expected.push((failed.next_attempt_at - before).num_seconds());
        clock.set(failed.next_attempt_at);
    }

    assert_eq!(expected, vec![2, 4, 8]);
}

#[tokio::test]
async fn test_exhausted_attempts_fail_job() {
    let (store, clock) = outbox();
    store.enqueue(&batch(1), &[Chain::Evm]).await.unwrap();

    let mut last = None;
    for _ in 0..5 {
        clock.advance(Duration::minutes(5));
        let job = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        last = Some(
            store
                .record_failure(&job, &JobFailure::transient("timeout"))
                .await
                .unwrap(),
        );
    }

    let last = last.unwrap();
    assert_eq!(last.state, JobState::Failed);
    assert_eq!(last.attempt_count, 5);
    clock.advance(Duration::hours(1));
    assert!(store.claim_next(&[Chain::Evm]).await.unwrap().is_none());
    assert_eq!(store.jobs_in_state(JobState::Failed).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_validation_failure_records_no_attempt() {
    let (store, _) = outbox();
    store.enqueue(&batch(1), &[Chain::Solana]).await.unwrap();
    let job = store.claim_next(&[Chain::Solana]).await.unwrap().unwrap();

    let failed = store
        .record_failure(&job, &JobFailure::validation("bad payer address"))
        .await
        .unwrap();

    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempt_count, 0);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("validation: bad payer address")
    );
}

#[tokio::test]
async fn test_partial_anchoring_is_reported() {
    let (store, _) = outbox();
    let b = batch(4);
    store
        .enqueue(&b, &[Chain::Evm, Chain::Solana])
        .await
        .unwrap();

    let evm = store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
    store.record_submission(&evm, "0xfeed").await.unwrap();
    store.record_confirmation(evm.job_id, 12).await.unwrap();

    let status = store.batch_status(b.batch_id, QuorumPolicy::All).await.unwrap();
    assert_eq!(
        status,
        BatchStatus::PartiallyAnchored {
            confirmed: vec![Chain::Evm],
            pending: vec![Chain::Solana],
        }
    );

    let one = store
        .batch_status(b.batch_id, QuorumPolicy::AtLeast(1))
        .await
        .unwrap();
    assert!(one.is_fully_anchored());
}

#[tokio::test]
async fn test_stats_track_states() {
    let (store, _) = outbox();
    store
        .enqueue(&batch(1), &[Chain::Evm, Chain::Solana])
        .await
        .unwrap();
    store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.submitting, 1);
    assert_eq!(stats.batches, 1);
}

#[tokio::test]
async fn test_unknown_batch_status_is_an_error() {
    let (store, _) = outbox();
    assert!(store
        .batch_status(Uuid::new_v4(), QuorumPolicy::All)
        .await
        .is_err());
}
