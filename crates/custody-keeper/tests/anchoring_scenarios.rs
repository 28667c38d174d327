//! End-to-end keeper scenarios against scripted providers

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use custody_anchor::{
    ChainAnchorProvider, ConfirmationStatus, MockChainProvider, ProviderError, ProviderRegistry,
    RateLimitGate, SubmitReceipt,
};
use custody_core::{
    BatchConfig, Chain, EvidenceContent, EvidenceRecord, EvidenceRecorder, Hash, SourceType,
};
use custody_keeper::{AnchorOrchestrator, BatchPipeline, OrchestratorConfig, SubmitOutcome};
use custody_queue::{
    BackoffPolicy, BatchStatus, Clock, JobState, ManualClock, MemoryOutbox, OutboxStore,
    QuorumPolicy, TxRef,
};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryOutbox>,
    orchestrator: AnchorOrchestrator,
}

fn clock_and_store() -> (Arc<ManualClock>, Arc<MemoryOutbox>) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryOutbox::new(
        BackoffPolicy::default().without_jitter(),
        clock.clone(),
    ));
    (clock, store)
}

fn harness(providers: Vec<Arc<MockChainProvider>>) -> Harness {
    let (clock, store) = clock_and_store();
    let providers = providers
        .into_iter()
        .map(|p| p as Arc<dyn ChainAnchorProvider>)
        .collect();
    assemble(clock, store, providers)
}

fn assemble(
    clock: Arc<ManualClock>,
    store: Arc<MemoryOutbox>,
    providers: Vec<Arc<dyn ChainAnchorProvider>>,
) -> Harness {
    let gate = RateLimitGate::new(RateLimitGate::default_policy().without_jitter(), clock.clone());
    let mut registry = ProviderRegistry::new(gate);
    for p in providers {
        registry.register(p);
    }
    let orchestrator = AnchorOrchestrator::new(
        store.clone(),
        Arc::new(registry),
        clock.clone(),
        OrchestratorConfig::default(),
    );
    Harness {
        clock,
        store,
        orchestrator,
    }
}

fn evidence(i: usize) -> EvidenceRecord {
    EvidenceRecorder::new()
        .record(
            &EvidenceContent::Json(json!({"session": i, "detections": [i, i + 1]})),
            SourceType::DetectionSession,
            json!({}),
        )
        .unwrap()
}

fn rate_limited() -> ProviderError {
    ProviderError::RateLimited {
        message: "429 Too Many Requests".into(),
        retry_after: None,
    }
}

fn seconds_until(clock: &ManualClock, outcome: &SubmitOutcome) -> i64 {
    match outcome {
        SubmitOutcome::Retrying {
            next_attempt_at, ..
        } => (*next_attempt_at - clock.now()).num_seconds(),
        other => panic!("expected a retry, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limited_twice_then_confirmed() {
    let evm = Arc::new(
        MockChainProvider::new(Chain::Evm)
            .fail_next_submit(rate_limited())
            .fail_next_submit(rate_limited()),
    );
    let h = harness(vec![evm.clone()]);

    let mut pipeline = BatchPipeline::new(
        h.store.clone(),
        vec![Chain::Evm],
        BatchConfig {
            max_batch_size: 3,
            ..BatchConfig::default()
        },
        h.clock.clone(),
    );
    assert!(pipeline.accept(evidence(0)).await.is_none());
    assert!(pipeline.accept(evidence(1)).await.is_none());
    let batch = pipeline.accept(evidence(2)).await.unwrap();
    assert_eq!(batch.len(), 3);

    let first = h.orchestrator.submit_once().await.unwrap().unwrap();
    assert_eq!(seconds_until(&h.clock, &first), 2);
    assert!(h.orchestrator.submit_once().await.unwrap().is_none());

    h.clock.advance(ChronoDuration::seconds(2));
    let second = h.orchestrator.submit_once().await.unwrap().unwrap();
    assert_eq!(seconds_until(&h.clock, &second), 4);

    h.clock.advance(ChronoDuration::seconds(4));
    let third = h.orchestrator.submit_once().await.unwrap().unwrap();
    assert!(matches!(third, SubmitOutcome::Submitted { .. }));

    assert_eq!(h.orchestrator.confirm_once().await.unwrap().confirmed, 1);

    let job = h.store.get_job(third.job_id()).await.unwrap();
    assert_eq!(job.state, JobState::Confirmed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(evm.submit_calls(), 3);
    assert!(h
        .store
        .batch_status(batch.batch_id, QuorumPolicy::All)
        .await
        .unwrap()
        .is_fully_anchored());
}

#[tokio::test]
async fn test_one_chain_confirms_other_times_out() {
    let evm = Arc::new(MockChainProvider::new(Chain::Evm));
    let solana = Arc::new(
        MockChainProvider::new(Chain::Solana)
            .with_default_confirm(ConfirmationStatus::Pending { confirmations: 0 }),
    );
    let h = harness(vec![evm, solana]);

    let batch = custody_core::AnchorBatch::from_records(
        &[evidence(0), evidence(1)],
        h.clock.now(),
    )
    .unwrap();
    h.store
        .enqueue(&batch, &[Chain::Evm, Chain::Solana])
        .await
        .unwrap();

    assert!(h.orchestrator.submit_once().await.unwrap().is_some());
    assert!(h.orchestrator.submit_once().await.unwrap().is_some());

    let summary = h.orchestrator.confirm_once().await.unwrap();
    assert_eq!((summary.confirmed, summary.pending), (1, 1));

    h.clock.advance(ChronoDuration::seconds(901));
    let summary = h.orchestrator.confirm_once().await.unwrap();
    assert_eq!(summary.dropped, 1);

    let partial = BatchStatus::PartiallyAnchored {
        confirmed: vec![Chain::Evm],
        pending: vec![Chain::Solana],
    };
    assert_eq!(
        h.store
            .batch_status(batch.batch_id, QuorumPolicy::All)
            .await
            .unwrap(),
        partial
    );
    assert!(h
        .store
        .batch_status(batch.batch_id, QuorumPolicy::AtLeast(1))
        .await
        .unwrap()
        .is_fully_anchored());

    let solana_job = h
        .store
        .jobs_for_batch(batch.batch_id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.chain == Chain::Solana)
        .unwrap();
    assert_eq!(solana_job.state, JobState::Queued);
    assert!(solana_job.last_error.unwrap().contains("confirmation timeout"));
}

#[tokio::test]
async fn test_bad_checksum_fails_without_submission() {
    let evm = Arc::new(
        MockChainProvider::new(Chain::Evm).with_address("0x5AAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
    );
    let h = harness(vec![evm.clone()]);

    let batch = custody_core::AnchorBatch::from_records(&[evidence(7)], h.clock.now()).unwrap();
    h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    let outcome = h.orchestrator.submit_once().await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Failed { .. }));

    let job = h.store.get_job(outcome.job_id()).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 0);
    assert!(job.last_error.unwrap().starts_with("validation:"));
    assert_eq!(evm.submit_calls(), 0);
    assert_eq!(
        h.store.jobs_in_state(JobState::Failed).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_confirmed_job_is_never_resubmitted() {
    let evm = Arc::new(MockChainProvider::new(Chain::Evm));
    let h = harness(vec![evm.clone()]);
    let batch = custody_core::AnchorBatch::from_records(&[evidence(1)], h.clock.now()).unwrap();
    h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    h.orchestrator.submit_once().await.unwrap().unwrap();
    h.orchestrator.confirm_once().await.unwrap();

    for _ in 0..5 {
        h.clock.advance(ChronoDuration::minutes(30));
        h.orchestrator.recover().await.unwrap();
        assert!(h.orchestrator.submit_once().await.unwrap().is_none());
        h.orchestrator.confirm_once().await.unwrap();
    }
    assert_eq!(evm.submit_calls(), 1);
    assert_eq!(evm.confirm_calls(), 1);
}

#[tokio::test]
async fn test_recovered_job_adopts_existing_anchor() {
    let evm = Arc::new(MockChainProvider::new(Chain::Evm).with_existing("0xfeed"));
    let h = harness(vec![evm.clone()]);
    let batch = custody_core::AnchorBatch::from_records(&[evidence(3)], h.clock.now()).unwrap();
    h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    // A keeper that claimed the job and died mid-submission
    let claimed = h.store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();

    h.clock.advance(ChronoDuration::minutes(10));
    let recovered = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);

    let outcome = h.orchestrator.submit_once().await.unwrap().unwrap();
    match outcome {
        SubmitOutcome::Reconciled { job_id, tx } => {
            assert_eq!(job_id, claimed.job_id);
            assert_eq!(tx.tx_reference, "0xfeed");
        }
        other => panic!("expected reconciliation, got {other:?}"),
    }
    assert_eq!(evm.submit_calls(), 0);
    assert_eq!(h.store.get_job(claimed.job_id).await.unwrap().attempt_count, 0);
}

#[tokio::test]
async fn test_insufficient_funds_fails_after_permanent_limit() {
    let evm = Arc::new(
        MockChainProvider::new(Chain::Evm)
            .fail_next_submit(ProviderError::InsufficientFunds("0 wei".into()))
            .fail_next_submit(ProviderError::InsufficientFunds("0 wei".into())),
    );
    let h = harness(vec![evm.clone()]);
    let batch = custody_core::AnchorBatch::from_records(&[evidence(4)], h.clock.now()).unwrap();
    h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    let first = h.orchestrator.submit_once().await.unwrap().unwrap();
    assert_eq!(seconds_until(&h.clock, &first), 2);

    h.clock.advance(ChronoDuration::seconds(2));
    let second = h.orchestrator.submit_once().await.unwrap().unwrap();
    match second {
        SubmitOutcome::Failed { error, .. } => assert!(error.starts_with("permanent:")),
        other => panic!("expected terminal failure, got {other:?}"),
    }
    assert_eq!(evm.submit_calls(), 2);
}

#[tokio::test]
async fn test_bad_destination_fails_without_submission() {
    let evm = Arc::new(MockChainProvider::new(Chain::Evm).with_destination("0xnot-an-address"));
    let h = harness(vec![evm.clone()]);
    let batch = custody_core::AnchorBatch::from_records(&[evidence(8)], h.clock.now()).unwrap();
    h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    let outcome = h.orchestrator.submit_once().await.unwrap().unwrap();
    let job = h.store.get_job(outcome.job_id()).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 0);
    let error = job.last_error.unwrap();
    assert!(error.starts_with("validation:"));
    assert!(error.contains("destination"));
    assert_eq!(evm.submit_calls(), 0);
}

/// Stalls in `submit` long enough for another keeper to recover and
/// reclaim the job
struct StalledSubmitter {
    clock: Arc<ManualClock>,
    store: Arc<MemoryOutbox>,
}

#[async_trait]
impl ChainAnchorProvider for StalledSubmitter {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    fn address(&self) -> &str {
        "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"
    }

    async fn submit(&self, _root: &Hash, _memo: &str) -> Result<SubmitReceipt, ProviderError> {
        self.clock.advance(ChronoDuration::minutes(10));
        self.store.recover_stale(ChronoDuration::minutes(5)).await.unwrap();
        self.store.claim_next(&[Chain::Evm]).await.unwrap().unwrap();
        Ok(SubmitReceipt {
            tx_reference: "0xlate".into(),
            submitted_at: Utc::now(),
        })
    }

    async fn confirm(&self, _tx: &TxRef) -> Result<ConfirmationStatus, ProviderError> {
        Ok(ConfirmationStatus::Pending { confirmations: 0 })
    }

    fn name(&self) -> &str {
        "stalled"
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_superseded_claim_does_not_record_submission() {
    let (clock, store) = clock_and_store();
    let stalled = Arc::new(StalledSubmitter {
        clock: clock.clone(),
        store: store.clone(),
    });
    let h = assemble(clock, store, vec![stalled as Arc<dyn ChainAnchorProvider>]);
    let batch = custody_core::AnchorBatch::from_records(&[evidence(9)], h.clock.now()).unwrap();
    let jobs = h.store.enqueue(&batch, &[Chain::Evm]).await.unwrap();

    assert!(h.orchestrator.submit_once().await.unwrap().is_none());

    // The newer claim still owns the job
    let job = h.store.get_job(jobs[0].job_id).await.unwrap();
    assert_eq!(job.state, JobState::Submitting);
    assert_eq!(job.claimed_at, Some(h.clock.now()));
    assert_eq!(job.attempt_count, 0);
    assert!(h.store.tx_refs(job.job_id).await.unwrap().is_empty());
}

/// Reports finality while a peer keeper has already dropped the same job
struct RacingConfirmer {
    store: Arc<MemoryOutbox>,
}

#[async_trait]
impl ChainAnchorProvider for RacingConfirmer {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    fn address(&self) -> &str {
        "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"
    }

    async fn submit(&self, _root: &Hash, _memo: &str) -> Result<SubmitReceipt, ProviderError> {
        Ok(SubmitReceipt {
            tx_reference: "0xrace".into(),
            submitted_at: Utc::now(),
        })
    }

    async fn confirm(&self, tx: &TxRef) -> Result<ConfirmationStatus, ProviderError> {
        self.store.record_dropped(tx.job_id, "replaced by peer").await.unwrap();
        Ok(ConfirmationStatus::Finalized { confirmations: 32 })
    }

    fn name(&self) -> &str {
        "racing"
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_confirm_pass_survives_a_failed_write() {
    let (clock, store) = clock_and_store();
    let racing = Arc::new(RacingConfirmer {
        store: store.clone(),
    });
    let solana = Arc::new(MockChainProvider::new(Chain::Solana));
    let h = assemble(
        clock,
        store,
        vec![
            racing as Arc<dyn ChainAnchorProvider>,
            solana as Arc<dyn ChainAnchorProvider>,
        ],
    );

    let batch =
        custody_core::AnchorBatch::from_records(&[evidence(10), evidence(11)], h.clock.now())
            .unwrap();
    h.store
        .enqueue(&batch, &[Chain::Evm, Chain::Solana])
        .await
        .unwrap();
    assert!(h.orchestrator.submit_once().await.unwrap().is_some());
    assert!(h.orchestrator.submit_once().await.unwrap().is_some());

    let summary = h.orchestrator.confirm_once().await.unwrap();
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.errors, 1);

    let jobs = h.store.jobs_for_batch(batch.batch_id).await.unwrap();
    let state = |chain: Chain| jobs.iter().find(|j| j.chain == chain).unwrap().state;
    assert_eq!(state(Chain::Solana), JobState::Confirmed);
    assert_eq!(state(Chain::Evm), JobState::Queued);
}
