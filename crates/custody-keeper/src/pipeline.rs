//! Batch intake: evidence records in, persisted anchor batches out

use custody_core::{AnchorBatch, BatchConfig, Chain, EvidenceRecord, MerkleBatcher};
use custody_queue::{Clock, OutboxError, OutboxStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Sending half handed to whatever produces evidence
pub type EvidenceSender = mpsc::Sender<EvidenceRecord>;

/// Bounded intake channel
pub fn channel(capacity: usize) -> (EvidenceSender, mpsc::Receiver<EvidenceRecord>) {
    mpsc::channel(capacity.max(1))
}

/// Feeds a [`MerkleBatcher`] and enqueues every batch it cuts for all
/// configured chains.
///
/// A batch the store refuses is kept and retried on the next tick, so a
/// transient store outage does not lose evidence.
pub struct BatchPipeline {
    store: Arc<dyn OutboxStore>,
    chains: Vec<Chain>,
    batcher: MerkleBatcher,
    clock: Arc<dyn Clock>,
    tick: Duration,
    unsaved: VecDeque<AnchorBatch>,
}

impl BatchPipeline {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        chains: Vec<Chain>,
        config: BatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            chains,
            batcher: MerkleBatcher::new(config),
            clock,
            tick: Duration::from_secs(1),
            unsaved: VecDeque::new(),
        }
    }

    /// How often the age trigger is checked
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn pending_len(&self) -> usize {
        self.batcher.pending_len()
    }

    /// Batches cut but not yet persisted
    pub fn unsaved_len(&self) -> usize {
        self.unsaved.len()
    }

    /// Add one record; persists a batch if it hit the size threshold
    pub async fn accept(&mut self, record: EvidenceRecord) -> Option<AnchorBatch> {
        let batch = self.batcher.push(record, self.clock.now())?;
        self.persist(batch).await
    }

    /// Retry unsaved batches, then apply the age trigger
    pub async fn tick(&mut self) -> Option<AnchorBatch> {
        self.retry_unsaved().await;
        let batch = self.batcher.poll(self.clock.now())?;
        self.persist(batch).await
    }

    /// Cut whatever is pending, regardless of age or minimum size
    pub async fn flush(&mut self) -> Option<AnchorBatch> {
        let batch = self.batcher.flush(self.clock.now())?;
        self.persist(batch).await
    }

    /// Consume records until the channel closes or `shutdown` flips, then
    /// flush. Fails if batches could not be persisted by then.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<EvidenceRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), OutboxError> {
        let mut ticker = tokio::time::interval(self.tick);
        info!(chains = ?self.chains, "Batch pipeline started");

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => {
                        self.accept(record).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Records already queued in the channel still belong to this run
        rx.close();
        while let Some(record) = rx.recv().await {
            self.accept(record).await;
        }
        self.flush().await;
        self.retry_unsaved().await;

        if !self.unsaved.is_empty() {
            return Err(OutboxError::Backend(format!(
                "{} batch(es) could not be persisted before shutdown",
                self.unsaved.len()
            )));
        }
        info!("Batch pipeline stopped");
        Ok(())
    }

    async fn persist(&mut self, batch: AnchorBatch) -> Option<AnchorBatch> {
        match self.store.enqueue(&batch, &self.chains).await {
            Ok(jobs) => {
                info!(
                    batch_id = %batch.batch_id,
                    merkle_root = %batch.merkle_root,
                    size = batch.len(),
                    jobs = jobs.len(),
                    "Batch enqueued"
                );
                Some(batch)
            }
            Err(e) => {
                warn!(batch_id = %batch.batch_id, error = %e, "Could not enqueue batch; will retry");
                self.unsaved.push_back(batch);
                None
            }
        }
    }

    async fn retry_unsaved(&mut self) {
        for _ in 0..self.unsaved.len() {
            let Some(batch) = self.unsaved.pop_front() else {
                break;
            };
            match self.store.enqueue(&batch, &self.chains).await {
                Ok(_) => info!(batch_id = %batch.batch_id, "Deferred batch enqueued"),
                Err(e) => {
                    error!(batch_id = %batch.batch_id, error = %e, "Deferred batch still not enqueued");
                    self.unsaved.push_back(batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{EvidenceContent, EvidenceRecorder, SourceType};
    use custody_queue::{BackoffPolicy, JobState, ManualClock, MemoryOutbox};
    use serde_json::json;

    fn record(i: usize) -> EvidenceRecord {
        EvidenceRecorder::new()
            .record(
                &EvidenceContent::Bytes(format!("capture-{i}").into_bytes()),
                SourceType::SensorCapture,
                json!({"seq": i}),
            )
            .unwrap()
    }

    fn pipeline(max: usize) -> (BatchPipeline, Arc<MemoryOutbox>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryOutbox::new(BackoffPolicy::default(), clock.clone()));
        let config = BatchConfig {
            max_batch_size: max,
            ..BatchConfig::default()
        };
        let p = BatchPipeline::new(
            store.clone(),
            vec![Chain::Evm, Chain::Solana],
            config,
            clock.clone(),
        );
        (p, store, clock)
    }

    #[tokio::test]
    async fn test_size_trigger_enqueues_for_every_chain() {
        let (mut p, store, _) = pipeline(3);
        assert!(p.accept(record(0)).await.is_none());
        assert!(p.accept(record(1)).await.is_none());
        let batch = p.accept(record(2)).await.unwrap();

        let jobs = store.jobs_for_batch(batch.batch_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.state == JobState::Queued));
        assert_eq!(p.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_age_trigger_on_tick() {
        let (mut p, _, clock) = pipeline(100);
        p.accept(record(0)).await;
        assert!(p.tick().await.is_none());

        clock.advance(chrono::Duration::seconds(61));
        let batch = p.tick().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (mut p, store, _) = pipeline(10);
        assert!(p.flush().await.is_none());
        assert_eq!(store.stats().await.unwrap().batches, 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let (p, store, _) = pipeline(100);
        let (tx, rx) = channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(p.run(rx, stop_rx));
        for i in 0..5 {
            tx.send(record(i)).await.unwrap();
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.queued, 2);
    }
}
