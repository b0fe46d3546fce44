//! Single-consumer drain loop: queue → sample store.
//!
//! Items are persisted one at a time in queue order. Item k's append has
//! completed (or failed and been logged) before item k+1 is taken, so the
//! store never sees more than one concurrent write from the pipeline.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{QueueItem, WorkQueueReceiver};
use super::stats::PipelineStats;
use crate::storage::SampleStore;

pub struct DrainWorker {
    queue: WorkQueueReceiver<QueueItem>,
    store: Arc<dyn SampleStore>,
    stats: Arc<PipelineStats>,
}

impl DrainWorker {
    pub fn new(
        queue: WorkQueueReceiver<QueueItem>,
        store: Arc<dyn SampleStore>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue,
            store,
            stats,
        }
    }

    /// Run until cancelled or every producer is gone.
    ///
    /// Cancellation is only observed between items; an append in flight
    /// always runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(backend = self.store.backend_name(), "Drain worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(pending = self.queue.len(), "Drain worker shutdown signal received");
                    break;
                }
                item = self.queue.recv() => match item {
                    Some(item) => item,
                    None => {
                        info!("Work queue closed, drain worker exiting");
                        break;
                    }
                },
            };

            self.stats.set_queue_len(self.queue.len());
            self.persist(item).await;
            // A backlog of instantly-ready items must not starve the
            // listener and hub sharing this runtime.
            tokio::task::yield_now().await;
        }
    }

    async fn persist(&self, item: QueueItem) {
        let device_id = &item.message.device_id;
        match self.store.append(&item.message, item.received_at).await {
            Ok(()) => {
                self.stats.record_persisted();
                debug!(device_id = %device_id, "Sample persisted");
            }
            Err(e) => {
                self.stats.record_persist_failure();
                warn!(device_id = %device_id, error = %e, "Failed to persist sample, discarding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::pipeline::queue::work_queue;
    use crate::storage::{InMemoryStore, StorageError};
    use crate::types::TelemetryMessage;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn item(device: &str, lat: f64) -> QueueItem {
        QueueItem {
            message: serde_json::from_value(serde_json::json!({
                "deviceId": device,
                "location": {"latitude": lat, "longitude": 0.0}
            }))
            .unwrap(),
            received_at: Utc::now(),
        }
    }

    /// Fails every append for one device.
    struct FlakyStore {
        inner: InMemoryStore,
        poison: &'static str,
    }

    #[async_trait]
    impl SampleStore for FlakyStore {
        async fn append(
            &self,
            message: &TelemetryMessage,
            received_at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            if message.device_id == self.poison {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.append(message, received_at).await
        }

        fn backend_name(&self) -> &'static str {
            "Flaky"
        }
    }

    #[tokio::test]
    async fn test_persists_in_enqueue_order() {
        let (tx, rx) = work_queue(64, OverflowPolicy::DropOldest);
        let store = Arc::new(InMemoryStore::new());
        let stats = Arc::new(PipelineStats::new(15));

        for i in 0..20 {
            tx.push(item(if i % 2 == 0 { "a" } else { "b" }, i as f64)).await;
        }
        drop(tx);

        DrainWorker::new(rx, store.clone(), stats.clone())
            .run(CancellationToken::new())
            .await;

        let lats: Vec<f64> = store.locations().iter().map(|l| l.latitude).collect();
        assert_eq!(lats, (0..20).map(|i| i as f64).collect::<Vec<_>>());
        assert_eq!(stats.snapshot().persisted, 20);
        assert_eq!(stats.snapshot().queue_len, 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_halt_loop() {
        let (tx, rx) = work_queue(8, OverflowPolicy::DropOldest);
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            poison: "bad",
        });
        let stats = Arc::new(PipelineStats::new(15));

        tx.push(item("ok", 1.0)).await;
        tx.push(item("bad", 2.0)).await;
        tx.push(item("ok", 3.0)).await;
        drop(tx);

        DrainWorker::new(rx, store.clone(), stats.clone())
            .run(CancellationToken::new())
            .await;

        assert_eq!(store.inner.locations().len(), 2);
        let snap = stats.snapshot();
        assert_eq!(snap.persisted, 2);
        assert_eq!(snap.persist_failures, 1);
    }

    #[tokio::test]
    async fn test_backlog_drain_lets_other_tasks_run() {
        let (tx, rx) = work_queue(512, OverflowPolicy::DropOldest);
        let store = Arc::new(InMemoryStore::new());
        let stats = Arc::new(PipelineStats::new(15));
        for i in 0..500 {
            tx.push(item("a", i as f64)).await;
        }
        drop(tx);

        // Single-threaded runtime: the observer only runs if the drain yields.
        let worker = tokio::spawn(
            DrainWorker::new(rx, store.clone(), stats.clone()).run(CancellationToken::new()),
        );
        let observer_stats = stats.clone();
        let seen = tokio::spawn(async move { observer_stats.snapshot().persisted })
            .await
            .unwrap();
        assert!(seen < 500, "observer ran only after {seen} appends");

        worker.await.unwrap();
        assert_eq!(stats.snapshot().persisted, 500);
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let (_tx, rx) = work_queue::<QueueItem>(8, OverflowPolicy::DropOldest);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(
            DrainWorker::new(rx, Arc::new(InMemoryStore::new()), Arc::new(PipelineStats::new(15)))
                .run(cancel.clone()),
        );
        cancel.cancel();
        worker.await.unwrap();
    }
}
