//! Ingest listener - wire message → work queue, backpressure, reconciler
//!
//! The listener is the only writer of the advertised reporting interval:
//! it enqueues, reads the post-push queue length, evaluates backpressure and
//! publishes any resulting config message before taking the next message.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backpressure::BackpressureController;
use super::queue::{QueueItem, WorkQueueSender};
use super::stats::PipelineStats;
use crate::acquisition::{decode, ControlPublisher, Delivery, InboundMessage};
use crate::reconcile::{RawFix, ReconcilerHandle, RouteError};

pub struct IngestListener {
    queue: WorkQueueSender<QueueItem>,
    backpressure: BackpressureController,
    publisher: Arc<dyn ControlPublisher>,
    reconciler: Option<ReconcilerHandle>,
    telemetry_topic: Option<String>,
    stats: Arc<PipelineStats>,
}

impl IngestListener {
    pub fn new(
        queue: WorkQueueSender<QueueItem>,
        backpressure: BackpressureController,
        publisher: Arc<dyn ControlPublisher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        stats.set_advertised_interval(backpressure.advertised_interval());
        Self {
            queue,
            backpressure,
            publisher,
            reconciler: None,
            telemetry_topic: None,
            stats,
        }
    }

    /// Also route every accepted report to the reconciler hub.
    pub fn with_reconciler(mut self, reconciler: ReconcilerHandle) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Only accept messages published on `topic`; anything else on the
    /// inbox is skipped without being counted.
    pub fn with_topic_filter(mut self, topic: impl Into<String>) -> Self {
        self.telemetry_topic = Some(topic.into());
        self
    }

    pub fn advertised_interval(&self) -> u32 {
        self.backpressure.advertised_interval()
    }

    /// Consume the transport inbox until cancelled or the transport stops.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) {
        info!(
            capacity = self.queue.capacity(),
            interval_secs = self.advertised_interval(),
            "Ingest listener started"
        );

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Some(topic) = &self.telemetry_topic {
                if message.topic != *topic {
                    debug!(topic = %message.topic, "Ignoring message on non-telemetry topic");
                    continue;
                }
            }
            self.handle_payload(&message.payload, Utc::now()).await;
        }

        info!("Ingest listener stopped");
    }

    /// Process one raw payload end to end.
    pub async fn handle_payload(&mut self, payload: &[u8], received_at: DateTime<Utc>) {
        self.stats.record_received();

        let message = match decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.record_malformed();
                warn!(error = %e, bytes = payload.len(), "Dropping malformed telemetry");
                return;
            }
        };

        let device_id = message.device_id.clone();
        let fix = RawFix::from_message(&message);

        let outcome = self
            .queue
            .push(QueueItem {
                message,
                received_at,
            })
            .await;
        self.stats.record_enqueued();
        self.stats.set_queue_len(outcome.queue_len);

        if let Some(evicted) = outcome.evicted {
            let dropped = self.stats.record_overflow_drop();
            if dropped.is_power_of_two() {
                warn!(
                    dropped,
                    evicted_device = %evicted.message.device_id,
                    queue_len = outcome.queue_len,
                    "Work queue full, evicting oldest sample"
                );
            }
        }

        if let Some(config) = self.backpressure.evaluate(outcome.queue_len, Utc::now()) {
            self.stats.set_advertised_interval(config.send_interval_sec);
            info!(
                device_id = %device_id,
                interval_secs = config.send_interval_sec,
                queue_len = outcome.queue_len,
                "Reporting interval changed"
            );
            match self.publisher.publish_config(&device_id, &config).await {
                Ok(Delivery::Sent) => {
                    self.stats.record_config_sent();
                }
                Ok(Delivery::Dropped) => {
                    debug!(device_id = %device_id, "Config publish dropped, transport disconnected");
                }
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Config publish failed");
                }
            }
        }

        if let (Some(reconciler), Some(fix)) = (&self.reconciler, fix) {
            match reconciler.try_route(fix) {
                Ok(()) => {
                    self.stats.record_fix_routed();
                }
                Err(RouteError::Full) => {
                    debug!(device_id = %device_id, "Reconciler inbox full, skipping fix");
                }
                Err(RouteError::Closed) => {
                    debug!("Reconciler hub stopped, skipping fix");
                }
            }
        }
    }
}
