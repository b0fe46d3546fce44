//! MQTT transport and control-plane publisher
//!
//! The transport task owns the rumqttc `EventLoop`: it keeps polling through
//! connection errors (rumqttc reconnects on the next poll), re-subscribes on
//! every ConnAck, and hands telemetry payloads to the ingest listener through
//! a bounded channel without ever awaiting it.
//!
//! [`MqttControlPublisher`] shares the connection flag with the transport, so
//! config publishes issued while the broker is unreachable are dropped
//! instead of piling up in the client's request queue.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MqttConfig, MqttCredentials};
use crate::types::ConfigMessage;

/// Control-plane publish errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to encode config message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("MQTT client rejected publish: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// What happened to a control-plane publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport
    Sent,
    /// Transport disconnected; publish discarded
    Dropped,
}

/// Sends interval directives back to devices.
#[async_trait]
pub trait ControlPublisher: Send + Sync {
    /// Publish on the device's own control topic (retained).
    async fn publish_config(
        &self,
        device_id: &str,
        message: &ConfigMessage,
    ) -> Result<Delivery, PublishError>;

    /// Publish on the all-devices control topic (retained).
    async fn publish_broadcast(&self, message: &ConfigMessage) -> Result<Delivery, PublishError>;

    fn is_connected(&self) -> bool;
}

/// One raw message taken off the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection state shared by the transport task and the publisher
#[derive(Debug, Default)]
pub struct TransportStatus {
    connected: AtomicBool,
    connections: AtomicU64,
    inbox_drops: AtomicU64,
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Successful ConnAcks since start (first connect included)
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Payloads discarded because the listener inbox was full
    pub fn inbox_drops(&self) -> u64 {
        self.inbox_drops.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::AcqRel)
    }
}

/// Broker connection driving the rumqttc event loop
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    status: Arc<TransportStatus>,
    telemetry_topic: String,
    reconnect_interval: Duration,
}

/// Build the client, transport and publisher for one broker connection.
///
/// Nothing touches the network until [`MqttTransport::run`] polls the loop.
pub fn connect(
    config: &MqttConfig,
    credentials: MqttCredentials<'_>,
) -> (MqttTransport, MqttControlPublisher) {
    let client_id = format!("{}-{}", config.client_id_prefix, Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, credentials.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_credentials(credentials.username, credentials.password);
    options.set_clean_session(true);
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
    let status = Arc::new(TransportStatus::default());

    let transport = MqttTransport {
        client: client.clone(),
        eventloop,
        status: Arc::clone(&status),
        telemetry_topic: config.telemetry_topic.clone(),
        reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
    };
    let publisher = MqttControlPublisher {
        client,
        status,
        control_topic_template: config.control_topic_template.clone(),
        broadcast_topic: config.broadcast_topic.clone(),
    };

    info!(
        host = credentials.host,
        port = config.port,
        tls = config.tls,
        topic = %config.telemetry_topic,
        "MQTT transport configured"
    );

    (transport, publisher)
}

impl MqttTransport {
    pub fn status(&self) -> Arc<TransportStatus> {
        Arc::clone(&self.status)
    }

    /// Poll the broker until cancelled or the listener goes away.
    pub async fn run(mut self, inbox: mpsc::Sender<InboundMessage>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.status.set_connected(true);
                    self.status.connections.fetch_add(1, Ordering::Relaxed);
                    info!(topic = %self.telemetry_topic, "MQTT connected, subscribing");
                    // try_subscribe: awaiting here would stall the loop that drains requests
                    if let Err(e) = self
                        .client
                        .try_subscribe(self.telemetry_topic.as_str(), QoS::AtMostOnce)
                    {
                        warn!(error = %e, "Failed to queue telemetry subscription");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    match inbox.try_send(message) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            let dropped = self.status.inbox_drops.fetch_add(1, Ordering::Relaxed) + 1;
                            if dropped.is_power_of_two() {
                                warn!(dropped, "Listener inbox full, dropping telemetry");
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("Listener inbox closed, stopping MQTT transport");
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.status.set_connected(false);
                    warn!("Broker sent disconnect");
                }
                Ok(other) => {
                    debug!(event = ?other, "MQTT event");
                }
                Err(e) => {
                    if self.status.set_connected(false) {
                        warn!(error = %e, "MQTT connection lost, reconnecting");
                    } else {
                        debug!(error = %e, "MQTT reconnect attempt failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_interval) => {}
                    }
                }
            }
        }

        self.status.set_connected(false);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
        }
        info!("MQTT transport stopped");
    }
}

/// Publishes retained, at-least-once config messages over the shared client.
#[derive(Clone)]
pub struct MqttControlPublisher {
    client: AsyncClient,
    status: Arc<TransportStatus>,
    control_topic_template: String,
    broadcast_topic: String,
}

impl MqttControlPublisher {
    fn send(&self, topic: String, message: &ConfigMessage) -> Result<Delivery, PublishError> {
        if !self.status.is_connected() {
            debug!(topic = %topic, "Transport disconnected, dropping config publish");
            return Ok(Delivery::Dropped);
        }
        let payload = serde_json::to_vec(message)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)?;
        Ok(Delivery::Sent)
    }
}

#[async_trait]
impl ControlPublisher for MqttControlPublisher {
    async fn publish_config(
        &self,
        device_id: &str,
        message: &ConfigMessage,
    ) -> Result<Delivery, PublishError> {
        let topic = self.control_topic_template.replace("{device_id}", device_id);
        self.send(topic, message)
    }

    async fn publish_broadcast(&self, message: &ConfigMessage) -> Result<Delivery, PublishError> {
        self.send(self.broadcast_topic.clone(), message)
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }
}
