//! Telemetry acquisition
//!
//! Payload decoding and the MQTT broker connection (inbound telemetry,
//! outbound control-plane config).

pub mod decode;
pub mod mqtt;

pub use decode::{decode, validate_device_id, DecodeError};
pub use mqtt::{
    connect, ControlPublisher, Delivery, InboundMessage, MqttControlPublisher, MqttTransport,
    PublishError, TransportStatus,
};
