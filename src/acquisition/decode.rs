//! Telemetry payload decoding and validation
//!
//! A payload is accepted when it is a JSON object with a non-empty
//! `deviceId` and, if a location is present, in-range coordinates.
//! Anything else is malformed and dropped by the listener.

use thiserror::Error;

use crate::types::TelemetryMessage;

/// Reasons a telemetry payload is rejected
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid telemetry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or empty deviceId")]
    MissingDeviceId,

    #[error("deviceId contains control characters or MQTT topic separators")]
    InvalidDeviceId,

    #[error("Coordinates out of range: lat={latitude}, lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
}

/// Trim a device id and check it can name a control topic and a storage key.
///
/// Ids are substituted into per-device publish topics, where `+` and `#`
/// are illegal and `/` would address another topic level. NUL is the
/// storage key separator.
pub fn validate_device_id(device_id: &str) -> Result<&str, DecodeError> {
    let trimmed = device_id.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::MissingDeviceId);
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() || matches!(c, '+' | '#' | '/'))
    {
        return Err(DecodeError::InvalidDeviceId);
    }
    Ok(trimmed)
}

/// Decode one wire payload into a validated [`TelemetryMessage`].
pub fn decode(payload: &[u8]) -> Result<TelemetryMessage, DecodeError> {
    let mut message: TelemetryMessage = serde_json::from_slice(payload)?;

    let trimmed = validate_device_id(&message.device_id)?;
    if trimmed.len() != message.device_id.len() {
        message.device_id = trimmed.to_string();
    }

    if let Some(location) = &message.location {
        if !location.is_valid() {
            return Err(DecodeError::InvalidCoordinates {
                latitude: location.latitude,
                longitude: location.longitude,
            });
        }
    }

    Ok(message)
}
