//! System-wide default constants.
//!
//! Centralises the numbers the pipeline falls back to when no config file
//! is present. Grouped by subsystem for easy discovery.

// ============================================================================
// Transport
// ============================================================================

/// Default MQTT broker port (TLS).
pub const MQTT_DEFAULT_PORT: u16 = 8883;

/// Topic devices publish telemetry on.
pub const TELEMETRY_TOPIC: &str = "cell_info";

/// Per-device control topic. `{device_id}` is substituted at publish time.
pub const CONTROL_TOPIC_TEMPLATE: &str = "device/{device_id}/config";

/// Fleet-wide control topic used by operator overrides without a target device.
pub const BROADCAST_TOPIC: &str = "device/all/config";

/// MQTT keep-alive (seconds).
pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;

/// Fixed delay between reconnection attempts (milliseconds).
pub const MQTT_RECONNECT_INTERVAL_MS: u64 = 1_000;

/// Capacity of the rumqttc request channel.
pub const MQTT_REQUEST_CAPACITY: usize = 64;

// ============================================================================
// Ingest
// ============================================================================

/// Bounded work queue capacity (items).
///
/// Must stay above the highest backpressure tier so the slowest interval
/// is reachable before overflow kicks in.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Transport → listener hand-off buffer (messages).
pub const INBOX_CAPACITY: usize = 1_024;

/// Reconciler hub command buffer (fixes).
pub const RECONCILER_INBOX_CAPACITY: usize = 1_024;

/// Observer broadcast buffer (updates). Slow observers skip what they miss.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Backpressure
// ============================================================================

/// Reporting interval advertised when the queue is healthy (seconds).
pub const BASELINE_INTERVAL_SECS: u32 = 15;

/// Queue length above which devices are slowed to [`MODERATE_LOAD_INTERVAL_SECS`].
pub const MODERATE_LOAD_QUEUE_LEN: usize = 200;

/// Interval advertised under moderate load (seconds).
pub const MODERATE_LOAD_INTERVAL_SECS: u32 = 60;

/// Queue length above which devices are slowed to [`HEAVY_LOAD_INTERVAL_SECS`].
pub const HEAVY_LOAD_QUEUE_LEN: usize = 500;

/// Interval advertised under heavy load (seconds).
pub const HEAVY_LOAD_INTERVAL_SECS: u32 = 120;

/// Reason tag carried by automatic interval changes.
pub const REASON_SERVER_LOAD: &str = "server_load";

/// Reason tag carried by operator-triggered interval changes.
pub const REASON_MANUAL_OVERRIDE: &str = "manual_override";

// ============================================================================
// Reconciler
// ============================================================================

/// Sliding window of raw fixes averaged into one candidate.
pub const POSITION_BUFFER_SIZE: usize = 5;

/// Fixes with a declared accuracy worse than this are discarded (meters).
pub const MAX_ACCURACY_M: f64 = 100.0;

/// Candidates closer than this to the last valid position are jitter (meters).
pub const MIN_MOVE_M: f64 = 20.0;

/// Candidates implying a speed above this are spikes (km/h).
pub const MAX_SPEED_KPH: f64 = 150.0;

/// Minimum spacing between two emissions for one device (milliseconds).
pub const UPDATE_THROTTLE_MS: u64 = 1_000;

/// Mean Earth radius used by the haversine distance (km).
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

// ============================================================================
// Server / Storage
// ============================================================================

/// HTTP bind address.
pub const SERVER_ADDR: &str = "0.0.0.0:3000";

/// Sled database location.
pub const DB_PATH: &str = "./data/telemetry.db";
