//! Supervisor Configuration - pipeline tuning as operator-editable TOML values
//!
//! Each section implements `Default` with the values in [`super::defaults`],
//! so a missing file or a partial file behaves exactly like the built-ins.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one supervisor deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Broker connection and topic layout
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Work queue sizing
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Adaptive reporting-interval policy
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    /// Position smoothing and anomaly gates
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Persistent storage
    #[serde(default)]
    pub storage: StorageConfig,
}

impl SupervisorConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file_or_default() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var("SUPERVISOR_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded supervisor config from SUPERVISOR_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SUPERVISOR_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SUPERVISOR_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./supervisor.toml
        let local = PathBuf::from("supervisor.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded supervisor config from ./supervisor.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./supervisor.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No supervisor.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the filesystem.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Overlay broker credentials and bind address from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST").filter(|v| !v.is_empty()) {
            self.mqtt.host = Some(host);
        }
        if let Some(port) = lookup("MQTT_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!(value = %port, "MQTT_PORT is not a valid port, keeping {}", self.mqtt.port),
            }
        }
        if let Some(user) = lookup("MQTT_USER").filter(|v| !v.is_empty()) {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = lookup("MQTT_PASS").filter(|v| !v.is_empty()) {
            self.mqtt.password = Some(pass);
        }
        if let Some(addr) = lookup("SUPERVISOR_ADDR").filter(|v| !v.is_empty()) {
            self.server.addr = addr;
        }
    }

    /// Validate all sections for internal consistency.
    ///
    /// Rules:
    /// - Backpressure tiers are ordered by strictly descending threshold and
    ///   their intervals never increase along that order
    /// - Every interval is positive
    /// - The queue can hold more items than the highest tier threshold
    /// - Reconciler window and throttle are non-zero, gates are finite and positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let bp = &self.backpressure;

        if bp.baseline_interval_secs == 0 {
            errors.push("backpressure.baseline_interval_secs must be > 0".to_string());
        }
        for (i, tier) in bp.tiers.iter().enumerate() {
            if tier.interval_secs == 0 {
                errors.push(format!("backpressure.tiers[{i}].interval_secs must be > 0"));
            }
            if tier.above == 0 {
                errors.push(format!("backpressure.tiers[{i}].above must be > 0"));
            }
        }
        for (i, pair) in bp.tiers.windows(2).enumerate() {
            if pair[1].above >= pair[0].above {
                errors.push(format!(
                    "backpressure.tiers[{}].above ({}) must be below tiers[{i}].above ({})",
                    i + 1,
                    pair[1].above,
                    pair[0].above
                ));
            }
            if pair[1].interval_secs > pair[0].interval_secs {
                errors.push(format!(
                    "backpressure.tiers[{}].interval_secs ({}) must not exceed tiers[{i}].interval_secs ({})",
                    i + 1,
                    pair[1].interval_secs,
                    pair[0].interval_secs
                ));
            }
        }
        if let Some(top) = bp.tiers.first() {
            if self.ingest.queue_capacity <= top.above {
                errors.push(format!(
                    "ingest.queue_capacity ({}) must exceed the highest backpressure threshold ({})",
                    self.ingest.queue_capacity, top.above
                ));
            }
        }
        if self.ingest.queue_capacity == 0 {
            errors.push("ingest.queue_capacity must be > 0".to_string());
        }
        if self.ingest.inbox_capacity == 0 {
            errors.push("ingest.inbox_capacity must be > 0".to_string());
        }

        let r = &self.reconciler;
        if r.buffer_size == 0 {
            errors.push("reconciler.buffer_size must be > 0".to_string());
        }
        if r.throttle_ms == 0 {
            errors.push("reconciler.throttle_ms must be > 0".to_string());
        }
        for (name, value) in [
            ("max_accuracy_m", r.max_accuracy_m),
            ("min_move_m", r.min_move_m),
            ("max_speed_kph", r.max_speed_kph),
            ("earth_radius_km", r.earth_radius_km),
        ] {
            if !value.is_finite() || value <= 0.0 {
                errors.push(format!("reconciler.{name} must be finite and > 0 (got {value})"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// MQTT
// ============================================================================

/// Broker connection. Ingestion only starts when host, username and
/// password are all present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Connect over TLS (`mqtts://`)
    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,

    /// Must contain `{device_id}`
    #[serde(default = "default_control_topic_template")]
    pub control_topic_template: String,

    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl MqttConfig {
    /// Broker credentials, or `None` when any of them is missing.
    pub fn credentials(&self) -> Option<MqttCredentials<'_>> {
        match (&self.host, &self.username, &self.password) {
            (Some(host), Some(username), Some(password))
                if !host.is_empty() && !username.is_empty() && !password.is_empty() =>
            {
                Some(MqttCredentials {
                    host,
                    username,
                    password,
                })
            }
            _ => None,
        }
    }

    /// Control topic addressed to one device.
    pub fn control_topic(&self, device_id: &str) -> String {
        self.control_topic_template.replace("{device_id}", device_id)
    }
}

/// Borrowed view of complete broker credentials.
#[derive(Debug, Clone, Copy)]
pub struct MqttCredentials<'a> {
    pub host: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: defaults::MQTT_DEFAULT_PORT,
            username: None,
            password: None,
            tls: true,
            client_id_prefix: default_client_id_prefix(),
            telemetry_topic: default_telemetry_topic(),
            control_topic_template: default_control_topic_template(),
            broadcast_topic: default_broadcast_topic(),
            keep_alive_secs: defaults::MQTT_KEEP_ALIVE_SECS,
            reconnect_interval_ms: defaults::MQTT_RECONNECT_INTERVAL_MS,
            request_capacity: defaults::MQTT_REQUEST_CAPACITY,
        }
    }
}

fn default_mqtt_port() -> u16 {
    defaults::MQTT_DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_client_id_prefix() -> String {
    "supervisor".to_string()
}
fn default_telemetry_topic() -> String {
    defaults::TELEMETRY_TOPIC.to_string()
}
fn default_control_topic_template() -> String {
    defaults::CONTROL_TOPIC_TEMPLATE.to_string()
}
fn default_broadcast_topic() -> String {
    defaults::BROADCAST_TOPIC.to_string()
}
fn default_keep_alive_secs() -> u64 {
    defaults::MQTT_KEEP_ALIVE_SECS
}
fn default_reconnect_interval_ms() -> u64 {
    defaults::MQTT_RECONNECT_INTERVAL_MS
}
fn default_request_capacity() -> usize {
    defaults::MQTT_REQUEST_CAPACITY
}

// ============================================================================
// Ingest
// ============================================================================

/// What the work queue does when a push finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room
    #[default]
    DropOldest,
    /// Make the producer wait until the drain worker frees a slot
    BlockProducer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Transport → listener hand-off buffer
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            inbox_capacity: defaults::INBOX_CAPACITY,
        }
    }
}

fn default_queue_capacity() -> usize {
    defaults::QUEUE_CAPACITY
}
fn default_inbox_capacity() -> usize {
    defaults::INBOX_CAPACITY
}

// ============================================================================
// Backpressure
// ============================================================================

/// One step of the interval policy: queue lengths strictly above `above`
/// advertise `interval_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTier {
    pub above: usize,
    pub interval_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_baseline_interval")]
    pub baseline_interval_secs: u32,

    /// Highest threshold first; the first matching tier wins.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<IntervalTier>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            baseline_interval_secs: defaults::BASELINE_INTERVAL_SECS,
            tiers: default_tiers(),
        }
    }
}

fn default_baseline_interval() -> u32 {
    defaults::BASELINE_INTERVAL_SECS
}
fn default_tiers() -> Vec<IntervalTier> {
    vec![
        IntervalTier {
            above: defaults::HEAVY_LOAD_QUEUE_LEN,
            interval_secs: defaults::HEAVY_LOAD_INTERVAL_SECS,
        },
        IntervalTier {
            above: defaults::MODERATE_LOAD_QUEUE_LEN,
            interval_secs: defaults::MODERATE_LOAD_INTERVAL_SECS,
        },
    ]
}

// ============================================================================
// Reconciler
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_max_accuracy")]
    pub max_accuracy_m: f64,

    #[serde(default = "default_min_move")]
    pub min_move_m: f64,

    #[serde(default = "default_max_speed")]
    pub max_speed_kph: f64,

    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    #[serde(default = "default_earth_radius")]
    pub earth_radius_km: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            buffer_size: defaults::POSITION_BUFFER_SIZE,
            max_accuracy_m: defaults::MAX_ACCURACY_M,
            min_move_m: defaults::MIN_MOVE_M,
            max_speed_kph: defaults::MAX_SPEED_KPH,
            throttle_ms: defaults::UPDATE_THROTTLE_MS,
            earth_radius_km: defaults::EARTH_RADIUS_KM,
        }
    }
}

fn default_buffer_size() -> usize {
    defaults::POSITION_BUFFER_SIZE
}
fn default_max_accuracy() -> f64 {
    defaults::MAX_ACCURACY_M
}
fn default_min_move() -> f64 {
    defaults::MIN_MOVE_M
}
fn default_max_speed() -> f64 {
    defaults::MAX_SPEED_KPH
}
fn default_throttle_ms() -> u64 {
    defaults::UPDATE_THROTTLE_MS
}
fn default_earth_radius() -> f64 {
    defaults::EARTH_RADIUS_KM
}

// ============================================================================
// Server / Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Allowed cross-origin callers. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(defaults::DB_PATH)
}
