//! Supervisor Configuration Module
//!
//! Provides service configuration loaded from TOML files, with the broker
//! credentials overridable from the environment.
//!
//! ## Loading Order
//!
//! 1. `SUPERVISOR_CONFIG` environment variable (path to TOML file)
//! 2. `supervisor.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! Environment overrides (`MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS`,
//! `SUPERVISOR_ADDR`) are applied on top of whichever source won.
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(SupervisorConfig::load());
//!
//! // Anywhere in the codebase:
//! let throttle = config::get().reconciler.throttle_ms;
//! ```

mod supervisor_config;
pub mod defaults;

pub use supervisor_config::*;

use std::sync::OnceLock;

/// Global supervisor configuration, initialized once at startup.
static SUPERVISOR_CONFIG: OnceLock<SupervisorConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: SupervisorConfig) {
    if SUPERVISOR_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Falls back to built-in defaults when `init()` has not run, so library
/// users and tests never hit an uninitialized config.
pub fn get() -> &'static SupervisorConfig {
    SUPERVISOR_CONFIG.get_or_init(SupervisorConfig::default)
}
