//! Daemon configuration, loaded from TOML by the binary.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::UpsError;

/// Bounds applied to `protocol_timeout_ms` whenever it is consumed.
pub const PROTOCOL_TIMEOUT_MIN_MS: u32 = 5_000;
pub const PROTOCOL_TIMEOUT_MAX_MS: u32 = 300_000;

/// Ceiling for the NUT client slot table.
pub const MAX_CLIENTS_CEILING: u8 = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Use the simulation transport instead of real USB hardware.
    pub simulation_mode: bool,
    /// Exact vendor ID to match, 0 = auto-detect.
    pub usb_vendor_id: u16,
    /// Exact product ID to match, 0 = auto-detect.
    pub usb_product_id: u16,
    /// How long without a successful read before the device is considered
    /// disconnected. Clamped to [5000, 300000] ms at use.
    pub protocol_timeout_ms: u32,
    /// "auto", or a case-insensitive substring of a decoder name.
    pub protocol_selection: String,
    /// Reference mains voltage for heuristic rescaling (Eaton decoder).
    pub fallback_nominal_voltage: f32,
    /// Periodic poll interval.
    pub update_interval_ms: u64,
    pub ups: UpsIdentityConfig,
    pub nut: NutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpsIdentityConfig {
    /// Name the UPS is published under on the NUT port.
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NutConfig {
    pub port: u16,
    pub max_clients: u8,
    /// Empty username/password disables authentication.
    pub username: String,
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulation_mode: false,
            usb_vendor_id: 0,
            usb_product_id: 0,
            protocol_timeout_ms: 10_000,
            protocol_selection: "auto".to_string(),
            fallback_nominal_voltage: 230.0,
            update_interval_ms: 5_000,
            ups: UpsIdentityConfig::default(),
            nut: NutConfig::default(),
        }
    }
}

impl Default for UpsIdentityConfig {
    fn default() -> Self {
        Self {
            name: "ups".to_string(),
            description: "ESPHome UPS".to_string(),
        }
    }
}

impl Default for NutConfig {
    fn default() -> Self {
        Self {
            port: 3493,
            max_clients: 4,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, UpsError> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), UpsError> {
        if self.update_interval_ms == 0 {
            return Err(UpsError::Config(
                "update_interval_ms must be > 0".to_string(),
            ));
        }
        if self.nut.max_clients == 0 || self.nut.max_clients > MAX_CLIENTS_CEILING {
            return Err(UpsError::Config(format!(
                "nut.max_clients must be in 1..={} (got {})",
                MAX_CLIENTS_CEILING, self.nut.max_clients
            )));
        }
        if self.ups.name.is_empty() || self.ups.name.contains(char::is_whitespace) {
            return Err(UpsError::Config(
                "ups.name must be a non-empty token without whitespace".to_string(),
            ));
        }
        Ok(())
    }

    /// Protocol staleness timeout, bounded to sane values.
    pub fn clamped_protocol_timeout_ms(&self) -> u32 {
        self.protocol_timeout_ms
            .clamp(PROTOCOL_TIMEOUT_MIN_MS, PROTOCOL_TIMEOUT_MAX_MS)
    }
}
