//! Normalized UPS data model.
//!
//! Every decoder fills a caller-supplied [`UpsData`] in place. Fields carry
//! an "unset" sentinel until a decoder writes them: `NaN` for reals, the
//! empty string for text, `-1` for signed delays and timers. Consumers
//! (telemetry sinks, the NUT server) take by-value snapshots under the
//! owner's mutex and never hold a reference into the shared record.

mod battery;
mod device;
mod power;
mod settings;

pub use battery::BatteryData;
pub use device::{DetectedProtocol, DeviceInfo};
pub use power::{PowerData, StatusFlags};
pub use settings::{BeeperState, ConfigData, InputSensitivity};
pub use test::{TestResult, TestState, TestStatus};

/// Physical validity ranges. Values outside are dropped, not clamped,
/// except battery level and load percent which clamp to [0, 100].
pub mod limits {
    pub const VOLTAGE_MIN: f32 = 50.0;
    pub const VOLTAGE_MAX: f32 = 300.0;
    pub const PERCENT_MIN: f32 = 0.0;
    pub const PERCENT_MAX: f32 = 100.0;
    pub const FREQUENCY_MIN: f32 = 40.0;
    pub const FREQUENCY_MAX: f32 = 70.0;
    pub const RUNTIME_MIN: f32 = 0.0;
    pub const RUNTIME_MAX: f32 = 65534.0;
}

/// Returns `value` if it lies within `[min, max]`, otherwise NaN.
pub fn checked_range(value: f32, min: f32, max: f32) -> f32 {
    if value >= min && value <= max {
        value
    } else {
        f32::NAN
    }
}

/// Clamps a percentage into [0, 100], passing NaN through untouched.
pub fn clamp_percent(value: f32) -> f32 {
    if value.is_nan() {
        value
    } else {
        value.clamp(limits::PERCENT_MIN, limits::PERCENT_MAX)
    }
}

/// Composite record for one UPS, the unit of exchange between the decode
/// layer, the monitor cache, the telemetry sinks and the NUT server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsData {
    pub battery: BatteryData,
    pub power: PowerData,
    pub device: DeviceInfo,
    pub test: TestStatus,
    pub config: ConfigData,
}

impl UpsData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores every field to its unset sentinel.
    ///
    /// The monitor's read cycle is reset-then-fill; it saves and restores
    /// `device.detected_protocol` around this call so the active protocol
    /// identity survives the cycle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True when at least one physically meaningful field has been decoded.
    pub fn has_any_data(&self) -> bool {
        self.battery.is_valid()
            || self.power.input_voltage_valid()
            || !self.power.output_voltage.is_nan()
            || !self.power.load_percent.is_nan()
            || !self.power.status_flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_all_sentinels() {
        let data = UpsData::new();
        assert!(data.battery.level.is_nan());
        assert!(data.power.input_voltage.is_nan());
        assert!(data.battery.status.is_empty());
        assert_eq!(data.config.delay_shutdown, -1);
        assert_eq!(data.test.timer_shutdown, -1);
        assert_eq!(data.device.detected_protocol, DetectedProtocol::Unknown);
        assert!(!data.has_any_data());
    }

    #[test]
    fn reset_clears_decoded_fields() {
        let mut data = UpsData::new();
        data.battery.level = 55.0;
        data.power.status_flags = StatusFlags::ONLINE;
        data.reset();
        assert!(data.battery.level.is_nan());
        assert!(data.power.status_flags.is_empty());
    }

    #[test]
    fn checked_range_drops_out_of_range() {
        assert!(checked_range(471.0, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX).is_nan());
        assert_eq!(
            checked_range(230.0, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX),
            230.0
        );
    }

    #[test]
    fn clamp_percent_clamps_but_keeps_nan() {
        assert_eq!(clamp_percent(120.0), 100.0);
        assert_eq!(clamp_percent(-3.0), 0.0);
        assert!(clamp_percent(f32::NAN).is_nan());
    }
}
