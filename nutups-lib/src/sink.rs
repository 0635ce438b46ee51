//! Telemetry sink seam.
//!
//! The monitor publishes validated values under stable string keys; what
//! sits behind a sink (automation entities, MQTT, a log line) is outside
//! this crate.

use tracing::debug;

/// Stable publication keys.
pub mod keys {
    pub const BATTERY_LEVEL: &str = "battery.level";
    pub const BATTERY_VOLTAGE: &str = "battery.voltage";
    pub const BATTERY_VOLTAGE_NOMINAL: &str = "battery.voltage.nominal";
    pub const BATTERY_RUNTIME: &str = "battery.runtime";
    pub const BATTERY_RUNTIME_LOW: &str = "battery.runtime.low";
    pub const BATTERY_STATUS: &str = "battery.status";
    pub const INPUT_VOLTAGE: &str = "input.voltage";
    pub const INPUT_VOLTAGE_NOMINAL: &str = "input.voltage.nominal";
    pub const INPUT_FREQUENCY: &str = "input.frequency";
    pub const INPUT_TRANSFER_LOW: &str = "input.transfer.low";
    pub const INPUT_TRANSFER_HIGH: &str = "input.transfer.high";
    pub const INPUT_SENSITIVITY: &str = "input.sensitivity";
    pub const OUTPUT_VOLTAGE: &str = "output.voltage";
    pub const UPS_LOAD: &str = "ups.load";
    pub const UPS_REALPOWER_NOMINAL: &str = "ups.realpower.nominal";
    pub const UPS_STATUS: &str = "ups.status";
    pub const UPS_MFR: &str = "ups.mfr";
    pub const UPS_MODEL: &str = "ups.model";
    pub const UPS_SERIAL: &str = "ups.serial";
    pub const UPS_FIRMWARE: &str = "ups.firmware";
    pub const UPS_PROTOCOL: &str = "ups.protocol";
    pub const UPS_BEEPER_STATUS: &str = "ups.beeper.status";
    pub const UPS_TEST_RESULT: &str = "ups.test.result";
    pub const UPS_DELAY_SHUTDOWN: &str = "ups.delay.shutdown";
    pub const UPS_DELAY_START: &str = "ups.delay.start";
    pub const UPS_DELAY_REBOOT: &str = "ups.delay.reboot";
    pub const UPS_TIMER_SHUTDOWN: &str = "ups.timer.shutdown";
    pub const UPS_TIMER_START: &str = "ups.timer.start";
    pub const UPS_TIMER_REBOOT: &str = "ups.timer.reboot";
    pub const UPS_ONLINE: &str = "ups.online";
    pub const UPS_ON_BATTERY: &str = "ups.on.battery";
    pub const UPS_LOW_BATTERY: &str = "ups.low.battery";
}

/// Receives validated telemetry. Implementations must be cheap and
/// non-blocking; the monitor calls them from its poll task.
pub trait TelemetrySink: Send + Sync {
    fn publish_numeric(&self, key: &str, value: f32);
    fn publish_binary(&self, key: &str, value: bool);
    fn publish_text(&self, key: &str, value: &str);
}

/// Sink that mirrors every publication to the log at debug level. Used by
/// the daemon when no richer consumer is wired up.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish_numeric(&self, key: &str, value: f32) {
        debug!("{key} = {value:.1}");
    }

    fn publish_binary(&self, key: &str, value: bool) {
        debug!("{key} = {value}");
    }

    fn publish_text(&self, key: &str, value: &str) {
        debug!("{key} = {value:?}");
    }
}
