use bitflags::bitflags;

use super::limits;

bitflags! {
    /// Aggregate UPS condition, decoded from vendor status reports.
    ///
    /// `ONLINE` and `ON_BATTERY` are mutually exclusive within one decoded
    /// snapshot; decoders prefer the discharging evidence when both could
    /// be derived.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const ONLINE          = 1 << 0;
        const ON_BATTERY      = 1 << 1;
        const LOW_BATTERY     = 1 << 2;
        const REPLACE_BATTERY = 1 << 3;
        const CHARGING        = 1 << 4;
        const FAULT           = 1 << 5;
        const OVERLOAD        = 1 << 6;
        const CALIBRATING     = 1 << 7;
        const OFF             = 1 << 8;
    }
}

impl StatusFlags {
    /// Renders the flag set using NUT status-token conventions, in the
    /// canonical order `OL OB LB CHRG ALARM`. Empty when no flag is set.
    pub fn nut_string(&self) -> String {
        let mut out = String::new();
        let mut push = |tok: &str| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(tok);
        };
        if self.contains(StatusFlags::ONLINE) {
            push("OL");
        } else if self.contains(StatusFlags::ON_BATTERY) {
            push("OB");
        }
        if self.contains(StatusFlags::LOW_BATTERY) {
            push("LB");
        }
        if self.contains(StatusFlags::CHARGING) {
            push("CHRG");
        }
        if self.contains(StatusFlags::FAULT) {
            push("ALARM");
        }
        out
    }
}

/// Mains/output side telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerData {
    /// NUT-convention status text ("OL", "OB LB", ...), derived from
    /// `status_flags` after every decode cycle.
    pub status: String,
    pub status_flags: StatusFlags,
    pub input_voltage: f32,
    pub input_voltage_nominal: f32,
    pub output_voltage: f32,
    pub output_voltage_nominal: f32,
    pub load_percent: f32,
    pub frequency: f32,
    pub input_transfer_low: f32,
    pub input_transfer_high: f32,
    pub realpower_nominal: f32,
    pub apparent_power_nominal: f32,
}

impl Default for PowerData {
    fn default() -> Self {
        Self {
            status: String::new(),
            status_flags: StatusFlags::empty(),
            input_voltage: f32::NAN,
            input_voltage_nominal: f32::NAN,
            output_voltage: f32::NAN,
            output_voltage_nominal: f32::NAN,
            load_percent: f32::NAN,
            frequency: f32::NAN,
            input_transfer_low: f32::NAN,
            input_transfer_high: f32::NAN,
            realpower_nominal: f32::NAN,
            apparent_power_nominal: f32::NAN,
        }
    }
}

impl PowerData {
    pub fn input_voltage_valid(&self) -> bool {
        self.input_voltage >= limits::VOLTAGE_MIN && self.input_voltage <= limits::VOLTAGE_MAX
    }
}
