use super::limits;

/// Battery-side telemetry. All reals default to NaN (unset).
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryData {
    /// State of charge, percent.
    pub level: f32,
    /// Measured battery voltage, volts.
    pub voltage: f32,
    /// Nominal (design) battery voltage, volts.
    pub voltage_nominal: f32,
    /// Estimated runtime remaining, minutes.
    pub runtime_minutes: f32,
    /// Runtime threshold below which the device reports low battery, minutes.
    pub runtime_low_minutes: f32,
    /// Human-readable charge state ("charging", "discharging", ...).
    pub status: String,
    /// Battery chemistry ("PbAc", ...).
    pub battery_type: String,
    /// Battery manufacture/replacement date.
    pub mfr_date: String,
    /// Charge percentage that triggers the warning threshold.
    pub charge_warning: f32,
    /// Charge percentage that triggers the low threshold.
    pub charge_low: f32,
}

impl Default for BatteryData {
    fn default() -> Self {
        Self {
            level: f32::NAN,
            voltage: f32::NAN,
            voltage_nominal: f32::NAN,
            runtime_minutes: f32::NAN,
            runtime_low_minutes: f32::NAN,
            status: String::new(),
            battery_type: String::new(),
            mfr_date: String::new(),
            charge_warning: f32::NAN,
            charge_low: f32::NAN,
        }
    }
}

impl BatteryData {
    /// A battery reading is usable once the charge level is a real percentage.
    pub fn is_valid(&self) -> bool {
        self.level >= limits::PERCENT_MIN && self.level <= limits::PERCENT_MAX
    }

    /// Low-battery check against the charge-low threshold when one was decoded.
    pub fn is_low(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        if !self.charge_low.is_nan() {
            return self.level <= self.charge_low;
        }
        false
    }
}
