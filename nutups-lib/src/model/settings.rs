use strum_macros::Display;

/// Audible alarm state as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum BeeperState {
    #[default]
    #[strum(to_string = "unknown")]
    Unknown,
    #[strum(to_string = "enabled")]
    Enabled,
    #[strum(to_string = "disabled")]
    Disabled,
    #[strum(to_string = "muted")]
    Muted,
}

impl BeeperState {
    /// NUT AudibleAlarmControl encoding: 1 disabled, 2 enabled, 3 muted.
    pub fn from_hid_value(raw: u8) -> Self {
        match raw {
            1 => BeeperState::Disabled,
            2 => BeeperState::Enabled,
            3 => BeeperState::Muted,
            _ => BeeperState::Unknown,
        }
    }

    pub fn hid_value(&self) -> Option<u8> {
        match self {
            BeeperState::Disabled => Some(1),
            BeeperState::Enabled => Some(2),
            BeeperState::Muted => Some(3),
            BeeperState::Unknown => None,
        }
    }
}

/// Input voltage sensitivity setting of line-interactive models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum InputSensitivity {
    #[default]
    #[strum(to_string = "unknown")]
    Unknown,
    #[strum(to_string = "low")]
    Low,
    #[strum(to_string = "normal")]
    Medium,
    #[strum(to_string = "high")]
    High,
    #[strum(to_string = "auto")]
    Auto,
}

/// Device-side configuration values, plus the few knobs echoed from the
/// host configuration so sinks can expose them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigData {
    /// Seconds before the UPS cuts output after a shutdown command; -1 unset.
    pub delay_shutdown: i32,
    /// Seconds before output returns after power-back; -1 unset.
    pub delay_start: i32,
    /// Seconds for a reboot cycle; -1 unset.
    pub delay_reboot: i32,
    pub beeper_status: String,
    pub beeper_state: BeeperState,
    pub input_sensitivity: String,
    pub sensitivity: InputSensitivity,
    pub low_temp_threshold: f32,
    pub critical_temp_threshold: f32,
    pub high_temp_threshold: f32,
    pub auto_restart: bool,
    pub cold_start: bool,
    pub audible_alarm: bool,
    pub protocol_timeout_ms: u32,
    pub retry_count: u8,
    pub auto_detect_protocol: bool,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            delay_shutdown: -1,
            delay_start: -1,
            delay_reboot: -1,
            beeper_status: String::new(),
            beeper_state: BeeperState::Unknown,
            input_sensitivity: String::new(),
            sensitivity: InputSensitivity::Unknown,
            low_temp_threshold: f32::NAN,
            critical_temp_threshold: f32::NAN,
            high_temp_threshold: f32::NAN,
            auto_restart: false,
            cold_start: false,
            audible_alarm: false,
            protocol_timeout_ms: 0,
            retry_count: 0,
            auto_detect_protocol: true,
        }
    }
}

impl ConfigData {
    pub fn set_beeper(&mut self, state: BeeperState) {
        self.beeper_state = state;
        self.beeper_status = state.to_string();
    }

    pub fn set_sensitivity(&mut self, sensitivity: InputSensitivity) {
        self.sensitivity = sensitivity;
        self.input_sensitivity = sensitivity.to_string();
    }
}
