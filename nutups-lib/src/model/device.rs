use strum_macros::Display;

/// Which decode protocol the factory settled on for this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum DetectedProtocol {
    #[default]
    #[strum(to_string = "None")]
    Unknown,
    #[strum(to_string = "APC Smart Protocol")]
    ApcSmart,
    #[strum(to_string = "APC HID Protocol")]
    ApcHid,
    #[strum(to_string = "CyberPower HID Protocol")]
    CyberPowerHid,
    #[strum(to_string = "Eaton HID Protocol")]
    EatonHid,
    #[strum(to_string = "Generic HID Protocol")]
    GenericHid,
}

/// Static identity of the attached UPS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub firmware_aux: String,
    pub mfr_date: String,
    pub detected_protocol: DetectedProtocol,
}
