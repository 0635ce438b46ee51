//! Mapping from the internal data model to the NUT variable namespace.

use crate::model::UpsData;

/// Variables emitted by `LIST VAR`, in the order NUT clients expect them.
pub const LIST_VAR_ORDER: &[&str] = &[
    "ups.mfr",
    "ups.model",
    "ups.status",
    "ups.serial",
    "ups.firmware",
    "battery.charge",
    "battery.voltage",
    "battery.voltage.nominal",
    "battery.runtime",
    "input.voltage",
    "input.voltage.nominal",
    "input.frequency",
    "input.transfer.low",
    "input.transfer.high",
    "output.voltage",
    "output.voltage.nominal",
    "ups.load",
    "ups.realpower.nominal",
    "ups.power.nominal",
];

/// Core variable names for the legacy `upsc -l` listing.
pub const LEGACY_VAR_NAMES: &[&str] = &[
    "ups.mfr",
    "ups.model",
    "battery.charge",
    "input.voltage",
    "output.voltage",
    "ups.load",
    "battery.runtime",
    "ups.status",
];

fn format_real(value: f32) -> Option<String> {
    if value.is_nan() {
        None
    } else {
        Some(format!("{value:.1}"))
    }
}

fn format_int(value: f32) -> Option<String> {
    if value.is_nan() {
        None
    } else {
        Some(format!("{}", value as i64))
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Resolves one NUT variable from a data snapshot. `None` means the
/// variable is not supported or currently has no value; the server omits
/// it from listings and answers `ERR VAR-NOT-SUPPORTED` on a direct GET.
pub fn lookup(data: &UpsData, name: &str) -> Option<String> {
    match name {
        "ups.mfr" => non_empty(&data.device.manufacturer),
        "ups.model" => non_empty(&data.device.model),
        "ups.status" => non_empty(&data.power.status_flags.nut_string()),
        "ups.serial" => non_empty(&data.device.serial_number),
        "ups.firmware" => non_empty(&data.device.firmware_version),
        "battery.charge" => format_int(data.battery.level),
        "battery.voltage" => format_real(data.battery.voltage),
        "battery.voltage.nominal" => format_real(data.battery.voltage_nominal),
        // NUT reports runtime in seconds; the model keeps minutes.
        "battery.runtime" => format_int(data.battery.runtime_minutes * 60.0),
        "input.voltage" => format_real(data.power.input_voltage),
        "input.voltage.nominal" => format_real(data.power.input_voltage_nominal),
        "input.frequency" => format_real(data.power.frequency),
        "input.transfer.low" => format_real(data.power.input_transfer_low),
        "input.transfer.high" => format_real(data.power.input_transfer_high),
        "output.voltage" => format_real(data.power.output_voltage),
        "output.voltage.nominal" => format_real(data.power.output_voltage_nominal),
        "ups.load" => format_int(data.power.load_percent),
        "ups.realpower.nominal" => format_int(data.power.realpower_nominal),
        "ups.power.nominal" => format_int(data.power.apparent_power_nominal),
        _ => None,
    }
}
