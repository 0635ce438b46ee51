//! Eaton / MGE HID decoder.
//!
//! MGE-derived firmwares expose the standard power-summary and
//! present-status reports but scale their voltage registers in
//! model-specific ways. Raw readings are rescaled by trying a fixed
//! divisor set and keeping the candidate closest to the configured
//! nominal mains voltage.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::apc_hid::PresentStatus;
use super::{wire, DecoderContext, UpsDecoder};
use crate::error::UpsError;
use crate::model::{checked_range, clamp_percent, limits, DetectedProtocol, UpsData};
use crate::transport::{ReportType, Transport};

const REPORT_POWER_SUMMARY: u8 = 0x0C;
const REPORT_PRESENT_STATUS: u8 = 0x16;
const REPORT_INPUT_VOLTAGE: u8 = 0x30;
const REPORT_OUTPUT_VOLTAGE: u8 = 0x31;
const REPORT_LOAD: u8 = 0x35;

const DETECT_REPORT_IDS: &[u8] = &[0x0C, 0x16, 0x06, 0x30, 0x31];

/// Divisors tried against a raw voltage register, in preference order.
const VOLTAGE_DIVISORS: &[f32] = &[1.0, 10.0, 100.0, 2.0, 5.0];

/// A 0x31-only reading is accepted as input voltage when it sits within
/// this distance of the nominal.
const INPUT_SWITCH_BIAS_V: f32 = 8.0;

/// Nominal wattage fallback when the model string reveals nothing.
const DEFAULT_NOMINAL_WATTS: f32 = 1500.0;

/// Plausible power register band for the load-from-watts heuristic.
const SCAN_WATTS_MIN: u16 = 50;
const SCAN_WATTS_MAX: u16 = 5000;

/// Picks the divisor whose result lands in the valid voltage band and
/// closest to `nominal`. None when no candidate is plausible.
pub(crate) fn rescale_voltage(raw: u16, nominal: f32) -> Option<f32> {
    let mut best: Option<f32> = None;
    for &divisor in VOLTAGE_DIVISORS {
        let candidate = raw as f32 / divisor;
        if candidate < limits::VOLTAGE_MIN || candidate > limits::VOLTAGE_MAX {
            continue;
        }
        match best {
            Some(current) if (candidate - nominal).abs() >= (current - nominal).abs() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Trailing digits of an MGE-style model name ("Eaton 5PX 1500" -> 1500 W).
pub(crate) fn nominal_watts_from_model(model: &str) -> Option<f32> {
    let digits: String = model
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let watts: f32 = digits.parse().ok()?;
    (100.0..=20000.0).contains(&watts).then_some(watts)
}

pub struct EatonHidDecoder {
    transport: Arc<dyn Transport>,
    context: DecoderContext,
    model: String,
    manufacturer: String,
    nominal_watts: f32,
}

impl EatonHidDecoder {
    pub fn new(transport: Arc<dyn Transport>, context: DecoderContext) -> Self {
        Self {
            transport,
            context,
            model: String::new(),
            manufacturer: String::new(),
            nominal_watts: DEFAULT_NOMINAL_WATTS,
        }
    }

    async fn read_report(&self, report_id: u8) -> Option<Vec<u8>> {
        let mut buf = [0u8; 64];
        for report_type in [ReportType::Input, ReportType::Feature] {
            match self
                .transport
                .hid_get_report(report_type, report_id, &mut buf, self.context.timeout_ms)
                .await
            {
                Ok(len) if len > 0 => return Some(buf[..len].to_vec()),
                Ok(_) => {}
                Err(e) => trace!("report 0x{report_id:02x} ({report_type:?}) failed: {e}"),
            }
        }
        None
    }

    fn parse_power_summary(&self, data: &[u8], out: &mut UpsData) -> bool {
        let mut updated = false;
        if let Some(&level) = data.get(1) {
            out.battery.level = clamp_percent(level as f32);
            updated = true;
        }
        // MGE reports runtime in seconds, not minutes.
        if let Some(seconds) = wire::le_u16(data, 2) {
            let minutes = checked_range(
                (seconds / 60) as f32,
                limits::RUNTIME_MIN,
                limits::RUNTIME_MAX,
            );
            if !minutes.is_nan() {
                out.battery.runtime_minutes = minutes;
                updated = true;
            }
        }
        updated
    }

    /// Scans a report payload for a byte that reads as a percentage.
    fn scan_percent(data: &[u8]) -> Option<u8> {
        data[1..].iter().copied().find(|&b| b > 0 && b <= 100)
    }

    /// Scans a report payload for a 16-bit word that reads as watts.
    fn scan_watts(data: &[u8]) -> Option<u16> {
        (1..data.len().saturating_sub(1))
            .filter_map(|offset| wire::le_u16(data, offset))
            .find(|&w| (SCAN_WATTS_MIN..=SCAN_WATTS_MAX).contains(&w))
    }

    async fn read_load(&self, out: &mut UpsData) -> bool {
        if let Some(report) = self.read_report(REPORT_LOAD).await {
            if let Some(&load) = report.get(1) {
                if load <= 100 {
                    out.power.load_percent = load as f32;
                    return true;
                }
            }
        }

        // 0x35 unusable; look for a plausible percentage elsewhere.
        for report_id in [0x31, 0x06, 0x0C] {
            if let Some(report) = self.read_report(report_id).await {
                if let Some(percent) = Self::scan_percent(&report) {
                    debug!("load {percent}% scavenged from report 0x{report_id:02x}");
                    out.power.load_percent = percent as f32;
                    return true;
                }
            }
        }

        // Last resort: derive from a scanned power reading against the
        // nominal wattage. Heuristic; the nominal may itself be a guess.
        for report_id in [0x31, 0x30] {
            if let Some(report) = self.read_report(report_id).await {
                if let Some(watts) = Self::scan_watts(&report) {
                    let percent = clamp_percent(watts as f32 / self.nominal_watts * 100.0);
                    debug!(
                        "load {percent:.0}% derived from {watts} W vs {:.0} W nominal",
                        self.nominal_watts
                    );
                    out.power.load_percent = percent;
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl UpsDecoder for EatonHidDecoder {
    fn name(&self) -> &'static str {
        "Eaton HID Protocol"
    }

    fn protocol(&self) -> DetectedProtocol {
        DetectedProtocol::EatonHid
    }

    async fn detect(&mut self) -> Result<bool, UpsError> {
        for &report_id in DETECT_REPORT_IDS {
            if let Some(data) = self.read_report(report_id).await {
                debug!(
                    "Eaton HID detected via report 0x{report_id:02x} ({} bytes)",
                    data.len()
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn initialize(&mut self) -> Result<bool, UpsError> {
        self.manufacturer = self.transport.manufacturer_string().unwrap_or_default();
        self.model = self.transport.product_string().unwrap_or_default();
        self.nominal_watts =
            nominal_watts_from_model(&self.model).unwrap_or(DEFAULT_NOMINAL_WATTS);
        Ok(true)
    }

    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;
        let nominal = self.context.fallback_nominal_voltage;

        data.device.manufacturer = self.manufacturer.clone();
        data.device.model = self.model.clone();

        if let Some(report) = self.read_report(REPORT_POWER_SUMMARY).await {
            updated |= self.parse_power_summary(&report, data);
        }

        if let Some(report) = self.read_report(REPORT_PRESENT_STATUS).await {
            if let Some(status) = PresentStatus::parse(&report) {
                data.power.status_flags = status.status_flags();
                updated = true;
            }
        }

        let input_report = self.read_report(REPORT_INPUT_VOLTAGE).await;
        let output_report = self.read_report(REPORT_OUTPUT_VOLTAGE).await;

        if let Some(report) = &input_report {
            if let Some(raw) = wire::le_u16(report, 1) {
                if let Some(volts) = rescale_voltage(raw, nominal) {
                    data.power.input_voltage = volts;
                    updated = true;
                }
            }
        }

        if let Some(report) = &output_report {
            if let Some(raw) = wire::le_u16(report, 1) {
                if let Some(volts) = rescale_voltage(raw, nominal) {
                    data.power.output_voltage = volts;
                    updated = true;
                    // 0x30 absent: accept the output register for input too
                    // when it sits close to nominal.
                    if input_report.is_none() && (volts - nominal).abs() <= INPUT_SWITCH_BIAS_V {
                        data.power.input_voltage = volts;
                    }
                }
            }
        }

        updated |= self.read_load(data).await;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescaling_prefers_candidate_nearest_nominal() {
        // 0x0964 = 2404 raw; /10 gives 240.4 which beats /100 (24.04,
        // out of band) and /2 (1202, out of band).
        assert_eq!(rescale_voltage(2404, 230.0), Some(240.4));
        // 230 raw fits directly.
        assert_eq!(rescale_voltage(230, 230.0), Some(230.0));
        // 11500 raw: /100 = 115 and /5 = 2300 (out of band); /50 absent.
        assert_eq!(rescale_voltage(11500, 115.0), Some(115.0));
        // Nothing plausible.
        assert_eq!(rescale_voltage(2, 230.0), None);
    }

    #[test]
    fn nominal_watts_parsed_from_model_suffix() {
        assert_eq!(nominal_watts_from_model("Eaton 5PX 1500"), Some(1500.0));
        assert_eq!(nominal_watts_from_model("Ellipse ECO 650"), Some(650.0));
        assert_eq!(nominal_watts_from_model("Evolution"), None);
        // Implausible suffixes are rejected.
        assert_eq!(nominal_watts_from_model("Rack 9"), None);
    }

    #[test]
    fn percent_scan_finds_first_plausible_byte() {
        assert_eq!(EatonHidDecoder::scan_percent(&[0x31, 0x00, 42, 200]), Some(42));
        assert_eq!(EatonHidDecoder::scan_percent(&[0x31, 0xFF, 0xC8]), None);
    }
}
