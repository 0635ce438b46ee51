//! Generic HID Power Device decoder: the fallback of last resort.
//!
//! Enumerates which report IDs the device answers at all, then applies
//! loose per-report heuristics plus a generic scanner for percentages,
//! voltages and runtimes. Vendors with a dedicated decoder are skipped so
//! a flaky probe never shadows the specific protocol.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::apc_hid::PresentStatus;
use super::{control_ids, wire, DecoderContext, UpsDecoder};
use crate::error::UpsError;
use crate::model::{clamp_percent, DetectedProtocol, InputSensitivity, StatusFlags, UpsData};
use crate::transport::{ReportType, Transport};
use crate::vendors::{VENDOR_ID_APC, VENDOR_ID_CYBERPOWER};

/// The report IDs most UPS firmwares answer, probed first.
const COMMON_REPORT_IDS: &[u8] = &[0x01, 0x06, 0x0C, 0x16, 0x30, 0x31, 0x40, 0x50];

/// Wider enumeration range for the initialization sweep.
const EXTENDED_REPORT_IDS: &[u8] = &[
    0x02, 0x03, 0x04, 0x05, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12,
    0x13, 0x14, 0x15, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x20, 0x21, 0x22, 0x32, 0x33, 0x35,
    0x42, 0x43, 0x44, 0x45,
];

/// Status-byte bits of report 0x06 as loosely used by unbranded firmwares.
const GEN_STATUS_ONLINE: u8 = 1 << 0;
const GEN_STATUS_ON_BATTERY: u8 = 1 << 1;
const GEN_STATUS_LOW_BATTERY: u8 = 1 << 2;
const GEN_STATUS_CHARGING: u8 = 1 << 3;
const GEN_STATUS_REPLACE: u8 = 1 << 4;

const SCAN_VOLTAGE_MIN: f32 = 80.0;
const SCAN_VOLTAGE_MAX: f32 = 300.0;
const SCAN_RUNTIME_MAX: u16 = 999;

pub struct GenericHidDecoder {
    transport: Arc<dyn Transport>,
    context: DecoderContext,
    input_reports: BTreeSet<u8>,
    feature_reports: BTreeSet<u8>,
    report_sizes: BTreeMap<u8, usize>,
}

impl GenericHidDecoder {
    pub fn new(transport: Arc<dyn Transport>, context: DecoderContext) -> Self {
        Self {
            transport,
            context,
            input_reports: BTreeSet::new(),
            feature_reports: BTreeSet::new(),
            report_sizes: BTreeMap::new(),
        }
    }

    async fn probe(&mut self, report_id: u8) -> bool {
        let mut buf = [0u8; 64];
        if let Ok(len) = self
            .transport
            .hid_get_report(ReportType::Input, report_id, &mut buf, self.context.timeout_ms)
            .await
        {
            if len > 0 {
                self.input_reports.insert(report_id);
                self.report_sizes.insert(report_id, len);
                return true;
            }
        }
        if let Ok(len) = self
            .transport
            .hid_get_report(ReportType::Feature, report_id, &mut buf, self.context.timeout_ms)
            .await
        {
            if len > 0 {
                self.feature_reports.insert(report_id);
                self.report_sizes.insert(report_id, len);
                return true;
            }
        }
        false
    }

    async fn read_report(&self, report_id: u8) -> Option<Vec<u8>> {
        let mut buf = [0u8; 64];
        let order = if self.feature_reports.contains(&report_id)
            && !self.input_reports.contains(&report_id)
        {
            [ReportType::Feature, ReportType::Input]
        } else {
            [ReportType::Input, ReportType::Feature]
        };
        for report_type in order {
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

    fn known_report_ids(&self) -> Vec<u8> {
        self.input_reports
            .union(&self.feature_reports)
            .copied()
            .collect()
    }

    /// Payload size the device answered with for `report_id` during
    /// enumeration.
    pub fn report_size(&self, report_id: u8) -> Option<usize> {
        self.report_sizes.get(&report_id).copied()
    }

    fn parse_power_summary(data: &[u8], out: &mut UpsData) -> bool {
        let mut updated = false;
        if let Some(&raw) = data.get(1) {
            // Some firmwares report half-percent units.
            let level = if raw > 100 && raw <= 200 {
                raw as f32 / 2.0
            } else {
                raw as f32
            };
            out.battery.level = clamp_percent(level);
            updated = true;
        }
        if let Some(runtime) = wire::le_u16(data, 2) {
            if runtime > 0 && runtime <= SCAN_RUNTIME_MAX {
                out.battery.runtime_minutes = runtime as f32;
                updated = true;
            }
        }
        updated
    }

    fn parse_status_byte(data: &[u8], out: &mut UpsData) -> bool {
        let Some(&byte) = data.get(1) else {
            return false;
        };
        let mut flags = StatusFlags::empty();
        if byte & GEN_STATUS_ON_BATTERY != 0 {
            flags |= StatusFlags::ON_BATTERY;
        } else if byte & GEN_STATUS_ONLINE != 0 {
            flags |= StatusFlags::ONLINE;
        }
        if byte & GEN_STATUS_LOW_BATTERY != 0 {
            flags |= StatusFlags::LOW_BATTERY;
        }
        if byte & GEN_STATUS_CHARGING != 0 {
            flags |= StatusFlags::CHARGING;
        }
        if byte & GEN_STATUS_REPLACE != 0 {
            flags |= StatusFlags::REPLACE_BATTERY;
        }
        if flags.is_empty() {
            return false;
        }
        out.power.status_flags = flags;

        // Optional battery percentage rides in byte 2.
        if let Some(&level) = data.get(2) {
            if level > 0 && level <= 100 && out.battery.level.is_nan() {
                out.battery.level = level as f32;
            }
        }
        true
    }

    fn parse_voltage(data: &[u8]) -> Option<f32> {
        let raw = wire::le_u16(data, 1)?;
        if raw == 0xFFFF {
            return None;
        }
        let volts = if raw > 1000 {
            raw as f32 / 10.0
        } else {
            raw as f32
        };
        (SCAN_VOLTAGE_MIN..=SCAN_VOLTAGE_MAX)
            .contains(&volts)
            .then_some(volts)
    }

    fn parse_load(data: &[u8], out: &mut UpsData) -> bool {
        let Some(&raw) = data.get(1) else {
            return false;
        };
        let load = if (100..=200).contains(&raw) {
            raw as f32 / 2.0
        } else {
            raw as f32
        };
        out.power.load_percent = clamp_percent(load);
        true
    }

    fn parse_sensitivity(report_id: u8, data: &[u8], out: &mut UpsData) -> bool {
        let Some(&raw) = data.get(1) else {
            return false;
        };
        let sensitivity = if report_id == 0x1A {
            // CyberPower-style discrete values.
            match raw {
                0 => InputSensitivity::High,
                1 => InputSensitivity::Medium,
                2 => InputSensitivity::Low,
                3 => InputSensitivity::Auto,
                _ => return false,
            }
        } else {
            // APC-style banded values.
            match raw {
                0..=2 => InputSensitivity::High,
                3..=6 => InputSensitivity::Medium,
                7..=20 => InputSensitivity::Low,
                _ => return false,
            }
        };
        out.config.set_sensitivity(sensitivity);
        true
    }

    /// Unknown report: mine it for anything plausible, but only to fill
    /// fields nothing else has claimed.
    fn scan_unknown(data: &[u8], out: &mut UpsData) -> bool {
        let mut updated = false;

        if out.battery.level.is_nan() {
            if let Some(&pct) = data[1..].iter().find(|&&b| b > 0 && b <= 100) {
                out.battery.level = pct as f32;
                updated = true;
            }
        }

        if out.power.input_voltage.is_nan() {
            for offset in 1..data.len().saturating_sub(1) {
                if let Some(volts) = wire::le_u16(data, offset).and_then(|raw| {
                    let direct = raw as f32;
                    let scaled = raw as f32 / 10.0;
                    if (SCAN_VOLTAGE_MIN..=SCAN_VOLTAGE_MAX).contains(&direct) {
                        Some(direct)
                    } else if (SCAN_VOLTAGE_MIN..=SCAN_VOLTAGE_MAX).contains(&scaled) {
                        Some(scaled)
                    } else {
                        None
                    }
                }) {
                    out.power.input_voltage = volts;
                    updated = true;
                    break;
                }
            }
        }

        if out.battery.runtime_minutes.is_nan() {
            for offset in 1..data.len().saturating_sub(1) {
                if let Some(runtime) = wire::le_u16(data, offset) {
                    if runtime > 0 && runtime <= SCAN_RUNTIME_MAX {
                        out.battery.runtime_minutes = runtime as f32;
                        updated = true;
                        break;
                    }
                }
            }
        }

        updated
    }

    async fn try_command(&self, report_ids: &[u8], value: u8) -> bool {
        for &report_id in report_ids {
            let payload = [report_id, value];
            if self
                .transport
                .hid_set_report(ReportType::Feature, report_id, &payload, self.context.timeout_ms)
                .await
                .is_ok()
            {
                debug!("generic command 0x{value:02x} accepted on report 0x{report_id:02x}");
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl UpsDecoder for GenericHidDecoder {
    fn name(&self) -> &'static str {
        "Generic HID Protocol"
    }

    fn protocol(&self) -> DetectedProtocol {
        DetectedProtocol::GenericHid
    }

    async fn detect(&mut self) -> Result<bool, UpsError> {
        // Vendors with a dedicated decoder are never handled generically.
        let vid = self.transport.vendor_id();
        if vid == VENDOR_ID_APC || vid == VENDOR_ID_CYBERPOWER {
            debug!("vendor 0x{vid:04X} has a specific decoder, skipping generic");
            return Ok(false);
        }

        for &report_id in COMMON_REPORT_IDS {
            if self.probe(report_id).await {
                debug!("generic HID detected via report 0x{report_id:02x}");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn initialize(&mut self) -> Result<bool, UpsError> {
        self.input_reports.clear();
        self.feature_reports.clear();
        self.report_sizes.clear();

        for &report_id in COMMON_REPORT_IDS.iter().chain(EXTENDED_REPORT_IDS) {
            self.probe(report_id).await;
        }

        if self.input_reports.is_empty() && self.feature_reports.is_empty() {
            return Ok(false);
        }
        debug!(
            "generic HID enumerated {} input and {} feature reports",
            self.input_reports.len(),
            self.feature_reports.len()
        );
        Ok(true)
    }

    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;

        data.device.manufacturer = self.transport.manufacturer_string().unwrap_or_default();
        data.device.model = self.transport.product_string().unwrap_or_default();
        data.device.serial_number = self.transport.serial_string().unwrap_or_default();

        for report_id in self.known_report_ids() {
            let Some(report) = self.read_report(report_id).await else {
                continue;
            };
            updated |= match report_id {
                0x0C => Self::parse_power_summary(&report, data),
                0x06 => Self::parse_status_byte(&report, data),
                0x16 => match PresentStatus::parse(&report) {
                    Some(status) => {
                        data.power.status_flags = status.status_flags();
                        true
                    }
                    None => false,
                },
                0x30 => match Self::parse_voltage(&report) {
                    Some(volts) => {
                        data.power.input_voltage = volts;
                        true
                    }
                    None => false,
                },
                0x31 => match Self::parse_voltage(&report) {
                    Some(volts) => {
                        data.power.output_voltage = volts;
                        true
                    }
                    None => false,
                },
                0x50 => Self::parse_load(&report, data),
                0x1A | 0x35 => Self::parse_sensitivity(report_id, &report, data),
                _ => Self::scan_unknown(&report, data),
            };
        }

        Ok(updated)
    }

    async fn start_battery_test_quick(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(control_ids::BATTERY_TEST, control_ids::TEST_QUICK)
            .await)
    }

    async fn start_battery_test_deep(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(control_ids::BATTERY_TEST, control_ids::TEST_DEEP)
            .await)
    }

    async fn stop_battery_test(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(control_ids::BATTERY_TEST, control_ids::TEST_ABORT)
            .await)
    }

    async fn start_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(self.try_command(control_ids::PANEL_TEST, 1).await)
    }

    async fn stop_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(self.try_command(control_ids::PANEL_TEST, 0).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpsData;

    #[test]
    fn power_summary_halves_double_scale_levels() {
        let mut data = UpsData::new();
        assert!(GenericHidDecoder::parse_power_summary(
            &[0x0C, 150, 30, 0x00],
            &mut data
        ));
        assert_eq!(data.battery.level, 75.0);
        assert_eq!(data.battery.runtime_minutes, 30.0);
    }

    #[test]
    fn voltage_autoscaling() {
        assert_eq!(GenericHidDecoder::parse_voltage(&[0x30, 0xE6, 0x00]), Some(230.0));
        // 2300 raw scales down by ten.
        assert_eq!(GenericHidDecoder::parse_voltage(&[0x30, 0xFC, 0x08]), Some(230.0));
        // All-ones means unset.
        assert_eq!(GenericHidDecoder::parse_voltage(&[0x30, 0xFF, 0xFF]), None);
        // Implausible stays unset.
        assert_eq!(GenericHidDecoder::parse_voltage(&[0x30, 0x05, 0x00]), None);
    }

    #[test]
    fn unknown_report_scan_fills_only_unset_fields() {
        let mut data = UpsData::new();
        data.battery.level = 77.0;
        let updated = GenericHidDecoder::scan_unknown(&[0x42, 55, 0xE6, 0x00], &mut data);
        assert!(updated);
        // Level was already claimed; voltage was scavenged.
        assert_eq!(data.battery.level, 77.0);
        assert_eq!(data.power.input_voltage, 230.0);
    }

    #[test]
    fn status_byte_prefers_battery_evidence() {
        let mut data = UpsData::new();
        assert!(GenericHidDecoder::parse_status_byte(&[0x06, 0b0000_0011], &mut data));
        assert!(data.power.status_flags.contains(StatusFlags::ON_BATTERY));
        assert!(!data.power.status_flags.contains(StatusFlags::ONLINE));
    }
}
