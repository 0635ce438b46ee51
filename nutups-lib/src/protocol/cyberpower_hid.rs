//! CyberPower (CPS) HID decoder.
//!
//! CyberPower firmwares answer Feature reports for almost everything and
//! keep static identity behind USB string descriptors, some of which are
//! addressed indirectly through report payloads. Battery voltage needs a
//! one-shot sanity check against the nominal value; some firmwares report
//! 3/2 of the true figure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modular_bitfield::prelude::*;
use tracing::{debug, info, trace, warn};

use super::{wire, DecoderContext, UpsDecoder};
use crate::error::UpsError;
use crate::model::{
    checked_range, clamp_percent, limits, BeeperState, DetectedProtocol, InputSensitivity,
    StatusFlags, UpsData,
};
use crate::transport::{ReportType, Transport};

const REPORT_CAPACITY_LIMITS: u8 = 0x07;
const REPORT_BATTERY_RUNTIME: u8 = 0x08;
const REPORT_BATTERY_VOLTAGE_NOMINAL: u8 = 0x09;
const REPORT_BATTERY_VOLTAGE: u8 = 0x0A;
const REPORT_PRESENT_STATUS: u8 = 0x0B;
const REPORT_BEEPER: u8 = 0x0C;
const REPORT_INPUT_VOLTAGE_NOMINAL: u8 = 0x0E;
const REPORT_INPUT_VOLTAGE: u8 = 0x0F;
const REPORT_TRANSFER_LIMITS: u8 = 0x10;
const REPORT_OUTPUT_VOLTAGE: u8 = 0x12;
const REPORT_LOAD: u8 = 0x13;
const REPORT_BATTERY_TEST: u8 = 0x14;
const REPORT_DELAY_SHUTDOWN: u8 = 0x15;
const REPORT_DELAY_START: u8 = 0x16;
const REPORT_OVERLOAD: u8 = 0x17;
const REPORT_REALPOWER_NOMINAL: u8 = 0x18;
const REPORT_INPUT_SENSITIVITY: u8 = 0x1A;
const REPORT_FIRMWARE_INDEX: u8 = 0x1B;
const REPORT_SERIAL_INDEX: u8 = 0x02;

const DETECT_REPORT_IDS: &[u8] = &[0x08, 0x0B, 0x0F, 0x13, 0x0A];

/// USB string descriptor indices CyberPower uses for fixed identity.
const STRING_INDEX_PRODUCT: u8 = 1;
const STRING_INDEX_MANUFACTURER: u8 = 3;

const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Some firmwares report battery voltage scaled by 3/2; anything beyond
/// this ratio of nominal triggers the one-shot 2/3 correction.
const VOLTAGE_SANITY_RATIO: f32 = 1.4;

/// Defaults NUT applies when the delay reports read back as `-1`.
const DEFAULT_SHUTDOWN_DELAY_S: i32 = 60;
const DEFAULT_START_DELAY_S: i32 = 120;

/// Beeper-test choreography.
const BEEPER_TEST_AUDIBLE: Duration = Duration::from_millis(3000);
const BEEPER_TEST_GAP: Duration = Duration::from_millis(500);

/// PresentStatus byte of report 0x0B.
#[bitfield(bytes = 1)]
struct CpsStatus {
    ac_present: bool,
    charging: bool,
    discharging: bool,
    low_battery: bool,
    fully_charged: bool,
    time_limit_expired: bool,
    #[skip]
    __: B2,
}

/// Firmware strings arrive with junk bytes; keep the plausible characters
/// and trim the rest.
pub(crate) fn clean_firmware_string(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ' '))
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct CyberPowerHidDecoder {
    transport: Arc<dyn Transport>,
    context: DecoderContext,
    battery_voltage_scale: f32,
    battery_scale_checked: bool,
    manufacturer: String,
    model: String,
    serial: String,
    firmware: String,
}

impl CyberPowerHidDecoder {
    pub fn new(transport: Arc<dyn Transport>, context: DecoderContext) -> Self {
        Self {
            transport,
            context,
            battery_voltage_scale: 1.0,
            battery_scale_checked: false,
            manufacturer: String::new(),
            model: String::new(),
            serial: String::new(),
            firmware: String::new(),
        }
    }

    /// Feature first; CyberPower keeps nearly everything behind Feature
    /// reports, with Input as the fallback for live values.
    async fn read_report(&self, report_id: u8) -> Option<Vec<u8>> {
        let mut buf = [0u8; 64];
        for report_type in [ReportType::Feature, ReportType::Input] {
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

    async fn write_feature(&self, report_id: u8, payload: &[u8]) -> bool {
        match self
            .transport
            .hid_set_report(ReportType::Feature, report_id, payload, self.context.timeout_ms)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("SET_REPORT 0x{report_id:02x} failed: {e}");
                false
            }
        }
    }

    async fn write_beeper(&self, state: BeeperState) -> bool {
        let Some(value) = state.hid_value() else {
            return false;
        };
        self.write_feature(REPORT_BEEPER, &[REPORT_BEEPER, value]).await
    }

    async fn current_beeper_state(&self) -> BeeperState {
        match self.read_report(REPORT_BEEPER).await {
            Some(data) => data
                .get(1)
                .map(|&raw| BeeperState::from_hid_value(raw))
                .unwrap_or(BeeperState::Unknown),
            None => BeeperState::Unknown,
        }
    }

    /// Resolves a string-descriptor index published inside a report
    /// payload. Index 0 is never dereferenced.
    async fn string_via_report(&self, report_id: u8) -> Option<String> {
        let data = self.read_report(report_id).await?;
        let index = *data.get(1)?;
        if index == 0 {
            return None;
        }
        match self
            .transport
            .get_string_descriptor(index, self.context.timeout_ms)
            .await
        {
            Ok(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    async fn read_identity(&mut self) {
        if let Ok(s) = self
            .transport
            .get_string_descriptor(STRING_INDEX_MANUFACTURER, self.context.timeout_ms)
            .await
        {
            if !s.is_empty() {
                self.manufacturer = s;
            }
        }

        if let Ok(s) = self
            .transport
            .get_string_descriptor(STRING_INDEX_PRODUCT, self.context.timeout_ms)
            .await
        {
            // Product strings often append " FW: <version>".
            let product = match s.find(" FW:") {
                Some(pos) => s[..pos].trim().to_string(),
                None => s,
            };
            if !product.is_empty() {
                self.model = product;
            }
        }

        if let Some(serial) = self.string_via_report(REPORT_SERIAL_INDEX).await {
            self.serial = serial;
        }

        self.firmware = self.read_firmware_version().await.unwrap_or_default();
    }

    async fn read_firmware_version(&self) -> Option<String> {
        if let Some(raw) = self.string_via_report(REPORT_FIRMWARE_INDEX).await {
            let cleaned = clean_firmware_string(&raw);
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
        }

        // Descriptor path failed; mine the report itself for printable
        // bytes, then fall back to a synthesized version tag.
        let data = self.read_report(REPORT_FIRMWARE_INDEX).await?;
        let printable: String = data[1..]
            .iter()
            .take_while(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|&b| b as char)
            .collect();
        let cleaned = clean_firmware_string(&printable);
        if !cleaned.is_empty() {
            return Some(cleaned);
        }

        let mut bytes = data[1..].iter().copied().chain(std::iter::repeat(0));
        let (a, b, c) = (
            bytes.next().unwrap_or(0),
            bytes.next().unwrap_or(0),
            bytes.next().unwrap_or(0),
        );
        Some(format!("CP-{a:02X}.{b:02X}.{c:02X}"))
    }

    /// One-shot 3/2-reporting check, taken the first time both the
    /// measured and nominal voltages are known.
    fn check_battery_voltage_scaling(&mut self, measured: f32, nominal: f32) {
        if self.battery_scale_checked || nominal.is_nan() {
            return;
        }
        if measured > nominal * VOLTAGE_SANITY_RATIO {
            info!(
                "battery voltage {measured:.1} V exceeds {VOLTAGE_SANITY_RATIO} x nominal \
                 {nominal:.1} V, applying 2/3 scaling"
            );
            self.battery_voltage_scale = 2.0 / 3.0;
        }
        self.battery_scale_checked = true;
    }

    fn parse_status(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(&byte) = data.get(1) else {
            return false;
        };
        let status = CpsStatus::from_bytes([byte]);

        let mut flags = StatusFlags::empty();
        if !status.ac_present() || status.discharging() {
            flags |= StatusFlags::ON_BATTERY;
        } else {
            flags |= StatusFlags::ONLINE;
        }
        if status.charging() {
            flags |= StatusFlags::CHARGING;
        }
        if status.low_battery() || status.time_limit_expired() {
            flags |= StatusFlags::LOW_BATTERY;
        }
        out.power.status_flags = flags;

        // Charge state text comes from charging/discharging evidence only;
        // FullyCharged is deliberately not used for it.
        out.battery.status = if status.discharging() {
            "discharging".to_string()
        } else if status.charging() {
            "charging".to_string()
        } else if status.fully_charged() {
            "resting".to_string()
        } else {
            String::new()
        };
        true
    }

    fn parse_sensitivity(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(&first) = data.get(1) else {
            return false;
        };
        // Values >= 100 are garbage from the wrong byte lane; retry the
        // alternate byte before giving up.
        let raw = if first >= 100 {
            match data.get(2) {
                Some(&alt) if alt < 100 => alt,
                _ => {
                    warn!("input sensitivity unreadable (raw {first})");
                    return false;
                }
            }
        } else {
            first
        };
        let sensitivity = match raw {
            0 => InputSensitivity::High,
            1 => InputSensitivity::Medium,
            2 => InputSensitivity::Low,
            3 => InputSensitivity::Auto,
            _ => InputSensitivity::Unknown,
        };
        out.config.set_sensitivity(sensitivity);
        true
    }

    fn parse_delay(data: &[u8], default_s: i32) -> Option<i32> {
        let raw = wire::le_i16(data, 1)?;
        Some(if raw == -1 { default_s } else { raw as i32 })
    }
}

#[async_trait]
impl UpsDecoder for CyberPowerHidDecoder {
    fn name(&self) -> &'static str {
        "CyberPower HID Protocol"
    }

    fn protocol(&self) -> DetectedProtocol {
        DetectedProtocol::CyberPowerHid
    }

    async fn detect(&mut self) -> Result<bool, UpsError> {
        tokio::time::sleep(SETTLE_DELAY).await;

        for &report_id in DETECT_REPORT_IDS {
            if let Some(data) = self.read_report(report_id).await {
                debug!(
                    "CyberPower HID detected via report 0x{report_id:02x} ({} bytes)",
                    data.len()
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn initialize(&mut self) -> Result<bool, UpsError> {
        self.battery_voltage_scale = 1.0;
        self.battery_scale_checked = false;
        self.read_identity().await;
        Ok(true)
    }

    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;

        data.device.manufacturer = self.manufacturer.clone();
        data.device.model = self.model.clone();
        data.device.serial_number = self.serial.clone();
        data.device.firmware_version = self.firmware.clone();

        if let Some(report) = self.read_report(REPORT_CAPACITY_LIMITS).await {
            if let Some(&warning) = report.get(4) {
                data.battery.charge_warning = clamp_percent(warning as f32);
            }
            if let Some(&low) = report.get(5) {
                data.battery.charge_low = clamp_percent(low as f32);
            }
            if let Some(&full) = report.get(6) {
                // Informational only; never drives battery.status.
                trace!("FullChargeCapacity {full}%");
            }
        }

        if let Some(report) = self.read_report(REPORT_BATTERY_RUNTIME).await {
            if let Some(&level) = report.get(1) {
                data.battery.level = clamp_percent(level as f32);
                updated = true;
            }
            if let Some(runtime) = wire::le_u16(&report, 2) {
                let minutes =
                    checked_range(runtime as f32, limits::RUNTIME_MIN, limits::RUNTIME_MAX);
                if !minutes.is_nan() {
                    data.battery.runtime_minutes = minutes;
                }
            }
            if let Some(runtime_low) = wire::le_u16(&report, 4) {
                let minutes =
                    checked_range(runtime_low as f32, limits::RUNTIME_MIN, limits::RUNTIME_MAX);
                if !minutes.is_nan() {
                    data.battery.runtime_low_minutes = minutes;
                }
            }
        }

        // Nominal before measured: the scaling guard needs it.
        if let Some(report) = self.read_report(REPORT_BATTERY_VOLTAGE_NOMINAL).await {
            if let Some(&raw) = report.get(1) {
                data.battery.voltage_nominal = raw as f32 / 10.0;
            }
        }

        if let Some(report) = self.read_report(REPORT_BATTERY_VOLTAGE).await {
            if let Some(&raw) = report.get(1) {
                let measured = raw as f32 / 10.0;
                self.check_battery_voltage_scaling(measured, data.battery.voltage_nominal);
                data.battery.voltage = measured * self.battery_voltage_scale;
                updated = true;
            }
        }

        if let Some(report) = self.read_report(REPORT_PRESENT_STATUS).await {
            updated |= self.parse_status(&report, data);
        }

        if let Some(report) = self.read_report(REPORT_BEEPER).await {
            if let Some(&raw) = report.get(1) {
                data.config.set_beeper(BeeperState::from_hid_value(raw));
            }
        }

        if let Some(report) = self.read_report(REPORT_INPUT_VOLTAGE_NOMINAL).await {
            if let Some(&raw) = report.get(1) {
                let volts = checked_range(raw as f32, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX);
                if !volts.is_nan() {
                    data.power.input_voltage_nominal = volts;
                    data.power.output_voltage_nominal = volts;
                }
            }
        }

        if let Some(report) = self.read_report(REPORT_INPUT_VOLTAGE).await {
            if let Some(raw) = wire::le_u16(&report, 1) {
                if raw != 0xFFFF {
                    let volts =
                        checked_range(raw as f32, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX);
                    if !volts.is_nan() {
                        data.power.input_voltage = volts;
                        updated = true;
                    }
                }
            }
        }

        if let Some(report) = self.read_report(REPORT_TRANSFER_LIMITS).await {
            if let (Some(low), Some(high)) =
                (wire::le_u16(&report, 1), wire::le_u16(&report, 3))
            {
                data.power.input_transfer_low = low as f32;
                data.power.input_transfer_high = high as f32;
            }
        }

        if let Some(report) = self.read_report(REPORT_OUTPUT_VOLTAGE).await {
            if let Some(raw) = wire::le_u16(&report, 1) {
                if raw != 0xFFFF {
                    let volts =
                        checked_range(raw as f32, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX);
                    if !volts.is_nan() {
                        data.power.output_voltage = volts;
                        updated = true;
                    }
                }
            }
        }

        if let Some(report) = self.read_report(REPORT_LOAD).await {
            if let Some(&load) = report.get(1) {
                data.power.load_percent = clamp_percent(load as f32);
                updated = true;
            }
        }

        if let Some(report) = self.read_report(REPORT_DELAY_SHUTDOWN).await {
            if let Some(delay) = Self::parse_delay(&report, DEFAULT_SHUTDOWN_DELAY_S) {
                data.config.delay_shutdown = delay;
            }
        }

        if let Some(report) = self.read_report(REPORT_DELAY_START).await {
            if let Some(delay) = Self::parse_delay(&report, DEFAULT_START_DELAY_S) {
                data.config.delay_start = delay;
            }
        }

        if let Some(report) = self.read_report(REPORT_OVERLOAD).await {
            if report.get(1).is_some_and(|b| b & 0x01 != 0) {
                data.power.status_flags |= StatusFlags::OVERLOAD;
            }
        }

        if let Some(report) = self.read_report(REPORT_REALPOWER_NOMINAL).await {
            if let Some(watts) = wire::le_u16(&report, 1) {
                data.power.realpower_nominal = watts as f32;
            }
        }

        if let Some(report) = self.read_report(REPORT_INPUT_SENSITIVITY).await {
            self.parse_sensitivity(&report, data);
        }

        Ok(updated)
    }

    async fn read_timer_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;
        if let Some(report) = self.read_report(REPORT_DELAY_SHUTDOWN).await {
            if let Some(raw) = wire::le_i16(&report, 1) {
                data.test.timer_shutdown = if raw > 0 { raw as i32 } else { -1 };
                updated = true;
            }
        }
        if let Some(report) = self.read_report(REPORT_DELAY_START).await {
            if let Some(raw) = wire::le_i16(&report, 1) {
                data.test.timer_start = if raw > 0 { raw as i32 } else { -1 };
                updated = true;
            }
        }
        Ok(updated)
    }

    async fn beeper_enable(&mut self) -> Result<bool, UpsError> {
        Ok(self.write_beeper(BeeperState::Enabled).await)
    }

    async fn beeper_disable(&mut self) -> Result<bool, UpsError> {
        Ok(self.write_beeper(BeeperState::Disabled).await)
    }

    async fn beeper_mute(&mut self) -> Result<bool, UpsError> {
        Ok(self.write_beeper(BeeperState::Muted).await)
    }

    /// Chirp the beeper, then restore whatever state it was in.
    async fn beeper_test(&mut self) -> Result<bool, UpsError> {
        let original = self.current_beeper_state().await;

        if !self.write_beeper(BeeperState::Disabled).await {
            return Ok(false);
        }
        tokio::time::sleep(BEEPER_TEST_AUDIBLE).await;
        if !self.write_beeper(BeeperState::Enabled).await {
            return Ok(false);
        }
        tokio::time::sleep(BEEPER_TEST_GAP).await;

        if original != BeeperState::Unknown {
            self.write_beeper(original).await;
        }
        Ok(true)
    }

    async fn start_battery_test_quick(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .write_feature(REPORT_BATTERY_TEST, &[REPORT_BATTERY_TEST, 1])
            .await)
    }

    async fn start_battery_test_deep(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .write_feature(REPORT_BATTERY_TEST, &[REPORT_BATTERY_TEST, 2])
            .await)
    }

    async fn stop_battery_test(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .write_feature(REPORT_BATTERY_TEST, &[REPORT_BATTERY_TEST, 3])
            .await)
    }

    async fn set_shutdown_delay(&mut self, seconds: i32) -> Result<bool, UpsError> {
        let raw = (seconds.clamp(i16::MIN as i32, i16::MAX as i32) as i16).to_le_bytes();
        Ok(self
            .write_feature(REPORT_DELAY_SHUTDOWN, &[REPORT_DELAY_SHUTDOWN, raw[0], raw[1]])
            .await)
    }

    async fn set_start_delay(&mut self, seconds: i32) -> Result<bool, UpsError> {
        let raw = (seconds.clamp(i16::MIN as i32, i16::MAX as i32) as i16).to_le_bytes();
        Ok(self
            .write_feature(REPORT_DELAY_START, &[REPORT_DELAY_START, raw[0], raw[1]])
            .await)
    }
}
