//! APC HID decoder: Back-UPS and Smart-UPS families speaking the USB HID
//! Power Device conventions, with APC's legacy status report kept as a
//! confirmation-only source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modular_bitfield::prelude::*;
use tracing::{debug, trace, warn};

use super::{control_ids, wire, DecoderContext, UpsDecoder};
use crate::error::UpsError;
use crate::model::{checked_range, clamp_percent, limits, DetectedProtocol, StatusFlags, UpsData};
use crate::transport::{ReportType, Transport};

const REPORT_POWER_SUMMARY: u8 = 0x0C;
const REPORT_PRESENT_STATUS: u8 = 0x16;
const REPORT_APC_STATUS_FLAG: u8 = 0x06;
const REPORT_INPUT_VOLTAGE: u8 = 0x31;
const REPORT_PERCENT_LOAD: u8 = 0x50;
const REPORT_OUTPUT_VOLTAGE_LEGACY: u8 = 0x09;
const REPORT_DEVICE_CONFIG: u8 = 0x05;

/// Probe order: most informative reports first.
const DETECT_REPORT_IDS: &[u8] = &[0x0C, 0x16, 0x06, 0x01, 0x09];

/// APC battery-test report IDs, preferred ID first.
const BATTERY_TEST_IDS: &[u8] = &[0x52, 0x14];

/// Slow firmwares need a settle delay before the first read.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Legacy APCStatusFlag values (report 0x06). Anything else is logged and
/// ignored; the bitmap report stays authoritative.
const LEGACY_AC_PRESENT: u8 = 8;
const LEGACY_DISCHARGING: u8 = 16;

/// PresentStatus bitmap (report 0x16): byte 1 carries the 7-bit condition
/// set, byte 2 bit 0 carries Overload. Shared with the Eaton and generic
/// decoders, which read the same layout.
#[bitfield(bytes = 2)]
pub(crate) struct PresentStatus {
    pub charging: bool,
    pub discharging: bool,
    pub ac_present: bool,
    pub below_capacity: bool,
    pub shutdown_imminent: bool,
    pub time_limit_expired: bool,
    pub need_replacement: bool,
    #[skip]
    __: B1,
    pub overload: bool,
    #[skip]
    ___: B7,
}

impl PresentStatus {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let first = *data.get(1)?;
        let second = data.get(2).copied().unwrap_or(0);
        Some(Self::from_bytes([first, second]))
    }

    /// Normalized flag derivation. AC presence and discharging can both be
    /// asserted by quirky firmwares; discharging evidence wins.
    pub(crate) fn status_flags(&self) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        if self.discharging() || !self.ac_present() {
            flags |= StatusFlags::ON_BATTERY;
        } else {
            flags |= StatusFlags::ONLINE;
        }
        if self.charging() {
            flags |= StatusFlags::CHARGING;
        }
        if self.below_capacity() || self.shutdown_imminent() {
            flags |= StatusFlags::LOW_BATTERY;
        }
        if self.need_replacement() {
            flags |= StatusFlags::REPLACE_BATTERY | StatusFlags::FAULT;
        }
        if self.overload() {
            flags |= StatusFlags::OVERLOAD;
        }
        flags
    }
}

/// Converts APC's hex-as-decimal date encoding (0x102202 reads as
/// 10/22/02) to `MM/DD/YYYY`, applying the two-digit-year Y2K rule.
pub(crate) fn apc_date_string(raw: u32) -> Option<String> {
    fn as_decimal(byte: u8) -> u32 {
        ((byte >> 4) as u32) * 10 + (byte & 0x0F) as u32
    }

    if raw == 0 {
        return None;
    }
    let month = as_decimal(((raw >> 16) & 0xFF) as u8);
    let day = as_decimal(((raw >> 8) & 0xFF) as u8);
    let yy = as_decimal((raw & 0xFF) as u8);
    let year = if yy <= 69 { 2000 + yy } else { 1900 + yy };
    Some(format!("{month:02}/{day:02}/{year:04}"))
}

pub struct ApcHidDecoder {
    transport: Arc<dyn Transport>,
    context: DecoderContext,
    model: String,
    serial: String,
    ups_mfr_date: String,
    battery_mfr_date: String,
}

impl ApcHidDecoder {
    pub fn new(transport: Arc<dyn Transport>, context: DecoderContext) -> Self {
        Self {
            transport,
            context,
            model: String::new(),
            serial: String::new(),
            ups_mfr_date: String::new(),
            battery_mfr_date: String::new(),
        }
    }

    /// Input first (live data), Feature as the fallback.
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

    async fn set_feature_report(&self, report_id: u8, value: u8) -> bool {
        let payload = [report_id, value];
        match self
            .transport
            .hid_set_report(ReportType::Feature, report_id, &payload, self.context.timeout_ms)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("SET_REPORT 0x{report_id:02x} <- {value} failed: {e}");
                false
            }
        }
    }

    /// Walks a candidate report-ID list until one device accepts the write.
    async fn try_command(&self, report_ids: &[u8], value: u8) -> bool {
        for &report_id in report_ids {
            if self.set_feature_report(report_id, value).await {
                debug!("command 0x{value:02x} accepted on report 0x{report_id:02x}");
                return true;
            }
        }
        warn!("command 0x{value:02x} rejected on all candidate reports");
        false
    }

    fn parse_power_summary(&self, data: &[u8], out: &mut UpsData) -> bool {
        let mut updated = false;
        if let Some(&level) = data.get(1) {
            out.battery.level = clamp_percent(level as f32);
            updated = true;
        }
        if let Some(runtime) = wire::le_u16(data, 2) {
            let minutes = checked_range(
                runtime as f32,
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

    fn parse_present_status(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(status) = PresentStatus::parse(data) else {
            return false;
        };
        out.power.status_flags = status.status_flags();
        out.battery.status = if status.discharging() {
            "discharging".to_string()
        } else if status.charging() {
            "charging".to_string()
        } else {
            "resting".to_string()
        };
        true
    }

    fn parse_legacy_status(&self, data: &[u8]) {
        // Confirmation only; never overrides the bitmap report.
        match data.get(1) {
            Some(&LEGACY_AC_PRESENT) => trace!("legacy status confirms AC present"),
            Some(&LEGACY_DISCHARGING) => trace!("legacy status confirms discharging"),
            Some(&other) => debug!("legacy status byte unknown value {other}"),
            None => {}
        }
    }

    fn parse_input_voltage(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(raw) = wire::le_u16(data, 1) else {
            return false;
        };
        if raw == 0xFFFF {
            // All-ones means "no reading", not 65535 volts.
            return false;
        }
        let volts = checked_range(raw as f32, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX);
        if volts.is_nan() {
            return false;
        }
        out.power.input_voltage = volts;
        true
    }

    fn parse_load(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(&load) = data.get(1) else {
            return false;
        };
        out.power.load_percent = clamp_percent(load as f32);
        true
    }

    fn parse_output_voltage_legacy(&self, data: &[u8], out: &mut UpsData) -> bool {
        let Some(raw) = wire::le_u16(data, 1) else {
            return false;
        };
        let scaled = if raw > 1000 {
            raw as f32 / 10.0
        } else {
            raw as f32
        };
        let volts = checked_range(scaled, limits::VOLTAGE_MIN, limits::VOLTAGE_MAX);
        if volts.is_nan() {
            return false;
        }
        out.power.output_voltage = volts;
        true
    }

    async fn read_device_config(&mut self) {
        let Some(data) = self.read_report(REPORT_DEVICE_CONFIG).await else {
            return;
        };
        if let Some(raw) = wire::le_u32(&data, 8) {
            if let Some(date) = apc_date_string(raw) {
                debug!("UPS manufacture date {date}");
                self.ups_mfr_date = date;
            }
        }
        if let Some(raw) = wire::le_u32(&data, 12) {
            if let Some(date) = apc_date_string(raw) {
                debug!("battery date {date}");
                self.battery_mfr_date = date;
            }
        }
    }
}

#[async_trait]
impl UpsDecoder for ApcHidDecoder {
    fn name(&self) -> &'static str {
        "APC HID Protocol"
    }

    fn protocol(&self) -> DetectedProtocol {
        DetectedProtocol::ApcHid
    }

    async fn detect(&mut self) -> Result<bool, UpsError> {
        // Let slow firmwares settle before the first control transfer.
        tokio::time::sleep(SETTLE_DELAY).await;

        for &report_id in DETECT_REPORT_IDS {
            if let Some(data) = self.read_report(report_id).await {
                debug!(
                    "APC HID detected via report 0x{report_id:02x} ({} bytes)",
                    data.len()
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn initialize(&mut self) -> Result<bool, UpsError> {
        // Model and serial come from the device descriptor strings; when
        // those are absent the fields stay unset.
        self.model = self.transport.product_string().unwrap_or_default();
        self.serial = self.transport.serial_string().unwrap_or_default();
        self.read_device_config().await;
        Ok(true)
    }

    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;

        data.device.manufacturer = "APC".to_string();
        data.device.model = self.model.clone();
        data.device.serial_number = self.serial.clone();
        data.device.mfr_date = self.ups_mfr_date.clone();
        data.battery.mfr_date = self.battery_mfr_date.clone();

        if let Some(report) = self.read_report(REPORT_POWER_SUMMARY).await {
            updated |= self.parse_power_summary(&report, data);
        }
        if let Some(report) = self.read_report(REPORT_PRESENT_STATUS).await {
            updated |= self.parse_present_status(&report, data);
        }
        if let Some(report) = self.read_report(REPORT_APC_STATUS_FLAG).await {
            self.parse_legacy_status(&report);
        }
        if let Some(report) = self.read_report(REPORT_INPUT_VOLTAGE).await {
            updated |= self.parse_input_voltage(&report, data);
        }
        if let Some(report) = self.read_report(REPORT_PERCENT_LOAD).await {
            updated |= self.parse_load(&report, data);
        }
        if let Some(report) = self.read_report(REPORT_OUTPUT_VOLTAGE_LEGACY).await {
            updated |= self.parse_output_voltage_legacy(&report, data);
        }

        Ok(updated)
    }

    async fn start_battery_test_quick(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(BATTERY_TEST_IDS, control_ids::TEST_QUICK)
            .await)
    }

    async fn start_battery_test_deep(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(BATTERY_TEST_IDS, control_ids::TEST_DEEP)
            .await)
    }

    async fn stop_battery_test(&mut self) -> Result<bool, UpsError> {
        Ok(self
            .try_command(BATTERY_TEST_IDS, control_ids::TEST_ABORT)
            .await)
    }

    async fn start_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(self.try_command(control_ids::PANEL_TEST, 1).await)
    }

    async fn stop_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(self.try_command(control_ids::PANEL_TEST, 0).await)
    }
}
