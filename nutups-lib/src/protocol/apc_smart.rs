//! APC "Smart" decoder: the classic single-character serial protocol,
//! carried over the HID interface's interrupt endpoints. Needs a
//! bidirectional device; input-only interfaces are refused at detection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{DecoderContext, UpsDecoder};
use crate::error::UpsError;
use crate::model::{checked_range, clamp_percent, limits, DetectedProtocol, StatusFlags, UpsData};
use crate::transport::Transport;

// Single-character command set.
const CMD_STATUS: u8 = b'Q';
const CMD_BATTERY_LEVEL: u8 = b'f';
const CMD_INPUT_VOLTAGE: u8 = b'L';
const CMD_OUTPUT_VOLTAGE: u8 = b'O';
const CMD_LOAD: u8 = b'P';
const CMD_RUNTIME: u8 = b'j';
const CMD_FREQUENCY: u8 = b'F';
const CMD_MODEL: u8 = 0x01;
const CMD_FIRMWARE: u8 = b'V';
const CMD_SERIAL: u8 = b'n';
const CMD_SELF_TEST: u8 = b'A';

// Status byte bits.
const STATUS_ONLINE: u8 = 0x08;
const STATUS_ON_BATTERY: u8 = 0x10;
const STATUS_LOW_BATTERY: u8 = 0x01;
const STATUS_REPLACE_BATTERY: u8 = 0x40;
const STATUS_CHARGING: u8 = 0x04;

/// Smart-protocol voltages live in a narrower band than the HID path.
const SMART_VOLTAGE_MIN: f32 = 80.0;
const SMART_VOLTAGE_MAX: f32 = 300.0;

/// Device identity is re-read at most this often.
const INFO_REFRESH: Duration = Duration::from_secs(60);

/// Parses the leading numeric token of a response ("042.5", "230", "0042:").
pub(crate) fn parse_number(response: &str) -> Option<f32> {
    let token: String = response
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    token.parse().ok()
}

/// Decodes a status response: a 1-2 character hex byte, or a keyword.
/// A non-empty response matching nothing is taken as online.
pub(crate) fn parse_status(response: &str) -> Option<StatusFlags> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() <= 2 {
        if let Ok(byte) = u8::from_str_radix(trimmed, 16) {
            let mut flags = StatusFlags::empty();
            // On-battery evidence wins when the firmware asserts both.
            if byte & STATUS_ON_BATTERY != 0 {
                flags |= StatusFlags::ON_BATTERY;
            } else if byte & STATUS_ONLINE != 0 {
                flags |= StatusFlags::ONLINE;
            }
            if byte & STATUS_LOW_BATTERY != 0 {
                flags |= StatusFlags::LOW_BATTERY;
            }
            if byte & STATUS_REPLACE_BATTERY != 0 {
                flags |= StatusFlags::REPLACE_BATTERY | StatusFlags::FAULT;
            }
            if byte & STATUS_CHARGING != 0 {
                flags |= StatusFlags::CHARGING;
            }
            return Some(flags);
        }
    }

    let upper = trimmed.to_ascii_uppercase();
    let mut flags = StatusFlags::empty();
    if upper.contains("ONBATT") || upper.contains("ON BATTERY") {
        flags |= StatusFlags::ON_BATTERY;
    } else if upper.contains("ONLINE") {
        flags |= StatusFlags::ONLINE;
    }
    if upper.contains("LOWBATT") {
        flags |= StatusFlags::LOW_BATTERY;
    }
    if upper.contains("CHARGING") {
        flags |= StatusFlags::CHARGING;
    }
    if upper.contains("REPLACE") {
        flags |= StatusFlags::REPLACE_BATTERY;
    }
    if upper.contains("OVERLOAD") {
        flags |= StatusFlags::OVERLOAD;
    }
    if upper.contains("FAULT") || upper.contains("ERROR") {
        flags |= StatusFlags::FAULT;
    }

    if flags.is_empty() {
        // The device answered something; assume it is at least alive on mains.
        flags |= StatusFlags::ONLINE;
    }
    Some(flags)
}

pub struct ApcSmartDecoder {
    transport: Arc<dyn Transport>,
    context: DecoderContext,
    model: String,
    firmware: String,
    serial: String,
    last_info_read: Option<Instant>,
}

impl ApcSmartDecoder {
    pub fn new(transport: Arc<dyn Transport>, context: DecoderContext) -> Self {
        Self {
            transport,
            context,
            model: String::new(),
            firmware: String::new(),
            serial: String::new(),
            last_info_read: None,
        }
    }

    /// One command/response exchange. Reads until a CR/LF terminator or
    /// the per-transfer timeout, whichever first.
    async fn exchange(&self, command: u8) -> Option<String> {
        if let Err(e) = self
            .transport
            .interrupt_write(&[command], self.context.timeout_ms)
            .await
        {
            trace!("smart command 0x{command:02x} write failed: {e}");
            return None;
        }

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self
                .transport
                .interrupt_read(&mut buf, self.context.timeout_ms)
                .await
            {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.iter().any(|&b| b == b'\r' || b == b'\n') {
                        break;
                    }
                    if collected.len() > 256 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if collected.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&collected).trim().to_string();
        trace!("smart 0x{command:02x} -> {text:?}");
        Some(text)
    }

    async fn numeric(&self, command: u8) -> Option<f32> {
        parse_number(&self.exchange(command).await?)
    }

    async fn refresh_device_info(&mut self) {
        let due = self
            .last_info_read
            .is_none_or(|at| at.elapsed() >= INFO_REFRESH);
        if !due {
            return;
        }
        self.last_info_read = Some(Instant::now());

        if let Some(model) = self.exchange(CMD_MODEL).await {
            if !model.is_empty() {
                self.model = model;
            }
        }
        if let Some(firmware) = self.exchange(CMD_FIRMWARE).await {
            if !firmware.is_empty() {
                self.firmware = firmware;
            }
        }
        if let Some(serial) = self.exchange(CMD_SERIAL).await {
            if !serial.is_empty() {
                self.serial = serial;
            }
        }
    }
}

#[async_trait]
impl UpsDecoder for ApcSmartDecoder {
    fn name(&self) -> &'static str {
        "APC Smart Protocol"
    }

    fn protocol(&self) -> DetectedProtocol {
        DetectedProtocol::ApcSmart
    }

    async fn detect(&mut self) -> Result<bool, UpsError> {
        // The smart protocol needs the OUT endpoint.
        if self.transport.is_input_only() {
            debug!("device is input-only, smart protocol impossible");
            return Ok(false);
        }
        match self.exchange(CMD_STATUS).await {
            Some(response) => {
                debug!("smart protocol answered status probe: {response:?}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn initialize(&mut self) -> Result<bool, UpsError> {
        self.refresh_device_info().await;
        Ok(true)
    }

    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError> {
        let mut updated = false;

        self.refresh_device_info().await;
        data.device.manufacturer = "APC".to_string();
        data.device.model = self.model.clone();
        data.device.firmware_version = self.firmware.clone();
        data.device.serial_number = self.serial.clone();

        if let Some(response) = self.exchange(CMD_STATUS).await {
            if let Some(flags) = parse_status(&response) {
                data.power.status_flags = flags;
                updated = true;
            }
        }

        if let Some(level) = self.numeric(CMD_BATTERY_LEVEL).await {
            data.battery.level = clamp_percent(level);
            updated = true;
        }

        if let Some(volts) = self.numeric(CMD_INPUT_VOLTAGE).await {
            let volts = checked_range(volts, SMART_VOLTAGE_MIN, SMART_VOLTAGE_MAX);
            if !volts.is_nan() {
                data.power.input_voltage = volts;
                updated = true;
            }
        }

        if let Some(volts) = self.numeric(CMD_OUTPUT_VOLTAGE).await {
            let volts = checked_range(volts, SMART_VOLTAGE_MIN, SMART_VOLTAGE_MAX);
            if !volts.is_nan() {
                data.power.output_voltage = volts;
                updated = true;
            }
        }

        if let Some(load) = self.numeric(CMD_LOAD).await {
            data.power.load_percent = clamp_percent(load);
            updated = true;
        }

        if let Some(runtime) = self.numeric(CMD_RUNTIME).await {
            let minutes = checked_range(runtime, limits::RUNTIME_MIN, limits::RUNTIME_MAX);
            if !minutes.is_nan() {
                data.battery.runtime_minutes = minutes;
                updated = true;
            }
        }

        if let Some(hz) = self.numeric(CMD_FREQUENCY).await {
            let hz = checked_range(hz, limits::FREQUENCY_MIN, limits::FREQUENCY_MAX);
            if !hz.is_nan() {
                data.power.frequency = hz;
                updated = true;
            }
        }

        Ok(updated)
    }

    async fn start_battery_test_quick(&mut self) -> Result<bool, UpsError> {
        Ok(self.exchange(CMD_SELF_TEST).await.is_some())
    }
}
