//! Simulation transport: an imaginary APC Back-UPS on the bus.
//!
//! Synthesizes the same reports the APC HID decoder consumes, with
//! sinusoidal drift around realistic centers, a 20-second status cycle
//! (online+charging, on-battery, on-battery+low, fault) and a transient
//! disconnect roughly every five minutes. Useful for developing the whole
//! pipeline without hardware.

use std::f32::consts::TAU;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{ReportType, Transport};
use crate::error::UpsError;
use crate::vendors::VENDOR_ID_APC;

const SIM_PRODUCT_ID: u16 = 0x0002;

/// Full status cycle length, seconds.
const STATUS_CYCLE_S: f32 = 20.0;
/// Disconnect cadence and duration, seconds.
const DISCONNECT_PERIOD_S: f32 = 300.0;
const DISCONNECT_LENGTH_S: f32 = 5.0;

// PresentStatus bit positions (byte 1 of report 0x16).
const BIT_CHARGING: u8 = 1 << 0;
const BIT_DISCHARGING: u8 = 1 << 1;
const BIT_AC_PRESENT: u8 = 1 << 2;
const BIT_BELOW_CAPACITY: u8 = 1 << 3;
const BIT_NEED_REPLACEMENT: u8 = 1 << 6;

pub struct SimulationTransport {
    start: StdMutex<Instant>,
    initialized: StdMutex<bool>,
}

impl Default for SimulationTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationTransport {
    pub fn new() -> Self {
        Self {
            start: StdMutex::new(Instant::now()),
            initialized: StdMutex::new(false),
        }
    }

    fn elapsed_s(&self) -> f32 {
        self.start.lock().unwrap().elapsed().as_secs_f32()
    }

    fn in_disconnect_window(&self) -> bool {
        let t = self.elapsed_s();
        // Skip the first window so startup always sees a device.
        t > DISCONNECT_PERIOD_S && t % DISCONNECT_PERIOD_S < DISCONNECT_LENGTH_S
    }

    /// Slow sinusoid around `center` with amplitude `swing`.
    fn wave(&self, center: f32, swing: f32, period_s: f32) -> f32 {
        center + swing * (TAU * self.elapsed_s() / period_s).sin()
    }

    fn present_status_byte(&self) -> u8 {
        let phase = self.elapsed_s() % STATUS_CYCLE_S;
        if phase < 8.0 {
            BIT_AC_PRESENT | BIT_CHARGING
        } else if phase < 13.0 {
            BIT_DISCHARGING
        } else if phase < 17.0 {
            BIT_DISCHARGING | BIT_BELOW_CAPACITY
        } else {
            BIT_AC_PRESENT | BIT_NEED_REPLACEMENT
        }
    }

    fn synthesize(&self, report_id: u8) -> Option<Vec<u8>> {
        match report_id {
            // PowerSummary: battery percent + runtime minutes.
            0x0C => {
                let level = self.wave(85.0, 10.0, 90.0).clamp(0.0, 100.0) as u8;
                let runtime = self.wave(42.0, 15.0, 150.0).max(1.0) as u16;
                Some(vec![0x0C, level, runtime as u8, (runtime >> 8) as u8])
            }
            // PresentStatus bitmap.
            0x16 => Some(vec![0x16, self.present_status_byte(), 0x00]),
            // Input voltage, 16-bit LE volts.
            0x31 => {
                let volts = self.wave(230.0, 4.0, 60.0) as u16;
                Some(vec![0x31, volts as u8, (volts >> 8) as u8])
            }
            // Load percent.
            0x50 => {
                let load = self.wave(35.0, 18.0, 75.0).clamp(0.0, 100.0) as u8;
                Some(vec![0x50, load])
            }
            // Legacy output voltage in tenths, exercising the /10 path.
            0x09 => {
                let tenths = (self.wave(229.0, 3.0, 45.0) * 10.0) as u16;
                Some(vec![0x09, tenths as u8, (tenths >> 8) as u8])
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for SimulationTransport {
    async fn initialize(&self) -> Result<(), UpsError> {
        *self.initialized.lock().unwrap() = true;
        debug!("simulation transport initialized");
        Ok(())
    }

    async fn deinitialize(&self) -> Result<(), UpsError> {
        *self.initialized.lock().unwrap() = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.initialized.lock().unwrap() && !self.in_disconnect_window()
    }

    fn vendor_id(&self) -> u16 {
        VENDOR_ID_APC
    }

    fn product_id(&self) -> u16 {
        SIM_PRODUCT_ID
    }

    fn is_input_only(&self) -> bool {
        false
    }

    fn manufacturer_string(&self) -> Option<String> {
        None
    }

    fn product_string(&self) -> Option<String> {
        None
    }

    fn serial_string(&self) -> Option<String> {
        None
    }

    async fn hid_get_report(
        &self,
        _report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, UpsError> {
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        let Some(data) = self.synthesize(report_id) else {
            return Err(UpsError::InvalidReport(format!(
                "no simulated report 0x{report_id:02x}"
            )));
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn hid_set_report(
        &self,
        _report_type: ReportType,
        report_id: u8,
        _data: &[u8],
        _timeout_ms: u32,
    ) -> Result<(), UpsError> {
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        debug!("simulation accepted SET_REPORT 0x{report_id:02x}");
        Ok(())
    }

    async fn get_string_descriptor(
        &self,
        index: u8,
        _timeout_ms: u32,
    ) -> Result<String, UpsError> {
        Err(UpsError::InvalidReport(format!(
            "no simulated string descriptor {index}"
        )))
    }

    async fn interrupt_read(&self, _buf: &mut [u8], _timeout_ms: u32) -> Result<usize, UpsError> {
        Err(UpsError::NotSupported(
            "simulation has no byte-stream endpoint".to_string(),
        ))
    }

    async fn interrupt_write(&self, _data: &[u8], _timeout_ms: u32) -> Result<usize, UpsError> {
        Err(UpsError::NotSupported(
            "simulation has no byte-stream endpoint".to_string(),
        ))
    }
}
