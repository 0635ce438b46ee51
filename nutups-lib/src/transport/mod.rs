//! Transport abstraction over the host USB stack.
//!
//! Decoders and the monitor speak to one [`Transport`] contract; the real
//! implementation drives a HID interface through nusb, the simulation
//! implementation synthesizes plausible reports for development without
//! hardware.

mod sim;
mod usb;

pub use sim::SimulationTransport;
pub use usb::UsbTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_enum::IntoPrimitive;

use crate::config::Config;
use crate::error::UpsError;

/// HID class-specific report types, used in the `wValue` high byte of
/// GET_REPORT / SET_REPORT control transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum ReportType {
    Input = 0x01,
    Output = 0x02,
    Feature = 0x03,
}

/// HID class request codes (USB HID 1.11 §7.2).
pub const HID_REQUEST_GET_REPORT: u8 = 0x01;
pub const HID_REQUEST_SET_REPORT: u8 = 0x09;

/// USB interface class code for HID.
pub const USB_CLASS_HID: u8 = 0x03;

/// Per-transfer timeout bounds, milliseconds.
pub const TRANSFER_TIMEOUT_MIN_MS: u32 = 100;
pub const TRANSFER_TIMEOUT_MAX_MS: u32 = 30_000;

/// Default per-transfer timeout used by the decoders.
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u32 = 1_000;

/// Clamps a caller-supplied transfer timeout into the supported window.
pub fn clamp_transfer_timeout(timeout_ms: u32) -> Duration {
    Duration::from_millis(timeout_ms.clamp(TRANSFER_TIMEOUT_MIN_MS, TRANSFER_TIMEOUT_MAX_MS) as u64)
}

/// One attached (or simulated) UPS device.
///
/// All I/O entry points are async and bounded by the supplied timeout; no
/// call blocks the caller beyond it. Implementations serialize access to
/// the underlying stack internally so the trait object can be shared via
/// `Arc` between the monitor and the active decoder.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the host stack and attempts initial enumeration. Succeeds
    /// even when no UPS is present yet; later hotplug events (or retries)
    /// complete the connection.
    async fn initialize(&self) -> Result<(), UpsError>;

    /// Graceful teardown of tasks and the device handle.
    async fn deinitialize(&self) -> Result<(), UpsError>;

    fn is_connected(&self) -> bool;

    /// USB vendor ID of the connected device, 0 if unknown.
    fn vendor_id(&self) -> u16;

    /// USB product ID of the connected device, 0 if unknown.
    fn product_id(&self) -> u16;

    /// True when the claimed HID interface exposes no OUT endpoint; such
    /// devices cannot carry byte-stream protocols.
    fn is_input_only(&self) -> bool;

    /// Manufacturer string captured from the device descriptor, if any.
    fn manufacturer_string(&self) -> Option<String>;

    /// Product string captured from the device descriptor, if any.
    fn product_string(&self) -> Option<String>;

    /// Serial number string captured from the device descriptor, if any.
    fn serial_string(&self) -> Option<String>;

    /// Issues a class-specific GET_REPORT control transfer and copies the
    /// response payload (report-ID byte included, setup packet stripped)
    /// into `buf`. Returns the payload length.
    async fn hid_get_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UpsError>;

    /// Issues a class-specific SET_REPORT control transfer. `data` carries
    /// the full report payload, report-ID byte first.
    async fn hid_set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), UpsError>;

    /// Fetches the indexed USB string descriptor, UTF-16LE decoded to
    /// UTF-8. Index 0 is the language table and is always refused.
    async fn get_string_descriptor(&self, index: u8, timeout_ms: u32)
        -> Result<String, UpsError>;

    /// Reads raw bytes from the interrupt IN endpoint (byte-stream
    /// protocols layered over HID, e.g. APC Smart).
    async fn interrupt_read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, UpsError>;

    /// Writes raw bytes to the interrupt OUT endpoint. Fails with
    /// `NotSupported` on input-only devices.
    async fn interrupt_write(&self, data: &[u8], timeout_ms: u32) -> Result<usize, UpsError>;
}

/// Builds the transport matching the configuration.
pub fn create_transport(config: &Config) -> Arc<dyn Transport> {
    if config.simulation_mode {
        Arc::new(SimulationTransport::new())
    } else {
        Arc::new(UsbTransport::new(config.usb_vendor_id, config.usb_product_id))
    }
}
