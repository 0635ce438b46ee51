//! Host-USB transport over nusb.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use nusb::hotplug::HotplugEvent;
use nusb::descriptors::TransferType;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{DeviceId, DeviceInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{
    clamp_transfer_timeout, ReportType, Transport, HID_REQUEST_GET_REPORT, HID_REQUEST_SET_REPORT,
    USB_CLASS_HID,
};
use crate::error::UpsError;
use crate::vendors;

/// US English, used for all string descriptor reads.
const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// Identity captured at claim time so accessors never touch the bus.
#[derive(Debug, Clone, Default)]
struct Identity {
    vendor_id: u16,
    product_id: u16,
    device_id: Option<DeviceId>,
    is_input_only: bool,
    manufacturer: Option<String>,
    product: Option<String>,
    serial: Option<String>,
}

/// Claimed device handle plus resolved endpoints. Guarded by one async
/// mutex; every bus operation goes through it.
struct DeviceState {
    device: nusb::Device,
    interface: nusb::Interface,
    interface_number: u8,
    reader: nusb::io::EndpointRead<nusb::transfer::Interrupt>,
    writer: Option<nusb::io::EndpointWrite<nusb::transfer::Interrupt>>,
}

struct UsbInner {
    match_vid: u16,
    match_pid: u16,
    device: TokioMutex<Option<DeviceState>>,
    connected: AtomicBool,
    identity: StdMutex<Identity>,
    watch_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Real-hardware transport: enumerates the bus, claims the first HID
/// interface of a UPS-looking device and exchanges class control transfers
/// with it. Hotplug events re-trigger enumeration and clear state on
/// device loss.
pub struct UsbTransport {
    inner: Arc<UsbInner>,
}

impl UsbTransport {
    pub fn new(match_vid: u16, match_pid: u16) -> Self {
        Self {
            inner: Arc::new(UsbInner {
                match_vid,
                match_pid,
                device: TokioMutex::new(None),
                connected: AtomicBool::new(false),
                identity: StdMutex::new(Identity::default()),
                watch_task: StdMutex::new(None),
            }),
        }
    }
}

impl UsbInner {
    /// Enumeration policy: exact configured VID/PID when set, otherwise
    /// vendor-registry membership or HID / zero-class-zero-subclass.
    fn is_ups_device(&self, info: &DeviceInfo) -> bool {
        if self.match_vid != 0 {
            return info.vendor_id() == self.match_vid
                && (self.match_pid == 0 || info.product_id() == self.match_pid);
        }
        if vendors::is_known_ups_vendor(info.vendor_id()) {
            return true;
        }
        info.class() == USB_CLASS_HID || (info.class() == 0 && info.subclass() == 0)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Scans the bus and claims the first matching device. Holding no
    /// device is not an error; the caller retries on later events.
    async fn try_connect(self: &Arc<Self>) -> Result<bool, UpsError> {
        let mut candidates = nusb::list_devices().await?;
        let Some(info) = candidates.find(|d| self.is_ups_device(d)) else {
            debug!("no UPS-like device present on the bus");
            return Ok(false);
        };

        info!(
            "found UPS candidate {:04x}:{:04x} ({})",
            info.vendor_id(),
            info.product_id(),
            vendors::vendor_name(info.vendor_id()).unwrap_or("unknown vendor")
        );

        let device = info.open().await?;

        let claimed = {
            let configuration = device
                .active_configuration()
                .map_err(|e| UpsError::Protocol(format!("no active configuration: {e}")))?;
            let mut found = None;
            'search: for group in configuration.interfaces() {
                for alt in group.alt_settings() {
                    if alt.class() != USB_CLASS_HID {
                        continue;
                    }
                    let mut ep_in = None;
                    let mut ep_out = None;
                    for endpoint in alt.endpoints() {
                        if endpoint.transfer_type() != TransferType::Interrupt {
                            continue;
                        }
                        // Bit 7 of the address carries the direction.
                        let address = endpoint.address();
                        if address & 0x80 != 0 {
                            ep_in = Some(address);
                        } else {
                            ep_out = Some(address);
                        }
                    }
                    if let Some(ep_in) = ep_in {
                        found = Some((alt.interface_number(), ep_in, ep_out));
                        break 'search;
                    }
                }
            }
            found
        };
        let Some((interface_number, ep_in, ep_out)) = claimed else {
            warn!("device has no HID interface with an interrupt IN endpoint");
            return Err(UpsError::NoHidInterface);
        };

        // The kernel's usbhid driver usually owns the interface; detaching
        // is best-effort.
        if let Err(e) = device.detach_kernel_driver(interface_number) {
            trace!("could not detach kernel driver from interface {interface_number}: {e}");
        }

        let interface = device.claim_interface(interface_number).await?;
        debug!(
            "claimed HID interface {interface_number} (IN 0x{ep_in:02x}, OUT {})",
            ep_out.map_or("none".to_string(), |e| format!("0x{e:02x}"))
        );

        let reader = interface
            .endpoint::<nusb::transfer::Interrupt, _>(ep_in)?
            .reader(64)
            .with_num_transfers(4);
        let writer = match ep_out {
            Some(addr) => Some(
                interface
                    .endpoint::<nusb::transfer::Interrupt, _>(addr)?
                    .writer(64)
                    .with_num_transfers(4),
            ),
            None => None,
        };

        {
            let mut identity = self.identity.lock().unwrap();
            *identity = Identity {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                device_id: Some(info.id()),
                is_input_only: ep_out.is_none(),
                manufacturer: info.manufacturer_string().map(str::to_string),
                product: info.product_string().map(str::to_string),
                serial: info.serial_number().map(str::to_string),
            };
        }

        let mut guard = self.device.lock().await;
        *guard = Some(DeviceState {
            device,
            interface,
            interface_number,
            reader,
            writer,
        });
        drop(guard);

        self.connected.store(true, Ordering::SeqCst);
        info!("UPS device connected");
        Ok(true)
    }

    async fn drop_device(&self) {
        let mut guard = self.device.lock().await;
        *guard = None;
        self.mark_disconnected();
    }

    /// Transfer failures that indicate the device went away tear the
    /// connection down so the monitor can re-enumerate.
    async fn note_transfer_error(&self, error: &UpsError) {
        if matches!(
            error,
            UpsError::Transfer(nusb::transfer::TransferError::Disconnected)
        ) {
            warn!("device disappeared mid-transfer");
            self.drop_device().await;
        }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn initialize(&self) -> Result<(), UpsError> {
        // Initial enumeration; absence of a device is not fatal.
        if let Err(e) = self.inner.try_connect().await {
            warn!("initial USB enumeration failed: {e}");
        }

        // Event pump: connect on arrival, mark gone on departure.
        let inner = Arc::clone(&self.inner);
        let watch = nusb::watch_devices()?;
        let task = tokio::spawn(async move {
            futures::pin_mut!(watch);
            while let Some(event) = watch.next().await {
                match event {
                    HotplugEvent::Connected(info) => {
                        if !inner.connected.load(Ordering::SeqCst) && inner.is_ups_device(&info) {
                            debug!(
                                "hotplug arrival {:04x}:{:04x}",
                                info.vendor_id(),
                                info.product_id()
                            );
                            if let Err(e) = inner.try_connect().await {
                                warn!("hotplug connect failed: {e}");
                            }
                        }
                    }
                    HotplugEvent::Disconnected(id) => {
                        let ours = inner.identity.lock().unwrap().device_id == Some(id);
                        if ours {
                            info!("UPS device disconnected");
                            inner.drop_device().await;
                        }
                    }
                }
            }
        });
        *self.inner.watch_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn deinitialize(&self) -> Result<(), UpsError> {
        if let Some(task) = self.inner.watch_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.drop_device().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.inner.identity.lock().unwrap().vendor_id
    }

    fn product_id(&self) -> u16 {
        self.inner.identity.lock().unwrap().product_id
    }

    fn is_input_only(&self) -> bool {
        self.inner.identity.lock().unwrap().is_input_only
    }

    fn manufacturer_string(&self) -> Option<String> {
        self.inner.identity.lock().unwrap().manufacturer.clone()
    }

    fn product_string(&self) -> Option<String> {
        self.inner.identity.lock().unwrap().product.clone()
    }

    fn serial_string(&self) -> Option<String> {
        self.inner.identity.lock().unwrap().serial.clone()
    }

    async fn hid_get_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UpsError> {
        let deadline = clamp_transfer_timeout(timeout_ms);
        let mut guard = self.inner.device.lock().await;
        let state = guard.as_mut().ok_or(UpsError::NotConnected)?;

        let request = ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: HID_REQUEST_GET_REPORT,
            value: ((u8::from(report_type) as u16) << 8) | report_id as u16,
            index: state.interface_number as u16,
            length: buf.len() as u16,
        };
        let result: Result<Vec<u8>, UpsError> =
            match timeout(deadline, state.interface.control_in(request, deadline)).await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(e)) => Err(e.into()),
                Err(elapsed) => Err(elapsed.into()),
            };
        drop(guard);

        match result {
            Ok(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                trace!("GET_REPORT {report_type:?} 0x{report_id:02x}: {len} bytes");
                Ok(len)
            }
            Err(e) => {
                self.inner.note_transfer_error(&e).await;
                Err(e)
            }
        }
    }

    async fn hid_set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), UpsError> {
        let deadline = clamp_transfer_timeout(timeout_ms);
        let mut guard = self.inner.device.lock().await;
        let state = guard.as_mut().ok_or(UpsError::NotConnected)?;

        let request = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: HID_REQUEST_SET_REPORT,
            value: ((u8::from(report_type) as u16) << 8) | report_id as u16,
            index: state.interface_number as u16,
            data,
        };
        let result: Result<(), UpsError> =
            match timeout(deadline, state.interface.control_out(request, deadline)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(elapsed) => Err(elapsed.into()),
            };
        drop(guard);

        if let Err(ref e) = result {
            self.inner.note_transfer_error(e).await;
        } else {
            trace!("SET_REPORT {report_type:?} 0x{report_id:02x}: {} bytes", data.len());
        }
        result
    }

    async fn get_string_descriptor(
        &self,
        index: u8,
        timeout_ms: u32,
    ) -> Result<String, UpsError> {
        if index == 0 {
            // Index 0 is the language-ID table, never device identity.
            return Err(UpsError::InvalidReport(
                "string descriptor index 0".to_string(),
            ));
        }
        let deadline = clamp_transfer_timeout(timeout_ms);
        let guard = self.inner.device.lock().await;
        let state = guard.as_ref().ok_or(UpsError::NotConnected)?;
        let desc_index = std::num::NonZeroU8::new(index).expect("index == 0 checked above");
        let value = timeout(
            deadline,
            state
                .device
                .get_string_descriptor(desc_index, LANGUAGE_ID_EN_US, deadline),
        )
        .await?
        .map_err(|e| UpsError::Protocol(e.to_string()))?;
        Ok(value.trim().to_string())
    }

    async fn interrupt_read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, UpsError> {
        let deadline = clamp_transfer_timeout(timeout_ms);
        let mut guard = self.inner.device.lock().await;
        let state = guard.as_mut().ok_or(UpsError::NotConnected)?;
        let n = timeout(deadline, state.reader.read(buf)).await??;
        Ok(n)
    }

    async fn interrupt_write(&self, data: &[u8], timeout_ms: u32) -> Result<usize, UpsError> {
        let deadline = clamp_transfer_timeout(timeout_ms);
        let mut guard = self.inner.device.lock().await;
        let state = guard.as_mut().ok_or(UpsError::NotConnected)?;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| UpsError::NotSupported("device is input-only".to_string()))?;
        timeout(deadline, writer.write_all(data)).await??;
        timeout(deadline, writer.flush_end_async()).await??;
        Ok(data.len())
    }
}
