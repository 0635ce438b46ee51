//! Vendor decode layer: the decoder contract and the factory that picks
//! the best decoder for an attached device.

mod apc_hid;
mod apc_smart;
mod cyberpower_hid;
mod eaton_hid;
mod generic_hid;

pub use apc_hid::ApcHidDecoder;
pub use apc_smart::ApcSmartDecoder;
pub use cyberpower_hid::CyberPowerHidDecoder;
pub use eaton_hid::EatonHidDecoder;
pub use generic_hid::GenericHidDecoder;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::UpsError;
use crate::model::{DetectedProtocol, UpsData};
use crate::transport::{Transport, DEFAULT_TRANSFER_TIMEOUT_MS};
use crate::vendors;

/// Settings a decoder needs beyond the transport itself.
#[derive(Debug, Clone, Copy)]
pub struct DecoderContext {
    /// Per-transfer timeout handed to the transport.
    pub timeout_ms: u32,
    /// Reference mains voltage for heuristic voltage rescaling.
    pub fallback_nominal_voltage: f32,
}

impl Default for DecoderContext {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            fallback_nominal_voltage: 230.0,
        }
    }
}

impl DecoderContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            fallback_nominal_voltage: config.fallback_nominal_voltage,
        }
    }
}

/// One vendor decode protocol.
///
/// `detect` is a cheap probe that must not rely on `initialize` having
/// run. `read_data` fills whichever fields of the caller's [`UpsData`] the
/// protocol understands and reports whether anything useful was decoded.
/// Control operations default to "unsupported".
#[async_trait]
pub trait UpsDecoder: Send {
    fn name(&self) -> &'static str;

    fn protocol(&self) -> DetectedProtocol;

    /// Cheap probe: one or two short-timeout report reads.
    async fn detect(&mut self) -> Result<bool, UpsError>;

    /// One-shot setup: identity descriptors, scaling decisions.
    async fn initialize(&mut self) -> Result<bool, UpsError>;

    /// Full decode cycle into `data`. `Ok(true)` when at least one useful
    /// field was written.
    async fn read_data(&mut self, data: &mut UpsData) -> Result<bool, UpsError>;

    /// Refreshes only the countdown-timer fields; used by the fast-poll
    /// path. Default: nothing to refresh.
    async fn read_timer_data(&mut self, _data: &mut UpsData) -> Result<bool, UpsError> {
        Ok(false)
    }

    async fn beeper_enable(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn beeper_disable(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn beeper_mute(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn beeper_test(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }

    async fn start_battery_test_quick(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn start_battery_test_deep(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn stop_battery_test(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn start_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn stop_ups_test(&mut self) -> Result<bool, UpsError> {
        Ok(false)
    }

    async fn set_shutdown_delay(&mut self, _seconds: i32) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn set_start_delay(&mut self, _seconds: i32) -> Result<bool, UpsError> {
        Ok(false)
    }
    async fn set_reboot_delay(&mut self, _seconds: i32) -> Result<bool, UpsError> {
        Ok(false)
    }
}

type DecoderCtor = fn(Arc<dyn Transport>, DecoderContext) -> Box<dyn UpsDecoder>;

struct RegistryEntry {
    name: &'static str,
    /// Empty slice marks a fallback entry matched for any vendor.
    vendor_ids: &'static [u16],
    priority: u8,
    ctor: DecoderCtor,
}

/// Ordered table of decoder constructors. Built once at startup via
/// [`ProtocolRegistry::standard`]; explicit construction keeps detection
/// deterministic and testable.
pub struct ProtocolRegistry {
    entries: Vec<RegistryEntry>,
}

impl ProtocolRegistry {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn register(
        &mut self,
        name: &'static str,
        vendor_ids: &'static [u16],
        priority: u8,
        ctor: DecoderCtor,
    ) {
        self.entries.push(RegistryEntry {
            name,
            vendor_ids,
            priority,
            ctor,
        });
        // Keep the table ordered by priority so lookups walk it linearly.
        self.entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("registered decoder '{name}' (priority {priority})");
    }

    /// The standard decoder set: vendor-specific protocols first, the
    /// heuristic generic decoder as the fallback of last resort.
    pub fn standard() -> Self {
        const APC: &[u16] = &[vendors::VENDOR_ID_APC];
        const CYBERPOWER: &[u16] = &[vendors::VENDOR_ID_CYBERPOWER];
        const EATON: &[u16] = &[vendors::VENDOR_ID_MGE, 0x06DA];

        let mut registry = Self::empty();
        registry.register("APC HID Protocol", APC, 100, |t, c| {
            Box::new(ApcHidDecoder::new(t, c))
        });
        registry.register("APC Smart Protocol", APC, 50, |t, c| {
            Box::new(ApcSmartDecoder::new(t, c))
        });
        registry.register("CyberPower HID Protocol", CYBERPOWER, 100, |t, c| {
            Box::new(CyberPowerHidDecoder::new(t, c))
        });
        registry.register("Eaton HID Protocol", EATON, 100, |t, c| {
            Box::new(EatonHidDecoder::new(t, c))
        });
        registry.register("Generic HID Protocol", &[], 10, |t, c| {
            Box::new(GenericHidDecoder::new(t, c))
        });
        registry
    }

    /// Probes vendor-specific decoders for `vendor_id` by priority, then
    /// the fallbacks. Returns the first decoder whose `detect` succeeds.
    pub async fn create_for_vendor(
        &self,
        vendor_id: u16,
        transport: &Arc<dyn Transport>,
        context: DecoderContext,
    ) -> Option<Box<dyn UpsDecoder>> {
        for entry in self.entries.iter().filter(|e| e.vendor_ids.contains(&vendor_id)) {
            debug!("probing decoder '{}' for vendor 0x{vendor_id:04X}", entry.name);
            let mut decoder = (entry.ctor)(Arc::clone(transport), context);
            match decoder.detect().await {
                Ok(true) => {
                    info!("decoder '{}' detected vendor 0x{vendor_id:04X}", entry.name);
                    return Some(decoder);
                }
                Ok(false) => {}
                Err(e) => debug!("decoder '{}' probe failed: {e}", entry.name),
            }
        }

        for entry in self.entries.iter().filter(|e| e.vendor_ids.is_empty()) {
            debug!("probing fallback decoder '{}'", entry.name);
            let mut decoder = (entry.ctor)(Arc::clone(transport), context);
            match decoder.detect().await {
                Ok(true) => {
                    info!("fallback decoder '{}' accepted vendor 0x{vendor_id:04X}", entry.name);
                    return Some(decoder);
                }
                Ok(false) => {}
                Err(e) => debug!("fallback decoder '{}' probe failed: {e}", entry.name),
            }
        }

        warn!("no decoder accepted vendor 0x{vendor_id:04X}");
        None
    }

    /// Manual override: builds the first decoder whose registered name
    /// contains `needle` (case-insensitive). No detection probe is run;
    /// the operator asked for this protocol explicitly.
    pub fn create_by_name(
        &self,
        needle: &str,
        transport: &Arc<dyn Transport>,
        context: DecoderContext,
    ) -> Option<Box<dyn UpsDecoder>> {
        let needle = needle.to_ascii_lowercase();
        let entry = self
            .entries
            .iter()
            .find(|e| e.name.to_ascii_lowercase().contains(&needle))?;
        info!("decoder '{}' selected by name", entry.name);
        Some((entry.ctor)(Arc::clone(transport), context))
    }

    /// Registered decoder names, in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }
}

/// Little-endian field extraction from report payloads. Byte 0 of a
/// payload is the report ID.
pub(crate) mod wire {
    pub fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
        let bytes = data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn le_i16(data: &[u8], offset: usize) -> Option<i16> {
        le_u16(data, offset).map(|v| v as i16)
    }

    pub fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
        let bytes = data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Shared report-ID lists for control commands, used by the vendor
/// decoders and the generic fallback.
pub(crate) mod control_ids {
    /// Battery-test report IDs observed across vendors (CyberPower 0x14,
    /// APC 0x52, then looser alternatives).
    pub const BATTERY_TEST: &[u8] = &[0x14, 0x52, 0x0F, 0x1A];
    /// Panel/UPS-test report IDs, less standardized.
    pub const PANEL_TEST: &[u8] = &[0x79, 0x0C, 0x1F, 0x15];

    pub const TEST_QUICK: u8 = 1;
    pub const TEST_DEEP: u8 = 2;
    pub const TEST_ABORT: u8 = 3;
}
