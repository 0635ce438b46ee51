//! Static registry of USB vendor IDs known to ship UPS hardware.
//!
//! Membership means "worth probing with the decoder chain" during
//! enumeration; it is also what the generic decoder consults to step aside
//! for vendors that have a dedicated decoder.

pub const VENDOR_ID_APC: u16 = 0x051D;
pub const VENDOR_ID_CYBERPOWER: u16 = 0x0764;
pub const VENDOR_ID_MGE: u16 = 0x0463;

const KNOWN_VENDORS: &[(u16, &str)] = &[
    (VENDOR_ID_APC, "APC"),
    (VENDOR_ID_CYBERPOWER, "CyberPower"),
    (VENDOR_ID_MGE, "MGE UPS Systems / Eaton"),
    (0x06DA, "MGE / Liebert / Phoenixtec"),
    (0x09AE, "Tripp Lite"),
    (0x050D, "Belkin"),
    (0x04D8, "OpenUPS (Microchip)"),
    (0x075D, "Idowell"),
    (0x09D6, "KSTAR"),
    (0x047C, "Dell"),
    (0x04B3, "IBM"),
    (0x0592, "Powerware"),
    (0x05DD, "Delta Electronics"),
    (0x0483, "STMicroelectronics OEM"),
];

/// Human-readable vendor name for a known UPS vendor ID.
pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    KNOWN_VENDORS
        .iter()
        .find(|(vid, _)| *vid == vendor_id)
        .map(|(_, name)| *name)
}

pub fn is_known_ups_vendor(vendor_id: u16) -> bool {
    vendor_name(vendor_id).is_some()
}
