use std::io;
use thiserror::Error;

/// The primary error type for the `nutups` library.
#[derive(Error, Debug)]
pub enum UpsError {
    #[error("USB UPS device not found")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout during USB operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Operation not supported by this device: {0}")]
    NotSupported(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid report: {0}")]
    InvalidReport(String),

    #[error("No HID interface found on device")]
    NoHidInterface,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
