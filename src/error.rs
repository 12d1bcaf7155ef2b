use thiserror::Error;

use crate::types::InterfaceType;

/// Rejections raised by the USB frame codec.
///
/// None of these cross the decode boundary of a live stream: the reassembly
/// FIFO logs them and moves on to the next candidate frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("bad start marker 0x{0:02x}")]
    BadStartMarker(u8),

    #[error("bad stop marker 0x{0:02x}")]
    BadStopMarker(u8),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("frame data is {0} bytes, limit is 242")]
    PayloadTooLarge(usize),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("slot {0} is out of range")]
    InvalidSlot(u8),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("device {0} is already connected or connecting")]
    AlreadyConnected(String),

    #[error("device {0} was never discovered")]
    DeviceNotFound(String),

    #[error("a {0} scan is already running")]
    ScanInProgress(InterfaceType),

    #[error("no handler available for {0} devices")]
    HandlerUnavailable(InterfaceType),

    #[error("no device interfaces are available on this platform")]
    NoInterfacesAvailable,

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("{0} timed out")]
    Timeout(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("USB transfer error: {0}")]
    UsbTransfer(#[from] nusb::transfer::TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
