//! Wire constants shared by the USB frame codec, the BLE GATT layout, and the
//! payload decoders.
//!
//! BLE UUIDs live in the vendor namespace
//! `b10eXXXX-5a7e-4c0d-9e1f-0b5e55ed7e1e`.

use std::time::Duration;

use uuid::Uuid;

// ── Device topology ──────────────────────────────────────────────────────────

/// Number of independent acquisition slots exposed by one device.
pub const SLOT_COUNT: usize = 4;

// ── USB frame ────────────────────────────────────────────────────────────────

/// Total length of one USB transport frame in bytes.
///
/// ```text
/// [0x55][slot:1][type:1][data:242][crc16:2 LE][0xAA]
/// ```
pub const FRAME_LEN: usize = 248;

/// Length of the data region carried by every frame (zero-padded).
pub const FRAME_DATA_LEN: usize = 242;

/// Start-of-frame marker.
pub const FRAME_START: u8 = 0x55;

/// End-of-frame marker.
pub const FRAME_STOP: u8 = 0xAA;

/// Byte offset of the slot index inside a frame.
pub const FRAME_SLOT_OFFSET: usize = 1;

/// Byte offset of the packet type inside a frame.
pub const FRAME_TYPE_OFFSET: usize = 2;

/// Byte offset of the data region inside a frame.
pub const FRAME_DATA_OFFSET: usize = 3;

/// Byte offset of the little-endian CRC16 inside a frame.
pub const FRAME_CRC_OFFSET: usize = FRAME_DATA_OFFSET + FRAME_DATA_LEN;

/// CRC16-CCITT generator polynomial (MSB-first, no reflection).
pub const CRC16_POLY: u16 = 0x1021;

/// Firmware CRC seed.  Not the usual `0xFFFF`.
pub const CRC16_INIT: u16 = 0xEF4A;

/// `bInterfaceClass` of the vendor-specific interface carrying telemetry.
pub const USB_VENDOR_INTERFACE_CLASS: u8 = 0xFF;

/// Fixed interval between two bulk-in polls of a connected USB device.
pub const USB_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Value reported by the USB transport for strength and battery, which do
/// not apply to a wired link.
pub const USB_SENTINEL_LEVEL: u8 = 100;

// ── Payload layout ───────────────────────────────────────────────────────────

/// Size of the little-endian byte-length prefix on signal/metric payloads.
pub const PAYLOAD_LEN_PREFIX: usize = 2;

/// Size of the mask word leading every signal row.
pub const MASK_WORD_LEN: usize = 2;

/// Size of one IEEE-754 metric value.
pub const METRIC_VALUE_LEN: usize = 4;

/// Size of the encoded UIO state.
pub const UIO_STATE_LEN: usize = 2;

// ── Mask word bit layout ─────────────────────────────────────────────────────

/// Bits [5:0]: segmentation class.
pub const MASK_SEGMENT_BITS: u16 = 0x003F;

/// Bits [7:6]: QoS class.
pub const MASK_QOS_SHIFT: u16 = 6;
pub const MASK_QOS_BITS: u16 = 0x0003;

/// Bits [15:8]: fiducial marker id.
pub const MASK_FIDUCIAL_SHIFT: u16 = 8;
pub const MASK_FIDUCIAL_BITS: u16 = 0x00FF;

// ── BLE GATT layout ──────────────────────────────────────────────────────────

/// Primary service advertised by the device.
pub const TELEMETRY_SERVICE_UUID: Uuid = Uuid::from_u128(0xb10e0001_5a7e_4c0d_9e1f_0b5e55ed7e1e);

/// Signal + mask notifications, indexed by slot.
///
/// | Slot | UUID suffix |
/// |------|-------------|
/// | 0    | 0010        |
/// | 1    | 0011        |
/// | 2    | 0012        |
/// | 3    | 0013        |
pub const SIGNAL_CHARACTERISTICS: [Uuid; SLOT_COUNT] = [
    Uuid::from_u128(0xb10e0010_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0011_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0012_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0013_5a7e_4c0d_9e1f_0b5e55ed7e1e),
];

/// Metric notifications, indexed by slot.
pub const METRIC_CHARACTERISTICS: [Uuid; SLOT_COUNT] = [
    Uuid::from_u128(0xb10e0020_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0021_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0022_5a7e_4c0d_9e1f_0b5e55ed7e1e),
    Uuid::from_u128(0xb10e0023_5a7e_4c0d_9e1f_0b5e55ed7e1e),
];

/// UIO control characteristic: read, write, notify.
pub const UIO_CHARACTERISTIC: Uuid = Uuid::from_u128(0xb10e0030_5a7e_4c0d_9e1f_0b5e55ed7e1e);

/// Standard Bluetooth SIG Battery Level characteristic (`0x2A19`).
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Delay between BLE link-up and service discovery.  Some stacks report the
/// connection before their GATT cache is ready and then fail discovery with
/// "Unlikely error".
pub const BLE_SETTLE_DELAY: Duration = Duration::from_millis(600);

/// Lower bound of the RSSI magnitude mapped to full strength.
pub const RSSI_BEST_DBM: i16 = 40;

/// Upper bound of the RSSI magnitude mapped to zero strength.
pub const RSSI_WORST_DBM: i16 = 100;

/// Error text fragments that some BLE stacks return for writes that actually
/// went through.
pub const BENIGN_WRITE_ERRORS: [&str; 2] = ["unlikely error", "unknown reason"];

/// Map a raw RSSI in dBm to a 0–100 strength score.
///
/// `100 × (1 − (clamp(|rssi|, 40, 100) − 40) / 60)`
///
/// ```
/// # use biotel_rs::protocol::rssi_to_strength;
/// assert_eq!(rssi_to_strength(-40), 100);
/// assert_eq!(rssi_to_strength(-70), 50);
/// assert_eq!(rssi_to_strength(-120), 0);
/// ```
pub fn rssi_to_strength(rssi: i16) -> u8 {
    let magnitude = rssi.saturating_abs().clamp(RSSI_BEST_DBM, RSSI_WORST_DBM);
    let span = (RSSI_WORST_DBM - RSSI_BEST_DBM) as f64;
    let score = 100.0 * (1.0 - (magnitude - RSSI_BEST_DBM) as f64 / span);
    score.round() as u8
}

/// `true` if a BLE write error message matches a known benign pattern.
///
/// ```
/// # use biotel_rs::protocol::is_benign_write_error;
/// assert!(is_benign_write_error("Operation failed: Unlikely error"));
/// assert!(!is_benign_write_error("Not connected"));
/// ```
pub fn is_benign_write_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    BENIGN_WRITE_ERRORS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_adds_up() {
        assert_eq!(FRAME_CRC_OFFSET + 2 + 1, FRAME_LEN);
    }

    #[test]
    fn strength_is_monotonic_in_rssi() {
        let mut last = u8::MAX;
        for rssi in (-110..=-30).rev() {
            let s = rssi_to_strength(rssi);
            assert!(s <= last, "rssi {rssi} gave {s} after {last}");
            last = s;
        }
        assert_eq!(rssi_to_strength(0), 100);
        assert_eq!(rssi_to_strength(-100), 0);
    }

    #[test]
    fn benign_write_errors_are_case_insensitive() {
        assert!(is_benign_write_error("The attribute write failed for an UNKNOWN REASON"));
        assert!(!is_benign_write_error("Permission denied"));
    }

    #[test]
    fn slot_characteristics_are_distinct() {
        for (i, a) in SIGNAL_CHARACTERISTICS.iter().enumerate() {
            assert!(!METRIC_CHARACTERISTICS.contains(a));
            assert!(!SIGNAL_CHARACTERISTICS[i + 1..].contains(a));
        }
    }
}
