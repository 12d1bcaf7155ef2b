use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::protocol::{
    MASK_FIDUCIAL_BITS, MASK_FIDUCIAL_SHIFT, MASK_QOS_BITS, MASK_QOS_SHIFT, MASK_SEGMENT_BITS,
    SLOT_COUNT,
};

// ── Slot parameters ──────────────────────────────────────────────────────────

/// Numeric type of one signal sample on the wire (always little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl ElementType {
    /// Encoded width of one sample in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
        }
    }
}

/// Per-slot decode layout, supplied by the device configuration before
/// connecting and immutable for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotParameters {
    pub channel_count: usize,
    pub sample_rate_hz: f64,
    pub element_type: ElementType,
    #[serde(default)]
    pub metric_count: usize,
}

impl SlotParameters {
    /// Bytes per signal row: mask word plus one sample per channel.
    pub fn row_width(&self) -> usize {
        2 + self.channel_count * self.element_type.width()
    }

    /// Sample period in milliseconds.
    pub fn period_ms(&self) -> f64 {
        1000.0 / self.sample_rate_hz
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(TransportError::Configuration(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        Ok(())
    }
}

/// Slot parameters for every slot of one device.  `None` marks a slot the
/// dashboard does not use; any payload arriving for it is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub slots: [Option<SlotParameters>; SLOT_COUNT],
}

impl DeviceProfile {
    /// Load a profile from a JSON file.
    ///
    /// ```json
    /// { "slots": [ { "channelCount": 2, "sampleRateHz": 100, "elementType": "i16" }, null, null, null ] }
    /// ```
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let profile: DeviceProfile = serde_json::from_str(&text)?;
        for params in profile.slots.iter().flatten() {
            params.validate()?;
        }
        Ok(profile)
    }

    /// Builder-style setter used by tests and the CLI defaults.
    pub fn with_slot(mut self, slot: u8, params: SlotParameters) -> Self {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = Some(params);
        }
        self
    }

    /// Parameters for `slot`, or a configuration error if none were supplied.
    pub fn slot(&self, slot: u8) -> Result<&SlotParameters> {
        self.slots
            .get(slot as usize)
            .ok_or(TransportError::InvalidSlot(slot))?
            .as_ref()
            .ok_or_else(|| {
                TransportError::Configuration(format!("no slot parameters for slot {slot}"))
            })
    }

    /// Indices of every configured slot.
    pub fn configured_slots(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| i as u8)
    }
}

// ── Mask word ────────────────────────────────────────────────────────────────

/// Packed per-sample auxiliary state.
///
/// | Bits   | Field |
/// |--------|-------|
/// | 5..0   | segmentation class (0 = background) |
/// | 7..6   | QoS class (0 bad, 1 poor, 2 fair, 3 good) |
/// | 15..8  | fiducial marker id (0 = none) |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MaskWord(pub u16);

impl MaskWord {
    /// Pack the three fields; out-of-range values are masked to their width.
    pub fn new(segment: u8, qos: u8, fiducial: u8) -> Self {
        MaskWord(
            (segment as u16 & MASK_SEGMENT_BITS)
                | ((qos as u16 & MASK_QOS_BITS) << MASK_QOS_SHIFT)
                | ((fiducial as u16 & MASK_FIDUCIAL_BITS) << MASK_FIDUCIAL_SHIFT),
        )
    }

    pub fn segment(self) -> u8 {
        (self.0 & MASK_SEGMENT_BITS) as u8
    }

    pub fn qos(self) -> u8 {
        ((self.0 >> MASK_QOS_SHIFT) & MASK_QOS_BITS) as u8
    }

    pub fn fiducial(self) -> u8 {
        ((self.0 >> MASK_FIDUCIAL_SHIFT) & MASK_FIDUCIAL_BITS) as u8
    }
}

// ── Rows ─────────────────────────────────────────────────────────────────────

/// One multi-channel signal sample.  The timestamp is estimated on arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRow {
    pub timestamp_ms: i64,
    pub channels: Vec<f64>,
}

/// The mask word paired with the signal row of the same index and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRow {
    pub timestamp_ms: i64,
    pub mask: MaskWord,
}

/// One set of derived metrics reported by the device for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub timestamp_ms: i64,
    pub values: Vec<f32>,
}

/// Signal and mask rows decoded from one payload.  Both vectors always have
/// the same length and are paired by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalBatch {
    pub signals: Vec<SignalRow>,
    pub masks: Vec<MaskRow>,
}

impl SignalBatch {
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

// ── UIO ──────────────────────────────────────────────────────────────────────

/// State of the device's 16 user-controllable I/O lines, one bit per line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UioState {
    pub lines: u16,
}

impl UioState {
    pub fn line(self, n: u8) -> bool {
        n < 16 && self.lines & (1 << n) != 0
    }

    pub fn with_line(self, n: u8, on: bool) -> Self {
        if n >= 16 {
            return self;
        }
        let bit = 1u16 << n;
        UioState {
            lines: if on { self.lines | bit } else { self.lines & !bit },
        }
    }
}

// ── Devices ──────────────────────────────────────────────────────────────────

/// Transport a device is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ble,
    Usb,
    Emulated,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceType::Ble => "BLE",
            InterfaceType::Usb => "USB",
            InterfaceType::Emulated => "emulated",
        })
    }
}

/// A device seen by a scan or a rediscovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Transport-specific identifier.
    /// * BLE: platform peripheral id (UUID on macOS/Windows, MAC on Linux)
    /// * USB: `"{bus}-{address}"`
    pub id: String,
    pub interface_type: InterfaceType,
    pub name: String,
}

/// Per-device connection lifecycle, identical for every transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Kind of notification a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Signals,
    Metrics,
    Uio,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_word_fields() {
        let m = MaskWord(0b1010_0101_1100_0111);
        assert_eq!(m.segment(), 0b00_0111);
        assert_eq!(m.qos(), 0b11);
        assert_eq!(m.fiducial(), 0b1010_0101);
    }

    #[test]
    fn mask_word_new_masks_each_field() {
        let m = MaskWord::new(0x7F, 6, 0x12);
        assert_eq!(m.segment(), 0x3F);
        assert_eq!(m.qos(), 2);
        assert_eq!(m.fiducial(), 0x12);
        assert_eq!(MaskWord::new(5, 3, 0).0, 0x00C5);
    }

    #[test]
    fn element_widths() {
        assert_eq!(ElementType::I8.width(), 1);
        assert_eq!(ElementType::U16.width(), 2);
        assert_eq!(ElementType::F32.width(), 4);
        let p = SlotParameters {
            channel_count: 2,
            sample_rate_hz: 100.0,
            element_type: ElementType::I16,
            metric_count: 0,
        };
        assert_eq!(p.row_width(), 6);
        assert_eq!(p.period_ms(), 10.0);
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let p = SlotParameters {
            channel_count: 1,
            sample_rate_hz: 0.0,
            element_type: ElementType::U8,
            metric_count: 0,
        };
        assert!(matches!(p.validate(), Err(TransportError::Configuration(_))));
    }

    #[test]
    fn profile_slot_lookup() {
        let profile = DeviceProfile::default().with_slot(
            2,
            SlotParameters {
                channel_count: 1,
                sample_rate_hz: 50.0,
                element_type: ElementType::U8,
                metric_count: 1,
            },
        );
        assert!(profile.slot(2).is_ok());
        assert!(matches!(profile.slot(0), Err(TransportError::Configuration(_))));
        assert!(matches!(profile.slot(9), Err(TransportError::InvalidSlot(9))));
        assert_eq!(profile.configured_slots().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn profile_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{ "slots": [ { "channelCount": 2, "sampleRateHz": 100, "elementType": "i16" }, null, null, null ] }"#,
        )
        .unwrap();
        let profile = DeviceProfile::from_json_file(&path).unwrap();
        let p = profile.slot(0).unwrap();
        assert_eq!(p.channel_count, 2);
        assert_eq!(p.element_type, ElementType::I16);
        assert_eq!(p.metric_count, 0);
    }

    #[test]
    fn uio_lines() {
        let s = UioState::default().with_line(3, true).with_line(15, true);
        assert!(s.line(3) && s.line(15) && !s.line(0));
        assert_eq!(s.with_line(3, false).lines, 0x8000);
        assert_eq!(s.with_line(16, true), s);
    }
}
