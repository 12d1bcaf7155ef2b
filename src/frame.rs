//! Fixed-size USB transport frames.
//!
//! ```text
//! offset  0      1       2       3..245      245..247      247
//!       [0x55] [slot] [type]  [data:242]  [crc16 LE]    [0xAA]
//! ```
//!
//! The CRC is computed over the data region only and is *advisory*: a
//! mismatch is logged and the frame is still delivered.  The start/stop
//! markers are what the reassembly FIFO synchronises on.

use log::{debug, warn};

use crate::error::FrameError;
use crate::protocol::{
    CRC16_INIT, CRC16_POLY, FRAME_CRC_OFFSET, FRAME_DATA_LEN, FRAME_DATA_OFFSET, FRAME_LEN,
    FRAME_SLOT_OFFSET, FRAME_START, FRAME_STOP, FRAME_TYPE_OFFSET,
};

/// Content carried by a frame's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Signal = 0,
    Metrics = 1,
    Uio = 2,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Signal),
            1 => Some(PacketType::Metrics),
            2 => Some(PacketType::Uio),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub slot: u8,
    pub packet_type: PacketType,
    pub data: [u8; FRAME_DATA_LEN],
    /// `false` if the embedded CRC did not match the data region.
    pub crc_valid: bool,
}

/// CRC16-CCITT over `data`: polynomial `0x1021`, seed `0xEF4A`, MSB-first,
/// no reflection, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode one 248-byte frame.
///
/// Rejects wrong length, bad markers, and unknown packet types.  A CRC
/// mismatch is logged and reported through [`Frame::crc_valid`].
pub fn decode_frame(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() != FRAME_LEN {
        return Err(FrameError::BadLength {
            expected: FRAME_LEN,
            actual: buf.len(),
        });
    }
    if buf[0] != FRAME_START {
        return Err(FrameError::BadStartMarker(buf[0]));
    }
    if buf[FRAME_LEN - 1] != FRAME_STOP {
        return Err(FrameError::BadStopMarker(buf[FRAME_LEN - 1]));
    }

    let slot = buf[FRAME_SLOT_OFFSET];
    let type_byte = buf[FRAME_TYPE_OFFSET];
    let packet_type =
        PacketType::from_byte(type_byte).ok_or(FrameError::UnknownPacketType(type_byte))?;

    let mut data = [0u8; FRAME_DATA_LEN];
    data.copy_from_slice(&buf[FRAME_DATA_OFFSET..FRAME_CRC_OFFSET]);

    let received = u16::from_le_bytes([buf[FRAME_CRC_OFFSET], buf[FRAME_CRC_OFFSET + 1]]);
    let computed = crc16(&data);
    let crc_valid = received == computed;
    if !crc_valid {
        warn!(
            "CRC mismatch on slot {slot} {packet_type:?} frame: received 0x{received:04x}, computed 0x{computed:04x}"
        );
    }

    Ok(Frame {
        slot,
        packet_type,
        data,
        crc_valid,
    })
}

/// Encode a frame, zero-padding `data` to the 242-byte data region.
pub fn encode_frame(
    slot: u8,
    packet_type: PacketType,
    data: &[u8],
) -> Result<[u8; FRAME_LEN], FrameError> {
    if data.len() > FRAME_DATA_LEN {
        return Err(FrameError::PayloadTooLarge(data.len()));
    }
    let mut out = [0u8; FRAME_LEN];
    out[0] = FRAME_START;
    out[FRAME_SLOT_OFFSET] = slot;
    out[FRAME_TYPE_OFFSET] = packet_type as u8;
    out[FRAME_DATA_OFFSET..FRAME_DATA_OFFSET + data.len()].copy_from_slice(data);
    let crc = crc16(&out[FRAME_DATA_OFFSET..FRAME_CRC_OFFSET]).to_le_bytes();
    out[FRAME_CRC_OFFSET] = crc[0];
    out[FRAME_CRC_OFFSET + 1] = crc[1];
    out[FRAME_LEN - 1] = FRAME_STOP;
    Ok(out)
}

// ── Reassembly ───────────────────────────────────────────────────────────────

/// Consumed prefix length above which the buffer is compacted even though
/// unconsumed bytes remain.
const COMPACT_THRESHOLD: usize = 4 * FRAME_LEN;

/// Reassembles frames from a USB byte stream delivered in arbitrary chunks.
///
/// Bytes are appended to a contiguous buffer and scanned from a consumed
/// offset.  A window whose markers do not line up advances the offset by one
/// byte; a matching window is decoded and skipped as a whole.  Trailing bytes
/// shorter than a frame stay buffered for the next [`push`](Self::push).
///
/// ```
/// # use biotel_rs::frame::{encode_frame, FrameFifo, PacketType};
/// let frame = encode_frame(1, PacketType::Signal, &[1, 2, 3]).unwrap();
/// let mut fifo = FrameFifo::new();
/// assert!(fifo.push(&frame[..100]).is_empty());
/// let frames = fifo.push(&frame[100..]);
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].slot, 1);
/// ```
#[derive(Debug, Default)]
pub struct FrameFifo {
    buffer: Vec<u8>,
    offset: usize,
    consumed: u64,
    discarded: u64,
}

impl FrameFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every frame that can now be decoded, in
    /// stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut skipped = 0usize;
        while self.buffer.len() - self.offset >= FRAME_LEN {
            let window = &self.buffer[self.offset..self.offset + FRAME_LEN];
            if window[0] != FRAME_START || window[FRAME_LEN - 1] != FRAME_STOP {
                self.offset += 1;
                skipped += 1;
                continue;
            }
            match decode_frame(window) {
                Ok(frame) => frames.push(frame),
                Err(e) => debug!("dropping frame: {e}"),
            }
            self.offset += FRAME_LEN;
            self.consumed += FRAME_LEN as u64;
        }

        if skipped > 0 {
            debug!("frame resync: skipped {skipped} byte(s)");
            self.consumed += skipped as u64;
            self.discarded += skipped as u64;
        }
        self.compact();
        frames
    }

    fn compact(&mut self) {
        if self.offset == self.buffer.len() {
            self.buffer.clear();
            self.offset = 0;
        } else if self.offset >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.offset);
            self.offset = 0;
        }
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.offset
    }

    /// Total bytes consumed since creation, frames and skipped bytes alike.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Total bytes skipped while resynchronising.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.offset = 0;
    }
}
