//! Binary decoders (and matching encoders) for signal, metric, and UIO payloads.
//!
//! All functions here are pure: the caller supplies the wall-clock reference
//! used for timestamps.  They are shared by every transport, since a USB frame's
//! data region and a BLE notification value use the same payload layout:
//!
//! | Payload | Layout |
//! |---|---|
//! | signal  | `[byteLen:2 LE]` then rows of `[mask:2 LE][sample × channelCount]` |
//! | metrics | `[byteLen:2 LE]` then `[f32 LE]*` |
//! | UIO     | `[lines:2 LE]` |
//!
//! A declared length that is not a whole number of rows is truncated to the
//! last complete row.  Decoding never fails on malformed lengths; only missing
//! or invalid slot parameters are errors.

use log::{debug, warn};

use crate::error::{Result, TransportError};
use crate::protocol::{MASK_WORD_LEN, METRIC_VALUE_LEN, PAYLOAD_LEN_PREFIX, UIO_STATE_LEN};
use crate::types::{
    ElementType, MaskRow, MaskWord, MetricRow, SignalBatch, SignalRow, SlotParameters, UioState,
};

// ── Samples ──────────────────────────────────────────────────────────────────

/// Read one little-endian sample of type `ty` from the front of `b`.
///
/// # Panics
/// Panics if `b` is shorter than `ty.width()`.
fn read_sample(ty: ElementType, b: &[u8]) -> f64 {
    match ty {
        ElementType::U8 => b[0] as f64,
        ElementType::I8 => b[0] as i8 as f64,
        ElementType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
        ElementType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
        ElementType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        ElementType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        ElementType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
    }
}

/// Append `v` as a little-endian sample of type `ty`.  Integer types saturate.
fn write_sample(ty: ElementType, v: f64, out: &mut Vec<u8>) {
    match ty {
        ElementType::U8 => out.push(v as u8),
        ElementType::I8 => out.push(v as i8 as u8),
        ElementType::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
        ElementType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
        ElementType::U32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
        ElementType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
        ElementType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
    }
}

/// The body following the length prefix, clipped to the declared length.
fn declared_body(payload: &[u8]) -> &[u8] {
    if payload.len() < PAYLOAD_LEN_PREFIX {
        return &[];
    }
    let declared = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let body = &payload[PAYLOAD_LEN_PREFIX..];
    if declared > body.len() {
        debug!(
            "payload declares {declared} bytes but carries {}; clipping",
            body.len()
        );
    }
    &body[..declared.min(body.len())]
}

// ── Signals ──────────────────────────────────────────────────────────────────

/// Number of whole signal rows in `payload` for the given slot layout.
pub fn signal_row_count(payload: &[u8], params: &SlotParameters) -> usize {
    declared_body(payload).len() / params.row_width()
}

/// Decode a signal payload, back-filling row timestamps from `now_ms`.
///
/// Row `i` of `n` is stamped `now_ms − (n − i) × 1000 / sampleRateHz`, so rows
/// are oldest-first and evenly spaced.
pub fn decode_signal_payload(
    payload: &[u8],
    params: &SlotParameters,
    now_ms: i64,
) -> Result<SignalBatch> {
    decode_signal_payload_at(payload, params, now_ms as f64)
}

/// Like [`decode_signal_payload`] but with a fractional end reference, as
/// produced by [`BatchClock::batch_end`].
pub fn decode_signal_payload_at(
    payload: &[u8],
    params: &SlotParameters,
    end_ms: f64,
) -> Result<SignalBatch> {
    params.validate()?;

    let body = declared_body(payload);
    let width = params.row_width();
    let rows = body.len() / width;
    let remainder = body.len() % width;
    if remainder != 0 {
        debug!(
            "signal payload of {} bytes is not a whole number of {width}-byte rows; dropping {remainder} byte(s)",
            body.len()
        );
    }

    let period = params.period_ms();
    let sample_width = params.element_type.width();
    let mut batch = SignalBatch {
        signals: Vec::with_capacity(rows),
        masks: Vec::with_capacity(rows),
    };

    for (i, row) in body.chunks_exact(width).enumerate() {
        let timestamp_ms = (end_ms - (rows - i) as f64 * period).round() as i64;
        let mask = MaskWord(u16::from_le_bytes([row[0], row[1]]));
        let channels = row[MASK_WORD_LEN..]
            .chunks_exact(sample_width)
            .map(|b| read_sample(params.element_type, b))
            .collect();
        batch.signals.push(SignalRow {
            timestamp_ms,
            channels,
        });
        batch.masks.push(MaskRow { timestamp_ms, mask });
    }

    Ok(batch)
}

/// Encode `(mask, samples)` rows into a signal payload.
///
/// Every row is expected to carry the same number of samples.  The length
/// prefix is 16 bits, so a body is capped at 65535 bytes and anything past
/// that is dropped.
///
/// ```
/// # use biotel_rs::parse::encode_signal_payload;
/// # use biotel_rs::types::{ElementType, MaskWord};
/// let payload = encode_signal_payload(&[(MaskWord(0x00C1), vec![-2.0])], ElementType::I16);
/// assert_eq!(payload, vec![4, 0, 0xC1, 0x00, 0xFE, 0xFF]);
/// ```
pub fn encode_signal_payload(rows: &[(MaskWord, Vec<f64>)], element_type: ElementType) -> Vec<u8> {
    let mut body = Vec::new();
    for (mask, samples) in rows {
        body.extend_from_slice(&mask.0.to_le_bytes());
        for &v in samples {
            write_sample(element_type, v, &mut body);
        }
    }
    with_length_prefix(body)
}

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Decode a metrics payload into a single row stamped with `now_ms`.
///
/// If `metric_count` is non-zero, extra values beyond it are dropped.
/// Returns an empty vector when the payload carries no whole value.
pub fn decode_metrics_payload(payload: &[u8], metric_count: usize, now_ms: i64) -> Vec<MetricRow> {
    let body = declared_body(payload);
    let mut values: Vec<f32> = body
        .chunks_exact(METRIC_VALUE_LEN)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if body.len() % METRIC_VALUE_LEN != 0 {
        debug!(
            "metrics payload of {} bytes has a partial value; dropping it",
            body.len()
        );
    }
    if metric_count > 0 && values.len() > metric_count {
        values.truncate(metric_count);
    }
    if values.is_empty() {
        return Vec::new();
    }
    vec![MetricRow {
        timestamp_ms: now_ms,
        values,
    }]
}

/// Encode metric values into a metrics payload.  At most
/// [`MAX_PAYLOAD_BODY`]` / 4` values fit; the rest are dropped.
pub fn encode_metrics_payload(values: &[f32]) -> Vec<u8> {
    let body = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    with_length_prefix(body)
}

/// Largest body a 16-bit length prefix can describe.
pub const MAX_PAYLOAD_BODY: usize = u16::MAX as usize;

fn with_length_prefix(mut body: Vec<u8>) -> Vec<u8> {
    if body.len() > MAX_PAYLOAD_BODY {
        warn!(
            "payload body of {} bytes exceeds the length prefix; truncating to {MAX_PAYLOAD_BODY}",
            body.len()
        );
        body.truncate(MAX_PAYLOAD_BODY);
    }
    let mut out = Vec::with_capacity(PAYLOAD_LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend(body);
    out
}

// ── UIO ──────────────────────────────────────────────────────────────────────

/// Decode a UIO state.  Returns `None` if fewer than 2 bytes are present.
pub fn decode_uio_state(data: &[u8]) -> Option<UioState> {
    if data.len() < UIO_STATE_LEN {
        return None;
    }
    Some(UioState {
        lines: u16::from_le_bytes([data[0], data[1]]),
    })
}

pub fn encode_uio_state(state: UioState) -> [u8; UIO_STATE_LEN] {
    state.lines.to_le_bytes()
}

// ── Batch timestamping ───────────────────────────────────────────────────────

/// How far a continued batch may drift from wall clock before re-anchoring.
pub const CLOCK_DRIFT_TOLERANCE_MS: f64 = 500.0;

/// Chooses the end reference for each decoded signal batch of one slot.
///
/// Devices do not transmit timestamps.  Back-filling every batch from its own
/// arrival time lets consecutive batches overlap or leave gaps whenever
/// delivery is bursty (several USB frames read in one poll, BLE connection
/// events bunching notifications).  The clock instead continues each batch
/// directly after the previous one, `prev_end + n × period`, as long as that
/// stays within [`CLOCK_DRIFT_TOLERANCE_MS`] of the arrival time.  Otherwise
/// (first batch, stream gap, device clock drift) it re-anchors to arrival.
///
/// One clock per slot per connection; [`reset`](Self::reset) on reconnect.
#[derive(Debug, Default, Clone)]
pub struct BatchClock {
    last_end: Option<f64>,
}

impl BatchClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// End reference for a batch of `rows` rows arriving at `now_ms`.
    pub fn batch_end(&mut self, now_ms: i64, rows: usize, period_ms: f64) -> f64 {
        let now = now_ms as f64;
        let end = match self.last_end {
            Some(prev) => {
                let predicted = prev + rows as f64 * period_ms;
                if (predicted - now).abs() <= CLOCK_DRIFT_TOLERANCE_MS {
                    predicted
                } else {
                    debug!(
                        "batch clock re-anchored: predicted {predicted:.1} vs arrival {now:.1}"
                    );
                    now
                }
            }
            None => now,
        };
        self.last_end = Some(end);
        end
    }

    pub fn reset(&mut self) {
        self.last_end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(channels: usize, rate: f64, ty: ElementType) -> SlotParameters {
        SlotParameters {
            channel_count: channels,
            sample_rate_hz: rate,
            element_type: ty,
            metric_count: 0,
        }
    }

    #[test]
    fn signal_rows_are_decoded_and_back_filled() {
        let p = params(2, 100.0, ElementType::I16);
        let rows: Vec<(MaskWord, Vec<f64>)> = (0..5)
            .map(|i| (MaskWord::new(i as u8, 3, 0), vec![i as f64, -(i as f64) * 100.0]))
            .collect();
        let payload = encode_signal_payload(&rows, ElementType::I16);
        assert_eq!(payload.len(), 2 + 5 * 6);

        let batch = decode_signal_payload(&payload, &p, 10_000).unwrap();
        assert_eq!(batch.len(), 5);
        let ts: Vec<i64> = batch.signals.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(ts, vec![9_950, 9_960, 9_970, 9_980, 9_990]);
        assert_eq!(batch.signals[3].channels, vec![3.0, -300.0]);
        assert_eq!(batch.masks[4].mask.segment(), 4);
        assert_eq!(batch.masks[4].timestamp_ms, 9_990);
    }

    #[test]
    fn partial_row_is_truncated() {
        // 3 × u8 channels + mask = 5-byte rows; 52 bytes is 10.4 rows.
        let p = params(3, 50.0, ElementType::U8);
        let mut payload = vec![52, 0];
        payload.extend(std::iter::repeat(0x11).take(52));
        let batch = decode_signal_payload(&payload, &p, 0).unwrap();
        assert_eq!(batch.signals.len(), 10);
        assert_eq!(batch.masks.len(), 10);
        assert_eq!(signal_row_count(&payload, &p), 10);
    }

    #[test]
    fn declared_length_bounds_the_body() {
        let p = params(1, 10.0, ElementType::U8);
        // Declares 6 bytes (two 3-byte rows) inside a zero-padded region.
        let mut payload = vec![6, 0, 1, 0, 7, 2, 0, 8];
        payload.resize(242, 0);
        let batch = decode_signal_payload(&payload, &p, 1_000).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.signals[1].channels, vec![8.0]);

        // Declared length past the end is clipped to what is present.
        let short = vec![200, 0, 1, 0, 7];
        assert_eq!(decode_signal_payload(&short, &p, 0).unwrap().len(), 1);
        assert!(decode_signal_payload(&[1], &p, 0).unwrap().is_empty());
    }

    #[test]
    fn every_element_type_decodes() {
        for (ty, v) in [
            (ElementType::U8, 200.0),
            (ElementType::I8, -100.0),
            (ElementType::U16, 60_000.0),
            (ElementType::I16, -30_000.0),
            (ElementType::U32, 4_000_000_000.0),
            (ElementType::I32, -2_000_000_000.0),
            (ElementType::F32, 1.5),
        ] {
            let payload = encode_signal_payload(&[(MaskWord(0), vec![v])], ty);
            let batch = decode_signal_payload(&payload, &params(1, 1.0, ty), 0).unwrap();
            assert_eq!(batch.signals[0].channels, vec![v], "{ty:?}");
        }
    }

    #[test]
    fn invalid_sample_rate_is_a_configuration_error() {
        let p = params(1, 0.0, ElementType::U8);
        assert!(matches!(
            decode_signal_payload(&[3, 0, 0, 0, 0], &p, 0),
            Err(TransportError::Configuration(_))
        ));
    }

    #[test]
    fn metrics_share_one_timestamp() {
        let payload = encode_metrics_payload(&[1.0, 2.5, -3.0]);
        let rows = decode_metrics_payload(&payload, 0, 42);
        assert_eq!(
            rows,
            vec![MetricRow {
                timestamp_ms: 42,
                values: vec![1.0, 2.5, -3.0]
            }]
        );
        assert_eq!(decode_metrics_payload(&payload, 2, 42)[0].values, vec![1.0, 2.5]);
    }

    #[test]
    fn metrics_partial_value_is_dropped() {
        let mut payload = encode_metrics_payload(&[7.0]);
        payload[0] = 6;
        payload.extend_from_slice(&[0xAB, 0xCD]);
        assert_eq!(decode_metrics_payload(&payload, 0, 0)[0].values, vec![7.0]);
        assert!(decode_metrics_payload(&[2, 0, 1, 2], 0, 0).is_empty());
    }

    #[test]
    fn oversized_body_is_capped_at_length_prefix() {
        let values = vec![1.0_f32; MAX_PAYLOAD_BODY / METRIC_VALUE_LEN + 10];
        let payload = encode_metrics_payload(&values);
        assert_eq!(&payload[..2], &[0xFF, 0xFF]);
        assert_eq!(payload.len(), PAYLOAD_LEN_PREFIX + MAX_PAYLOAD_BODY);
        let rows = decode_metrics_payload(&payload, 0, 0);
        assert_eq!(rows[0].values.len(), MAX_PAYLOAD_BODY / METRIC_VALUE_LEN);
    }

    #[test]
    fn uio_codec() {
        let s = UioState { lines: 0xBEEF };
        assert_eq!(decode_uio_state(&encode_uio_state(s)), Some(s));
        assert_eq!(decode_uio_state(&[1]), None);
    }

    #[test]
    fn batch_clock_continues_contiguous_batches() {
        let mut clock = BatchClock::new();
        assert_eq!(clock.batch_end(1_000, 5, 10.0), 1_000.0);
        // Second batch delivered in the same poll: continues, does not overlap.
        assert_eq!(clock.batch_end(1_000, 5, 10.0), 1_050.0);
        // Normal arrival a bit later.
        assert_eq!(clock.batch_end(1_120, 5, 10.0), 1_100.0);
    }

    #[test]
    fn batch_clock_reanchors_after_gap() {
        let mut clock = BatchClock::new();
        clock.batch_end(1_000, 5, 10.0);
        assert_eq!(clock.batch_end(5_000, 5, 10.0), 5_000.0);
        clock.reset();
        assert_eq!(clock.batch_end(9_000, 1, 10.0), 9_000.0);
    }
}
