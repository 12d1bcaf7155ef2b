//! Bounded per-slot time-series store with derived mask views.
//!
//! A [`SlotStream`] keeps three independent, append-only sequences (signal
//! rows, mask rows, metric rows).  Memory is bounded only by calling
//! [`SlotStream::prune`]; the owning device session does that periodically
//! for the active dashboard window.  Derived views are recomputed from the
//! raw mask rows on every call.

use std::collections::{BTreeMap, VecDeque};

use crate::types::{MaskRow, MetricRow, SignalBatch, SignalRow};

/// A closed run of identical non-zero segmentation values.
///
/// `start` is the index of the first row of the run, `end` the index of the
/// first row after it (exclusive), both relative to the current mask buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBound {
    pub start: usize,
    pub end: usize,
    pub value: u8,
}

impl SegmentBound {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Default, Clone)]
pub struct SlotStream {
    signals: VecDeque<SignalRow>,
    masks: VecDeque<MaskRow>,
    metrics: VecDeque<MetricRow>,
    latest_ts: Option<i64>,
}

impl SlotStream {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Append one decoded batch of paired signal and mask rows.
    pub fn add(&mut self, batch: SignalBatch) {
        debug_assert_eq!(batch.signals.len(), batch.masks.len());
        if let Some(last) = batch.signals.last() {
            self.bump_latest(last.timestamp_ms);
        }
        self.signals.extend(batch.signals);
        self.masks.extend(batch.masks);
    }

    pub fn add_metrics(&mut self, rows: Vec<MetricRow>) {
        if let Some(last) = rows.last() {
            self.bump_latest(last.timestamp_ms);
        }
        self.metrics.extend(rows);
    }

    fn bump_latest(&mut self, ts: i64) {
        self.latest_ts = Some(self.latest_ts.map_or(ts, |cur| cur.max(ts)));
    }

    /// Drop every row older than `oldest_ts` from all three sequences.
    ///
    /// Rows with `timestamp >= oldest_ts` are never removed.
    pub fn prune(&mut self, oldest_ts: i64) {
        let n = self.signals.partition_point(|r| r.timestamp_ms < oldest_ts);
        self.signals.drain(..n);
        let n = self.masks.partition_point(|r| r.timestamp_ms < oldest_ts);
        self.masks.drain(..n);
        let n = self.metrics.partition_point(|r| r.timestamp_ms < oldest_ts);
        self.metrics.drain(..n);
    }

    pub fn clear(&mut self) {
        self.signals.clear();
        self.masks.clear();
        self.metrics.clear();
        self.latest_ts = None;
    }

    // ── Raw views ────────────────────────────────────────────────────────────

    pub fn signals(&self) -> &VecDeque<SignalRow> {
        &self.signals
    }

    pub fn masks(&self) -> &VecDeque<MaskRow> {
        &self.masks
    }

    pub fn metrics(&self) -> &VecDeque<MetricRow> {
        &self.metrics
    }

    /// Signal rows with `timestamp >= ts`, for incremental redraws.
    pub fn signals_since(&self, ts: i64) -> impl Iterator<Item = &SignalRow> {
        let start = self.signals.partition_point(|r| r.timestamp_ms < ts);
        self.signals.range(start..)
    }

    pub fn metrics_since(&self, ts: i64) -> impl Iterator<Item = &MetricRow> {
        let start = self.metrics.partition_point(|r| r.timestamp_ms < ts);
        self.metrics.range(start..)
    }

    pub fn latest_ts(&self) -> Option<i64> {
        self.latest_ts
    }

    /// Number of signal rows held.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.metrics.is_empty()
    }

    // ── Derived views ────────────────────────────────────────────────────────

    /// Closed runs of non-zero segmentation values.
    ///
    /// A run opens on a transition into a non-zero value and closes on the
    /// transition out of it (to zero or to a different value).  A run still
    /// open at the newest row is not reported.
    pub fn segment_bounds(&self) -> Vec<SegmentBound> {
        let mut bounds = Vec::new();
        let mut open: Option<(usize, u8)> = None;
        for (i, row) in self.masks.iter().enumerate() {
            let seg = row.mask.segment();
            match open {
                Some((_, value)) if value == seg => {}
                Some((start, value)) => {
                    bounds.push(SegmentBound {
                        start,
                        end: i,
                        value,
                    });
                    open = (seg != 0).then_some((i, seg));
                }
                None if seg != 0 => open = Some((i, seg)),
                None => {}
            }
        }
        bounds
    }

    /// Total row count per segmentation value across closed runs.
    pub fn segment_amounts(&self) -> BTreeMap<u8, usize> {
        let mut amounts = BTreeMap::new();
        for b in self.segment_bounds() {
            *amounts.entry(b.value).or_insert(0) += b.len();
        }
        amounts
    }

    /// `(timestamp, fiducial id)` for every row carrying a fiducial marker.
    pub fn fiducials(&self) -> Vec<(i64, u8)> {
        self.masks
            .iter()
            .filter(|r| r.mask.fiducial() != 0)
            .map(|r| (r.timestamp_ms, r.mask.fiducial()))
            .collect()
    }

    /// Rounded mean QoS class over the whole buffer; 0 when empty.
    pub fn qos_state(&self) -> u8 {
        if self.masks.is_empty() {
            return 0;
        }
        let sum: u32 = self.masks.iter().map(|r| r.mask.qos() as u32).sum();
        (sum as f64 / self.masks.len() as f64).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MaskWord;

    fn batch_from_masks(start_ts: i64, masks: &[MaskWord]) -> SignalBatch {
        let mut batch = SignalBatch::default();
        for (i, &mask) in masks.iter().enumerate() {
            let timestamp_ms = start_ts + i as i64 * 10;
            batch.signals.push(SignalRow {
                timestamp_ms,
                channels: vec![i as f64],
            });
            batch.masks.push(MaskRow { timestamp_ms, mask });
        }
        batch
    }

    fn segments(values: &[u8]) -> Vec<MaskWord> {
        values.iter().map(|&v| MaskWord::new(v, 0, 0)).collect()
    }

    #[test]
    fn segment_bounds_report_closed_runs() {
        let mut s = SlotStream::new();
        s.add(batch_from_masks(0, &segments(&[0, 0, 5, 5, 5, 0, 0, 3, 3, 0])));
        assert_eq!(
            s.segment_bounds(),
            vec![
                SegmentBound { start: 2, end: 5, value: 5 },
                SegmentBound { start: 7, end: 9, value: 3 },
            ]
        );
        let amounts = s.segment_amounts();
        assert_eq!(amounts.get(&5), Some(&3));
        assert_eq!(amounts.get(&3), Some(&2));
    }

    #[test]
    fn open_run_at_buffer_end_is_not_closed() {
        let mut s = SlotStream::new();
        s.add(batch_from_masks(0, &segments(&[4, 4, 0, 2, 2])));
        assert_eq!(s.segment_bounds(), vec![SegmentBound { start: 0, end: 2, value: 4 }]);
    }

    #[test]
    fn direct_value_change_splits_runs() {
        let mut s = SlotStream::new();
        s.add(batch_from_masks(0, &segments(&[1, 1, 2, 2, 0])));
        assert_eq!(
            s.segment_bounds(),
            vec![
                SegmentBound { start: 0, end: 2, value: 1 },
                SegmentBound { start: 2, end: 4, value: 2 },
            ]
        );
    }

    #[test]
    fn qos_is_rounded_mean() {
        let mut s = SlotStream::new();
        assert_eq!(s.qos_state(), 0);
        let masks: Vec<MaskWord> = [3, 3, 2, 3].iter().map(|&q| MaskWord::new(0, q, 0)).collect();
        s.add(batch_from_masks(0, &masks));
        assert_eq!(s.qos_state(), 3);

        let mut s = SlotStream::new();
        let masks: Vec<MaskWord> = [0, 1, 1, 2].iter().map(|&q| MaskWord::new(0, q, 0)).collect();
        s.add(batch_from_masks(0, &masks));
        assert_eq!(s.qos_state(), 1);
    }

    #[test]
    fn fiducials_list_marked_rows() {
        let mut s = SlotStream::new();
        let masks = vec![
            MaskWord::new(1, 3, 0),
            MaskWord::new(1, 3, 7),
            MaskWord::new(0, 2, 0),
            MaskWord::new(0, 2, 255),
        ];
        s.add(batch_from_masks(100, &masks));
        assert_eq!(s.fiducials(), vec![(110, 7), (130, 255)]);
    }

    #[test]
    fn prune_removes_only_older_rows_and_is_idempotent() {
        let mut s = SlotStream::new();
        s.add(batch_from_masks(0, &segments(&[0; 10])));
        s.add_metrics(vec![
            MetricRow { timestamp_ms: 20, values: vec![1.0] },
            MetricRow { timestamp_ms: 60, values: vec![2.0] },
        ]);

        s.prune(45);
        assert_eq!(s.len(), 5);
        assert_eq!(s.masks().len(), 5);
        assert_eq!(s.signals().front().map(|r| r.timestamp_ms), Some(50));
        assert_eq!(s.metrics().len(), 1);

        s.prune(45);
        assert_eq!(s.len(), 5);
        assert_eq!(s.metrics().len(), 1);

        s.prune(50);
        assert_eq!(s.signals().front().map(|r| r.timestamp_ms), Some(50));
    }

    #[test]
    fn latest_ts_and_incremental_queries() {
        let mut s = SlotStream::new();
        assert_eq!(s.latest_ts(), None);
        s.add(batch_from_masks(1_000, &segments(&[0; 4])));
        assert_eq!(s.latest_ts(), Some(1_030));
        s.add_metrics(vec![MetricRow { timestamp_ms: 1_100, values: vec![0.5] }]);
        assert_eq!(s.latest_ts(), Some(1_100));

        let recent: Vec<i64> = s.signals_since(1_015).map(|r| r.timestamp_ms).collect();
        assert_eq!(recent, vec![1_020, 1_030]);
        assert_eq!(s.metrics_since(1_101).count(), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let mut s = SlotStream::new();
        s.add(batch_from_masks(0, &segments(&[1, 0])));
        s.add_metrics(vec![MetricRow { timestamp_ms: 0, values: vec![] }]);
        s.clear();
        assert!(s.is_empty());
        assert!(s.masks().is_empty());
        assert_eq!(s.latest_ts(), None);
        assert!(s.segment_bounds().is_empty());
    }
}
