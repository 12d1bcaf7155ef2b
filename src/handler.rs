//! The device-interface contract shared by every transport.
//!
//! Each transport implements [`DeviceHandler`].  Raw payloads from any
//! transport go through [`Delivery::deliver`], which decodes them against the
//! device's [`DeviceProfile`] and invokes the callback registered under the
//! typed key `(device id, slot, kind)`.  Payloads without a subscriber are
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{Result, TransportError};
use crate::frame::PacketType;
use crate::parse::{
    decode_metrics_payload, decode_signal_payload_at, decode_uio_state, signal_row_count,
    BatchClock,
};
use crate::protocol::SLOT_COUNT;
use crate::types::{
    ConnectionState, DeviceProfile, DeviceRecord, InterfaceType, MetricRow, NotificationKind,
    SignalBatch, UioState,
};

// ── Callback shapes ──────────────────────────────────────────────────────────

/// `(slot, rows)` for signal batches.
pub type SignalCallback = Arc<dyn Fn(u8, SignalBatch) + Send + Sync>;
/// `(slot, metrics)` for metric rows.
pub type MetricsCallback = Arc<dyn Fn(u8, Vec<MetricRow>) + Send + Sync>;
/// UIO state reported by the device.
pub type UioCallback = Arc<dyn Fn(UioState) + Send + Sync>;
/// Called with the device id after a disconnect, whoever initiated it.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Called for every discovered device; returning `true` ends the scan.
pub type ScanCallback = Arc<dyn Fn(DeviceRecord) -> bool + Send + Sync>;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn check_slot(slot: u8) -> Result<()> {
    if (slot as usize) < SLOT_COUNT {
        Ok(())
    } else {
        Err(TransportError::InvalidSlot(slot))
    }
}

// ── Contract ─────────────────────────────────────────────────────────────────

/// Operations every transport provides.
///
/// Every operation other than `connect`, scanning, and state queries fails
/// with [`TransportError::NotConnected`] unless the device is
/// [`ConnectionState::Connected`].
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn interface_type(&self) -> InterfaceType;

    /// Start discovering devices in the background.  Each discovery is passed
    /// to `on_found`; a `true` return stops the scan.
    async fn start_scan(&self, on_found: ScanCallback) -> Result<()>;

    /// Ask an in-progress scan to stop.  A discovery already in flight may
    /// still be reported after this returns.
    async fn stop_scan(&self) -> Result<()>;

    fn is_scanning(&self) -> bool;

    /// Re-find previously known devices of this transport.
    async fn refresh_previous(&self, known: &[DeviceRecord]) -> Result<Vec<DeviceRecord>>;

    async fn connect(
        &self,
        device_id: &str,
        profile: DeviceProfile,
        on_disconnect: DisconnectCallback,
    ) -> Result<()>;

    async fn disconnect(&self, device_id: &str) -> Result<()>;

    fn connection_state(&self, device_id: &str) -> ConnectionState;

    async fn subscribe_slot_signals(
        &self,
        device_id: &str,
        slot: u8,
        callback: SignalCallback,
    ) -> Result<()>;

    async fn subscribe_slot_metrics(
        &self,
        device_id: &str,
        slot: u8,
        callback: MetricsCallback,
    ) -> Result<()>;

    async fn subscribe_uio(&self, device_id: &str, callback: UioCallback) -> Result<()>;

    async fn get_uio_state(&self, device_id: &str) -> Result<UioState>;

    async fn set_uio_state(&self, device_id: &str, state: UioState) -> Result<()>;

    /// Link strength, 0–100.
    async fn get_device_strength(&self, device_id: &str) -> Result<u8>;

    /// Battery level, 0–100.
    async fn get_device_battery_level(&self, device_id: &str) -> Result<u8>;
}

// ── Subscriptions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub device_id: String,
    pub slot: u8,
    pub kind: NotificationKind,
}

impl SubscriptionKey {
    pub fn new(device_id: &str, slot: u8, kind: NotificationKind) -> Self {
        Self {
            device_id: device_id.to_owned(),
            slot,
            kind,
        }
    }
}

#[derive(Clone)]
enum Subscriber {
    Signals(SignalCallback),
    Metrics(MetricsCallback),
    Uio(UioCallback),
}

/// Callback registrations keyed by `(device, slot, kind)`.  UIO uses slot 0.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: Mutex<HashMap<SubscriptionKey, Subscriber>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: SubscriptionKey, subscriber: Subscriber) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(key, subscriber);
        }
    }

    fn get(&self, key: &SubscriptionKey) -> Option<Subscriber> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn insert_signals(&self, device_id: &str, slot: u8, cb: SignalCallback) {
        let key = SubscriptionKey::new(device_id, slot, NotificationKind::Signals);
        self.insert(key, Subscriber::Signals(cb));
    }

    pub fn insert_metrics(&self, device_id: &str, slot: u8, cb: MetricsCallback) {
        let key = SubscriptionKey::new(device_id, slot, NotificationKind::Metrics);
        self.insert(key, Subscriber::Metrics(cb));
    }

    pub fn insert_uio(&self, device_id: &str, cb: UioCallback) {
        let key = SubscriptionKey::new(device_id, 0, NotificationKind::Uio);
        self.insert(key, Subscriber::Uio(cb));
    }

    pub fn signals(&self, device_id: &str, slot: u8) -> Option<SignalCallback> {
        match self.get(&SubscriptionKey::new(device_id, slot, NotificationKind::Signals))? {
            Subscriber::Signals(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn metrics(&self, device_id: &str, slot: u8) -> Option<MetricsCallback> {
        match self.get(&SubscriptionKey::new(device_id, slot, NotificationKind::Metrics))? {
            Subscriber::Metrics(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn uio(&self, device_id: &str) -> Option<UioCallback> {
        match self.get(&SubscriptionKey::new(device_id, 0, NotificationKind::Uio))? {
            Subscriber::Uio(cb) => Some(cb),
            _ => None,
        }
    }

    /// Forget every subscription of one device.
    pub fn remove_device(&self, device_id: &str) {
        if let Ok(mut map) = self.entries.lock() {
            map.retain(|k, _| k.device_id != device_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────────

/// Decode-and-dispatch state for one connected device.
///
/// Owns the device's slot profile and one [`BatchClock`] per slot.  Decoding
/// errors are logged here and never propagate into the transport loop.
pub struct Delivery {
    device_id: String,
    profile: DeviceProfile,
    clocks: [BatchClock; SLOT_COUNT],
}

impl Delivery {
    pub fn new(device_id: &str, profile: DeviceProfile) -> Self {
        Self {
            device_id: device_id.to_owned(),
            profile,
            clocks: Default::default(),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Decode `payload` and hand the rows to the matching subscriber.
    ///
    /// Returns the UIO state for `Uio` payloads so transports can cache it.
    pub fn deliver(
        &mut self,
        subs: &SubscriptionTable,
        slot: u8,
        packet_type: PacketType,
        payload: &[u8],
        now: i64,
    ) -> Option<UioState> {
        match packet_type {
            PacketType::Signal => {
                self.deliver_signals(subs, slot, payload, now);
                None
            }
            PacketType::Metrics => {
                self.deliver_metrics(subs, slot, payload, now);
                None
            }
            PacketType::Uio => {
                let state = decode_uio_state(payload)?;
                if let Some(cb) = subs.uio(&self.device_id) {
                    cb(state);
                }
                Some(state)
            }
        }
    }

    fn deliver_signals(&mut self, subs: &SubscriptionTable, slot: u8, payload: &[u8], now: i64) {
        let Some(cb) = subs.signals(&self.device_id, slot) else {
            return;
        };
        let params = match self.profile.slot(slot) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: dropping signal payload: {e}", self.device_id);
                return;
            }
        };
        let rows = signal_row_count(payload, params);
        let end = self.clocks[slot as usize].batch_end(now, rows, params.period_ms());
        match decode_signal_payload_at(payload, params, end) {
            Ok(batch) if !batch.is_empty() => cb(slot, batch),
            Ok(_) => debug!("{}: empty signal payload on slot {slot}", self.device_id),
            Err(e) => warn!("{}: slot {slot} decode failed: {e}", self.device_id),
        }
    }

    fn deliver_metrics(&mut self, subs: &SubscriptionTable, slot: u8, payload: &[u8], now: i64) {
        let Some(cb) = subs.metrics(&self.device_id, slot) else {
            return;
        };
        let metric_count = match self.profile.slot(slot) {
            Ok(p) => p.metric_count,
            Err(e) => {
                warn!("{}: dropping metrics payload: {e}", self.device_id);
                return;
            }
        };
        let rows = decode_metrics_payload(payload, metric_count, now);
        if !rows.is_empty() {
            cb(slot, rows);
        }
    }
}
