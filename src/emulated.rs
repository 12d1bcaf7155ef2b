//! Emulated transport: one virtual device producing synthetic telemetry.
//!
//! Useful for exercising sessions and dashboards without hardware.  Payloads
//! are built with the wire encoders and pushed through the same
//! [`Delivery`] path as the real transports, so everything downstream of the
//! decoders sees exactly what a device would produce.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::frame::PacketType;
use crate::handler::{
    check_slot, now_ms, Delivery, DeviceHandler, DisconnectCallback, MetricsCallback,
    ScanCallback, SignalCallback, SubscriptionTable, UioCallback,
};
use crate::parse::{encode_metrics_payload, encode_signal_payload, encode_uio_state};
use crate::types::{
    ConnectionState, DeviceProfile, DeviceRecord, ElementType, InterfaceType, MaskWord,
    SlotParameters, UioState,
};

/// Id of the single virtual device.
pub const EMULATED_DEVICE_ID: &str = "emulated-0";

/// Interval between generated signal payloads.
pub const EMULATED_TICK: Duration = Duration::from_millis(50);

/// Metrics are generated once every this many ticks (1 s).
const METRICS_EVERY_TICKS: u64 = 20;

// ── Signal generator ─────────────────────────────────────────────────────────

/// Synthetic sample at time `t` (seconds) for channel `ch`: three sinusoids
/// plus a deterministic noise floor, peak ≈ ±40.
fn sim_sample(t: f64, ch: usize) -> f64 {
    let phi = ch as f64 * PI / 2.5;
    let slow = 20.0 * (2.0 * PI * 1.2 * t + phi).sin();
    let mid = 10.0 * (2.0 * PI * 6.0 * t + phi * 0.9).sin();
    let fast = 6.0 * (2.0 * PI * 22.0 * t + phi * 1.7).sin();
    let nx = t * 1000.7 + ch as f64 * 137.508;
    let noise = ((nx.sin() * 9973.1).fract() - 0.5) * 8.0;
    slow + mid + fast + noise
}

/// Offset lifting the generator into the range of unsigned element types.
fn baseline(element_type: ElementType) -> f64 {
    match element_type {
        ElementType::U8 => 128.0,
        ElementType::U16 | ElementType::U32 => 2048.0,
        _ => 0.0,
    }
}

/// Mask word for sample `index` at `rate` Hz.
///
/// Segmentation cycles `0, 1, 0, 2` with one value per second, QoS drops to
/// "fair" every fifth second, and the first sample of each second carries a
/// fiducial numbered by the second.
fn sim_mask(index: u64, rate: f64) -> MaskWord {
    let per_second = rate.round().max(1.0) as u64;
    let second = index / per_second;
    let segment = [0, 1, 0, 2][(second % 4) as usize];
    let qos = if second % 5 == 4 { 2 } else { 3 };
    let fiducial = if index % per_second == 0 {
        (second % 255 + 1) as u8
    } else {
        0
    };
    MaskWord::new(segment, qos, fiducial)
}

/// Per-slot generator state.
struct SlotGenerator {
    slot: u8,
    params: SlotParameters,
    index: u64,
    carry: f64,
}

impl SlotGenerator {
    fn new(slot: u8, params: SlotParameters) -> Self {
        Self {
            slot,
            params,
            index: 0,
            carry: 0.0,
        }
    }

    /// Signal payload covering `elapsed`; fractional rows carry over.
    fn next_payload(&mut self, elapsed: Duration) -> Vec<u8> {
        let exact = self.params.sample_rate_hz * elapsed.as_secs_f64() + self.carry;
        let rows = exact.floor() as u64;
        self.carry = exact - rows as f64;

        let offset = baseline(self.params.element_type);
        let rows: Vec<(MaskWord, Vec<f64>)> = (0..rows)
            .map(|_| {
                let i = self.index;
                self.index += 1;
                let t = i as f64 / self.params.sample_rate_hz;
                let channels = (0..self.params.channel_count)
                    .map(|ch| offset + sim_sample(t, ch))
                    .collect();
                (sim_mask(i, self.params.sample_rate_hz), channels)
            })
            .collect();
        encode_signal_payload(&rows, self.params.element_type)
    }

    fn metrics_payload(&self) -> Option<Vec<u8>> {
        if self.params.metric_count == 0 {
            return None;
        }
        let t = self.index as f64 / self.params.sample_rate_hz;
        let values: Vec<f32> = (0..self.params.metric_count)
            .map(|m| (50.0 + 10.0 * (2.0 * PI * 0.1 * t + m as f64).sin()) as f32)
            .collect();
        Some(encode_metrics_payload(&values))
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

struct EmulatedDevice {
    state: ConnectionState,
    delivery: Delivery,
    uio: UioState,
    generator: Option<JoinHandle<()>>,
    on_disconnect: DisconnectCallback,
}

struct EmulatedInner {
    tick: Duration,
    devices: Mutex<HashMap<String, EmulatedDevice>>,
    subs: SubscriptionTable,
}

/// [`DeviceHandler`] exposing the virtual device [`EMULATED_DEVICE_ID`].
#[derive(Clone)]
pub struct EmulatedHandler {
    inner: Arc<EmulatedInner>,
}

impl Default for EmulatedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedHandler {
    pub fn new() -> Self {
        Self::with_tick(EMULATED_TICK)
    }

    /// Handler generating payloads every `tick` instead of every 50 ms.
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            inner: Arc::new(EmulatedInner {
                tick,
                devices: Mutex::new(HashMap::new()),
                subs: SubscriptionTable::new(),
            }),
        }
    }

    pub fn device_record() -> DeviceRecord {
        DeviceRecord {
            id: EMULATED_DEVICE_ID.to_owned(),
            interface_type: InterfaceType::Emulated,
            name: "Biotel Emulator".to_owned(),
        }
    }
}

impl EmulatedInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, EmulatedDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, device_id: &str) -> ConnectionState {
        self.lock()
            .get(device_id)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    fn require_connected<T>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut EmulatedDevice) -> Result<T>,
    ) -> Result<T> {
        let mut devices = self.lock();
        match devices.get_mut(device_id) {
            Some(dev) if dev.state == ConnectionState::Connected => f(dev),
            _ => Err(TransportError::NotConnected(device_id.to_owned())),
        }
    }
}

fn spawn_generator(
    inner: Arc<EmulatedInner>,
    device_id: String,
    profile: DeviceProfile,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut slots: Vec<SlotGenerator> = profile
            .configured_slots()
            .filter_map(|slot| {
                let params = profile.slot(slot).ok()?.clone();
                Some(SlotGenerator::new(slot, params))
            })
            .collect();
        let mut ticker = tokio::time::interval(inner.tick);
        let mut ticks: u64 = 0;
        loop {
            ticker.tick().await;
            ticks += 1;
            let now = now_ms();
            let mut devices = inner.lock();
            let Some(dev) = devices
                .get_mut(&device_id)
                .filter(|d| d.state == ConnectionState::Connected)
            else {
                break;
            };
            for gen in slots.iter_mut() {
                let payload = gen.next_payload(inner.tick);
                dev.delivery
                    .deliver(&inner.subs, gen.slot, PacketType::Signal, &payload, now);
                if ticks % METRICS_EVERY_TICKS == 0 {
                    if let Some(payload) = gen.metrics_payload() {
                        dev.delivery
                            .deliver(&inner.subs, gen.slot, PacketType::Metrics, &payload, now);
                    }
                }
            }
        }
        debug!("{device_id}: generator finished");
    })
}

#[async_trait]
impl DeviceHandler for EmulatedHandler {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Emulated
    }

    async fn start_scan(&self, on_found: ScanCallback) -> Result<()> {
        on_found(Self::device_record());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        false
    }

    async fn refresh_previous(&self, known: &[DeviceRecord]) -> Result<Vec<DeviceRecord>> {
        Ok(known
            .iter()
            .filter(|d| d.interface_type == InterfaceType::Emulated && d.id == EMULATED_DEVICE_ID)
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        device_id: &str,
        profile: DeviceProfile,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        if device_id != EMULATED_DEVICE_ID {
            return Err(TransportError::DeviceNotFound(device_id.to_owned()));
        }
        let mut devices = self.inner.lock();
        if devices.contains_key(device_id) {
            return Err(TransportError::AlreadyConnected(device_id.to_owned()));
        }
        let generator = spawn_generator(self.inner.clone(), device_id.to_owned(), profile.clone());
        devices.insert(
            device_id.to_owned(),
            EmulatedDevice {
                state: ConnectionState::Connected,
                delivery: Delivery::new(device_id, profile),
                uio: UioState::default(),
                generator: Some(generator),
                on_disconnect,
            },
        );
        info!("{device_id}: emulated device connected");
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let generator = self.inner.require_connected(device_id, |dev| {
            dev.state = ConnectionState::Disconnecting;
            Ok(dev.generator.take())
        })?;
        if let Some(generator) = generator {
            generator.abort();
        }
        let removed = self.inner.lock().remove(device_id);
        self.inner.subs.remove_device(device_id);
        info!("{device_id}: emulated device disconnected");
        if let Some(dev) = removed {
            (dev.on_disconnect)(device_id);
        }
        Ok(())
    }

    fn connection_state(&self, device_id: &str) -> ConnectionState {
        self.inner.state(device_id)
    }

    async fn subscribe_slot_signals(
        &self,
        device_id: &str,
        slot: u8,
        callback: SignalCallback,
    ) -> Result<()> {
        check_slot(slot)?;
        self.inner.require_connected(device_id, |dev| {
            dev.delivery.profile().slot(slot).map(|_| ())
        })?;
        self.inner.subs.insert_signals(device_id, slot, callback);
        Ok(())
    }

    async fn subscribe_slot_metrics(
        &self,
        device_id: &str,
        slot: u8,
        callback: MetricsCallback,
    ) -> Result<()> {
        check_slot(slot)?;
        self.inner.require_connected(device_id, |dev| {
            dev.delivery.profile().slot(slot).map(|_| ())
        })?;
        self.inner.subs.insert_metrics(device_id, slot, callback);
        Ok(())
    }

    async fn subscribe_uio(&self, device_id: &str, callback: UioCallback) -> Result<()> {
        self.inner.require_connected(device_id, |_| Ok(()))?;
        self.inner.subs.insert_uio(device_id, callback);
        Ok(())
    }

    async fn get_uio_state(&self, device_id: &str) -> Result<UioState> {
        self.inner.require_connected(device_id, |dev| Ok(dev.uio))
    }

    /// Stores the new state and reports it back the way a device would.
    async fn set_uio_state(&self, device_id: &str, state: UioState) -> Result<()> {
        let subs = &self.inner.subs;
        self.inner.require_connected(device_id, |dev| {
            dev.uio = state;
            dev.delivery
                .deliver(subs, 0, PacketType::Uio, &encode_uio_state(state), now_ms());
            Ok(())
        })
    }

    async fn get_device_strength(&self, device_id: &str) -> Result<u8> {
        self.inner.require_connected(device_id, |_| Ok(100))
    }

    async fn get_device_battery_level(&self, device_id: &str) -> Result<u8> {
        self.inner.require_connected(device_id, |_| Ok(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::decode_signal_payload;

    fn params(rate: f64, element_type: ElementType) -> SlotParameters {
        SlotParameters {
            channel_count: 2,
            sample_rate_hz: rate,
            element_type,
            metric_count: 3,
        }
    }

    #[test]
    fn generator_carries_fractional_rows() {
        // 30 Hz over 50 ms is 1.5 rows per tick.
        let mut gen = SlotGenerator::new(0, params(30.0, ElementType::I16));
        let p = gen.params.clone();
        let a = decode_signal_payload(&gen.next_payload(EMULATED_TICK), &p, 0).unwrap();
        let b = decode_signal_payload(&gen.next_payload(EMULATED_TICK), &p, 0).unwrap();
        assert_eq!(a.len() + b.len(), 3);
        assert_eq!(gen.index, 3);
    }

    #[test]
    fn unsigned_samples_stay_in_range() {
        let mut gen = SlotGenerator::new(0, params(250.0, ElementType::U8));
        let p = gen.params.clone();
        let batch = decode_signal_payload(&gen.next_payload(Duration::from_secs(1)), &p, 0).unwrap();
        assert_eq!(batch.len(), 250);
        assert!(batch
            .signals
            .iter()
            .flat_map(|r| r.channels.iter())
            .all(|&v| v > 0.0 && v < 255.0));
    }

    #[test]
    fn mask_cycle_marks_each_second() {
        let m = sim_mask(0, 100.0);
        assert_eq!((m.segment(), m.qos(), m.fiducial()), (0, 3, 1));
        let m = sim_mask(150, 100.0);
        assert_eq!((m.segment(), m.fiducial()), (1, 0));
        let m = sim_mask(400, 100.0);
        assert_eq!((m.qos(), m.fiducial()), (2, 5));
    }

    #[test]
    fn metrics_follow_metric_count() {
        let gen = SlotGenerator::new(0, params(100.0, ElementType::F32));
        assert_eq!(gen.metrics_payload().map(|p| p.len()), Some(2 + 3 * 4));
        let gen = SlotGenerator::new(0, SlotParameters { metric_count: 0, ..params(100.0, ElementType::F32) });
        assert!(gen.metrics_payload().is_none());
    }
}
