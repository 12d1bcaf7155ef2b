//! BLE transport over `btleplug`.
//!
//! Each slot exposes one signal and one metric characteristic; a notification
//! carries a complete payload, so no framing or CRC layer is involved.  All
//! notifications of a device arrive on one stream, which a per-device task
//! demultiplexes by characteristic UUID.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{Result, TransportError};
use crate::frame::PacketType;
use crate::handler::{
    check_slot, now_ms, Delivery, DeviceHandler, DisconnectCallback, MetricsCallback,
    ScanCallback, SignalCallback, SubscriptionTable, UioCallback,
};
use crate::parse::{decode_uio_state, encode_uio_state};
use crate::protocol::{
    is_benign_write_error, rssi_to_strength, BATTERY_LEVEL_CHARACTERISTIC,
    METRIC_CHARACTERISTICS, SIGNAL_CHARACTERISTICS, TELEMETRY_SERVICE_UUID, UIO_CHARACTERISTIC,
};
use crate::types::{ConnectionState, DeviceProfile, DeviceRecord, InterfaceType, UioState};

// ── Adapter helpers ──────────────────────────────────────────────────────────

/// First Bluetooth adapter of the platform, once it is ready to scan.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(TransportError::NoAdapter)?;
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// CoreBluetooth ignores scan requests until the central reports PoweredOn,
/// which can take a moment after the manager is created.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(200);
    const GIVE_UP_AFTER: Duration = Duration::from_secs(3);

    let started = tokio::time::Instant::now();
    while started.elapsed() < GIVE_UP_AFTER {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                debug!("Bluetooth central ready after {:?}", started.elapsed());
                return;
            }
            Ok(other) => debug!("Bluetooth central is {other:?}"),
            Err(e) => {
                warn!("cannot query Bluetooth central state: {e}");
                return;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    warn!("Bluetooth central not powered on after {GIVE_UP_AFTER:?}; scanning anyway");
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// Name and id of `p` if it advertises a name starting with `prefix`.
async fn matching_record(p: &Peripheral, prefix: &str) -> Option<DeviceRecord> {
    let props = p.properties().await.ok()??;
    let name = props.local_name?;
    name.starts_with(prefix).then(|| DeviceRecord {
        id: p.id().to_string(),
        interface_type: InterfaceType::Ble,
        name,
    })
}

/// Write to a control characteristic.
async fn write_control(peripheral: &Peripheral, ch: &Characteristic, data: &[u8]) -> Result<()> {
    let write_type = if ch.properties.contains(CharPropFlags::WRITE) {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    };
    settle_write(ch.uuid, peripheral.write(ch, data, write_type).await)
}

/// Some BLE stacks report errors for writes that went through; those count
/// as success.  Anything else is returned.
fn settle_write(uuid: Uuid, result: std::result::Result<(), btleplug::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_benign_write_error(&e.to_string()) => {
            debug!("ignoring benign write error on {uuid}: {e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark a scan as running, or fail if one already is.
fn claim_scan(scanning: &AtomicBool) -> Result<()> {
    if scanning.swap(true, Ordering::SeqCst) {
        warn!("BLE scan already running");
        return Err(TransportError::ScanInProgress(InterfaceType::Ble));
    }
    Ok(())
}

fn require_telemetry_service(device_id: &str, services: &BTreeSet<Service>) -> Result<()> {
    if services.iter().any(|svc| svc.uuid == TELEMETRY_SERVICE_UUID) {
        Ok(())
    } else {
        Err(TransportError::Configuration(format!(
            "{device_id}: telemetry service {TELEMETRY_SERVICE_UUID} not found"
        )))
    }
}

/// Slot and payload kind carried by notifications from `uuid`.
fn route_notification(uuid: Uuid) -> Option<(u8, PacketType)> {
    if let Some(slot) = SIGNAL_CHARACTERISTICS.iter().position(|&u| u == uuid) {
        Some((slot as u8, PacketType::Signal))
    } else if let Some(slot) = METRIC_CHARACTERISTICS.iter().position(|&u| u == uuid) {
        Some((slot as u8, PacketType::Metrics))
    } else if uuid == UIO_CHARACTERISTIC {
        Some((0, PacketType::Uio))
    } else {
        None
    }
}

// ── Handler state ────────────────────────────────────────────────────────────

struct BleDevice {
    state: ConnectionState,
    peripheral: Peripheral,
    profile: DeviceProfile,
    chars: HashMap<Uuid, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
    on_disconnect: DisconnectCallback,
}

struct BleInner {
    adapter: Adapter,
    config: ClientConfig,
    /// Peripherals seen by scans, by id.
    peripherals: Mutex<HashMap<String, Peripheral>>,
    devices: Mutex<HashMap<String, BleDevice>>,
    subs: SubscriptionTable,
    scanning: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

/// [`DeviceHandler`] for BLE devices.
#[derive(Clone)]
pub struct BleHandler {
    inner: Arc<BleInner>,
}

impl BleHandler {
    /// Handler on the platform's first Bluetooth adapter.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let adapter = default_adapter().await?;
        Ok(Self::with_adapter(adapter, config))
    }

    pub fn with_adapter(adapter: Adapter, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(BleInner {
                adapter,
                config,
                peripherals: Mutex::new(HashMap::new()),
                devices: Mutex::new(HashMap::new()),
                subs: SubscriptionTable::new(),
                scanning: AtomicBool::new(false),
                scan_task: Mutex::new(None),
            }),
        }
    }
}

impl BleInner {
    fn devices(&self) -> MutexGuard<'_, HashMap<String, BleDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, id: &str, p: &Peripheral) {
        if let Ok(mut cache) = self.peripherals.lock() {
            cache.insert(id.to_owned(), p.clone());
        }
    }

    fn state(&self, device_id: &str) -> ConnectionState {
        self.devices()
            .get(device_id)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral> {
        let cached = self
            .peripherals
            .lock()
            .ok()
            .and_then(|c| c.get(device_id).cloned());
        if let Some(p) = cached {
            return Ok(p);
        }
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_owned()))
    }

    /// Peripheral and characteristic `uuid` of a connected device.
    fn connected_char(&self, device_id: &str, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let devices = self.devices();
        let dev = devices
            .get(device_id)
            .filter(|d| d.state == ConnectionState::Connected)
            .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;
        let ch = dev.chars.get(&uuid).cloned().ok_or_else(|| {
            TransportError::Configuration(format!("{device_id}: characteristic {uuid} not found"))
        })?;
        Ok((dev.peripheral.clone(), ch))
    }

    /// Validate a slot subscription and return what is needed to enable it.
    fn slot_char(
        &self,
        device_id: &str,
        slot: u8,
        chars: &[Uuid],
    ) -> Result<(Peripheral, Characteristic)> {
        check_slot(slot)?;
        {
            let devices = self.devices();
            let dev = devices
                .get(device_id)
                .filter(|d| d.state == ConnectionState::Connected)
                .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;
            dev.profile.slot(slot)?;
        }
        self.connected_char(device_id, chars[slot as usize])
    }

    /// Tear down after the link dropped on the device side.
    fn device_lost(&self, device_id: &str) {
        let removed = self.devices().remove(device_id);
        self.subs.remove_device(device_id);
        if let Some(dev) = removed {
            for task in dev.tasks {
                task.abort();
            }
            info!("{device_id}: BLE link lost");
            (dev.on_disconnect)(device_id);
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

fn spawn_scan(inner: Arc<BleInner>, on_found: ScanCallback) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = match inner.adapter.events().await {
            Ok(e) => e,
            Err(e) => {
                warn!("BLE scan: could not subscribe to adapter events: {e}");
                inner.scanning.store(false, Ordering::SeqCst);
                return;
            }
        };
        let prefix = inner.config.name_prefix.clone();
        let mut seen = HashSet::new();

        // Peripherals the stack already knows do not always re-announce.
        let known = inner.adapter.peripherals().await.unwrap_or_default();
        let mut pending: Vec<Peripheral> = known;

        loop {
            for p in pending.drain(..) {
                let Some(record) = matching_record(&p, &prefix).await else {
                    continue;
                };
                if !seen.insert(record.id.clone()) {
                    continue;
                }
                info!("BLE scan: found {}  id={}", record.name, record.id);
                inner.remember(&record.id, &p);
                if on_found(record) {
                    inner.scanning.store(false, Ordering::SeqCst);
                    inner.adapter.stop_scan().await.ok();
                    return;
                }
            }
            if !inner.scanning.load(Ordering::SeqCst) {
                return;
            }
            match events.next().await {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if let Ok(p) = inner.adapter.peripheral(&id).await {
                        pending.push(p);
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        inner.scanning.store(false, Ordering::SeqCst);
    })
}

fn spawn_notifications(
    inner: Arc<BleInner>,
    device_id: String,
    peripheral: Peripheral,
    profile: DeviceProfile,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("{device_id}: could not get notification stream: {e}");
                return;
            }
        };
        let mut delivery = Delivery::new(&device_id, profile);
        let mut count: u64 = 0;

        while let Some(notif) = notifications.next().await {
            count += 1;
            if count <= 5 || count % 500 == 0 {
                info!(
                    "{device_id}: notif #{count} uuid={} len={}",
                    notif.uuid,
                    notif.value.len()
                );
            }
            if inner.state(&device_id) != ConnectionState::Connected {
                debug!("{device_id}: dropping notification after disconnect");
                continue;
            }

            match route_notification(notif.uuid) {
                Some((slot, kind)) => {
                    delivery.deliver(&inner.subs, slot, kind, &notif.value, now_ms());
                }
                None => debug!("{device_id}: unknown notification from {}", notif.uuid),
            }
        }
        info!("{device_id}: notification stream ended");
    })
}

/// Watch the adapter for the device dropping its link (powered off, out of
/// range).  Often fires before the notification stream closes.
fn spawn_disconnect_watcher(
    inner: Arc<BleInner>,
    device_id: String,
    peripheral: Peripheral,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peripheral_id = peripheral.id();
        match inner.adapter.events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("{device_id}: disconnect watcher fired");
                            if inner.state(&device_id) == ConnectionState::Connected {
                                inner.device_lost(&device_id);
                            }
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("{device_id}: could not subscribe to adapter events: {e}");
            }
        }
    })
}

// ── DeviceHandler ────────────────────────────────────────────────────────────

#[async_trait]
impl DeviceHandler for BleHandler {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Ble
    }

    async fn start_scan(&self, on_found: ScanCallback) -> Result<()> {
        claim_scan(&self.inner.scanning)?;
        if let Err(e) = self.inner.adapter.start_scan(ScanFilter::default()).await {
            self.inner.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!("BLE scan started (prefix {:?})", self.inner.config.name_prefix);
        let task = spawn_scan(self.inner.clone(), on_found);
        if let Ok(mut slot) = self.inner.scan_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.scanning.store(false, Ordering::SeqCst);
        let task = self.inner.scan_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
        self.inner.adapter.stop_scan().await?;
        info!("BLE scan stopped");
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Active scan for a fixed period, then intersect what the adapter knows
    /// with the previously known ids.
    async fn refresh_previous(&self, known: &[DeviceRecord]) -> Result<Vec<DeviceRecord>> {
        let wanted: Vec<&DeviceRecord> = known
            .iter()
            .filter(|d| d.interface_type == InterfaceType::Ble)
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        info!("BLE refresh: scanning for {} known device(s)", wanted.len());
        self.inner.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.inner.config.refresh_scan()).await;
        self.inner.adapter.stop_scan().await.ok();

        let mut present = HashSet::new();
        for p in self.inner.adapter.peripherals().await? {
            let id = p.id().to_string();
            self.inner.remember(&id, &p);
            present.insert(id);
        }
        Ok(wanted
            .into_iter()
            .filter(|d| present.contains(&d.id))
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        device_id: &str,
        profile: DeviceProfile,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        let peripheral = self.inner.find_peripheral(device_id).await?;
        {
            let mut devices = self.inner.devices();
            if devices.contains_key(device_id) {
                return Err(TransportError::AlreadyConnected(device_id.to_owned()));
            }
            devices.insert(
                device_id.to_owned(),
                BleDevice {
                    state: ConnectionState::Connecting,
                    peripheral: peripheral.clone(),
                    profile: profile.clone(),
                    chars: HashMap::new(),
                    tasks: Vec::new(),
                    on_disconnect,
                },
            );
        }

        match self.establish(device_id, &peripheral, profile).await {
            Ok(()) => {
                info!("{device_id}: BLE connected");
                Ok(())
            }
            Err(e) => {
                warn!("{device_id}: BLE connect failed: {e}");
                if let Some(dev) = self.inner.devices().remove(device_id) {
                    for task in dev.tasks {
                        task.abort();
                    }
                }
                peripheral.disconnect().await.ok();
                Err(e)
            }
        }
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let peripheral = {
            let mut devices = self.inner.devices();
            let dev = devices
                .get_mut(device_id)
                .filter(|d| d.state == ConnectionState::Connected)
                .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;
            dev.state = ConnectionState::Disconnecting;
            for task in dev.tasks.drain(..) {
                task.abort();
            }
            dev.peripheral.clone()
        };

        let result = peripheral.disconnect().await;
        let removed = self.inner.devices().remove(device_id);
        self.inner.subs.remove_device(device_id);
        info!("{device_id}: BLE disconnected");
        if let Some(dev) = removed {
            (dev.on_disconnect)(device_id);
        }
        result.map_err(Into::into)
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
        let (peripheral, ch) = self.inner.slot_char(device_id, slot, &SIGNAL_CHARACTERISTICS)?;
        peripheral.subscribe(&ch).await?;
        self.inner.subs.insert_signals(device_id, slot, callback);
        Ok(())
    }

    async fn subscribe_slot_metrics(
        &self,
        device_id: &str,
        slot: u8,
        callback: MetricsCallback,
    ) -> Result<()> {
        let (peripheral, ch) = self.inner.slot_char(device_id, slot, &METRIC_CHARACTERISTICS)?;
        peripheral.subscribe(&ch).await?;
        self.inner.subs.insert_metrics(device_id, slot, callback);
        Ok(())
    }

    async fn subscribe_uio(&self, device_id: &str, callback: UioCallback) -> Result<()> {
        let (peripheral, ch) = self.inner.connected_char(device_id, UIO_CHARACTERISTIC)?;
        peripheral.subscribe(&ch).await?;
        self.inner.subs.insert_uio(device_id, callback);
        Ok(())
    }

    async fn get_uio_state(&self, device_id: &str) -> Result<UioState> {
        let (peripheral, ch) = self.inner.connected_char(device_id, UIO_CHARACTERISTIC)?;
        let raw = peripheral.read(&ch).await?;
        decode_uio_state(&raw).ok_or_else(|| {
            TransportError::Configuration(format!(
                "{device_id}: UIO read returned {} byte(s)",
                raw.len()
            ))
        })
    }

    async fn set_uio_state(&self, device_id: &str, state: UioState) -> Result<()> {
        let (peripheral, ch) = self.inner.connected_char(device_id, UIO_CHARACTERISTIC)?;
        if let Err(e) = write_control(&peripheral, &ch, &encode_uio_state(state)).await {
            warn!("{device_id}: UIO write failed: {e}");
            self.inner.device_lost(device_id);
            peripheral.disconnect().await.ok();
            return Err(e);
        }
        Ok(())
    }

    async fn get_device_strength(&self, device_id: &str) -> Result<u8> {
        let peripheral = {
            let devices = self.inner.devices();
            devices
                .get(device_id)
                .filter(|d| d.state == ConnectionState::Connected)
                .map(|d| d.peripheral.clone())
                .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?
        };
        let rssi = peripheral.properties().await?.and_then(|p| p.rssi);
        Ok(rssi.map(rssi_to_strength).unwrap_or(0))
    }

    async fn get_device_battery_level(&self, device_id: &str) -> Result<u8> {
        let (peripheral, ch) = self
            .inner
            .connected_char(device_id, BATTERY_LEVEL_CHARACTERISTIC)?;
        let raw = peripheral.read(&ch).await?;
        Ok(raw.first().copied().unwrap_or(0).min(100))
    }
}

impl BleHandler {
    /// Link-up, settle, service discovery, and background tasks.  On success
    /// the device is `Connected`.
    async fn establish(
        &self,
        device_id: &str,
        peripheral: &Peripheral,
        profile: DeviceProfile,
    ) -> Result<()> {
        let config = &self.inner.config;

        // BlueZ's Device1.Connect can block forever when the device is out of
        // range or the stack is wedged.
        tokio::time::timeout(config.ble_connect_timeout(), peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(format!("{device_id}: BLE connect")))??;

        // The link is reported up before the remote GATT cache is populated on
        // some stacks; discovering too early fails with "Unlikely error".
        tokio::time::sleep(config.ble_settle_delay()).await;

        tokio::time::timeout(config.ble_discovery_timeout(), peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout(format!("{device_id}: service discovery")))??;

        require_telemetry_service(device_id, &peripheral.services())?;

        let chars: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        info!("{device_id}: {} characteristic(s) discovered", chars.len());

        let tasks = vec![
            spawn_notifications(
                self.inner.clone(),
                device_id.to_owned(),
                peripheral.clone(),
                profile,
            ),
            spawn_disconnect_watcher(self.inner.clone(), device_id.to_owned(), peripheral.clone()),
        ];

        let mut devices = self.inner.devices();
        let dev = devices
            .get_mut(device_id)
            .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;
        dev.chars = chars;
        dev.tasks = tasks;
        dev.state = ConnectionState::Connected;
        Ok(())
    }
}
