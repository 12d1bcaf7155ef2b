//! USB transport: vendor-specific bulk interface carrying 248-byte frames.
//!
//! The device streams frames back-to-back with no length prefix; USB
//! transfers split that stream at arbitrary points.  Each connected device
//! gets a [`FrameFifo`] that reassembles frames from whatever chunks the
//! bulk-in poll returns.
//!
//! Raw I/O sits behind [`UsbBackend`] / [`UsbLink`] so the handler can run
//! against real hardware ([`NusbBackend`]) or an in-memory link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use nusb::transfer::{Direction, EndpointType, Queue, RequestBuffer};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ClientConfig;
use crate::error::{Result, TransportError};
use crate::frame::{encode_frame, FrameFifo, PacketType};
use crate::handler::{
    check_slot, now_ms, Delivery, DeviceHandler, DisconnectCallback, MetricsCallback,
    ScanCallback, SignalCallback, SubscriptionTable, UioCallback,
};
use crate::parse::encode_uio_state;
use crate::protocol::{USB_SENTINEL_LEVEL, USB_VENDOR_INTERFACE_CLASS};
use crate::types::{ConnectionState, DeviceProfile, DeviceRecord, InterfaceType, UioState};

// ── Backend seam ─────────────────────────────────────────────────────────────

/// Enumerates and opens USB devices.
#[async_trait]
pub trait UsbBackend: Send + Sync {
    /// Devices exposing a telemetry interface.
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Open a device and claim its telemetry interface.  Dropping the
    /// returned link releases the interface and closes the device.
    async fn open(&self, device_id: &str) -> Result<Arc<dyn UsbLink>>;
}

/// Bulk I/O on a claimed telemetry interface.
#[async_trait]
pub trait UsbLink: Send + Sync {
    /// One bulk-in transfer of at most `max_len` bytes.
    ///
    /// The poller drops this future when the poll interval elapses, so an
    /// implementation must not lose data when cancelled.
    async fn read(&self, max_len: usize) -> Result<Vec<u8>>;

    /// One bulk-out transfer.
    async fn write(&self, data: Vec<u8>) -> Result<()>;
}

// ── nusb backend ─────────────────────────────────────────────────────────────

/// [`UsbBackend`] over the platform USB stack via `nusb`.
///
/// A device qualifies when one of its interfaces has class `0xFF`
/// (vendor-specific) with a bulk IN and a bulk OUT endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

fn nusb_device_id(info: &nusb::DeviceInfo) -> String {
    format!("{}-{}", info.bus_number(), info.device_address())
}

fn has_vendor_interface(info: &nusb::DeviceInfo) -> bool {
    info.interfaces()
        .any(|i| i.class() == USB_VENDOR_INTERFACE_CLASS)
}

/// Vendor-specific interface location: `(configuration, interface, ep in, ep out)`.
fn find_vendor_interface(device: &nusb::Device) -> Option<(u8, u8, u8, u8)> {
    for config in device.configurations() {
        for alt in config.interface_alt_settings() {
            if alt.class() != USB_VENDOR_INTERFACE_CLASS {
                continue;
            }
            let bulk = |dir: Direction| {
                alt.endpoints()
                    .find(|e| e.transfer_type() == EndpointType::Bulk && e.direction() == dir)
                    .map(|e| e.address())
            };
            if let (Some(ep_in), Some(ep_out)) = (bulk(Direction::In), bulk(Direction::Out)) {
                return Some((
                    config.configuration_value(),
                    alt.interface_number(),
                    ep_in,
                    ep_out,
                ));
            }
        }
    }
    None
}

#[async_trait]
impl UsbBackend for NusbBackend {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let found = nusb::list_devices()?
            .filter(has_vendor_interface)
            .map(|info| DeviceRecord {
                id: nusb_device_id(&info),
                interface_type: InterfaceType::Usb,
                name: info
                    .product_string()
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("USB {:04x}:{:04x}", info.vendor_id(), info.product_id())),
            })
            .collect();
        Ok(found)
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn UsbLink>> {
        let info = nusb::list_devices()?
            .find(|i| nusb_device_id(i) == device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_owned()))?;
        let device = info.open()?;

        let (config_value, interface_number, ep_in, ep_out) = find_vendor_interface(&device)
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "{device_id}: no vendor-specific interface with bulk endpoints"
                ))
            })?;

        let active = device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active != Some(config_value) {
            debug!("{device_id}: selecting configuration {config_value}");
            device.set_configuration(config_value)?;
        }

        let interface = device.claim_interface(interface_number)?;
        info!(
            "{device_id}: claimed interface {interface_number} (in 0x{ep_in:02x}, out 0x{ep_out:02x})"
        );
        Ok(Arc::new(NusbLink {
            reads: tokio::sync::Mutex::new(interface.bulk_in_queue(ep_in)),
            interface,
            ep_out,
        }))
    }
}

struct NusbLink {
    interface: nusb::Interface,
    /// At most one bulk-in transfer is in flight.  A read abandoned by the
    /// poller leaves it queued and the next read collects it.
    reads: tokio::sync::Mutex<Queue<RequestBuffer>>,
    ep_out: u8,
}

#[async_trait]
impl UsbLink for NusbLink {
    async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        let mut reads = self.reads.lock().await;
        if reads.pending() == 0 {
            reads.submit(RequestBuffer::new(max_len));
        }
        let data = reads.next_complete().await.into_result()?;
        Ok(data)
    }

    async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.interface
            .bulk_out(self.ep_out, data)
            .await
            .into_result()?;
        Ok(())
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

struct UsbDevice {
    state: ConnectionState,
    link: Option<Arc<dyn UsbLink>>,
    fifo: FrameFifo,
    delivery: Delivery,
    uio: UioState,
    poller: Option<JoinHandle<()>>,
    on_disconnect: DisconnectCallback,
    frames: u64,
}

struct UsbInner {
    backend: Arc<dyn UsbBackend>,
    poll_interval: Duration,
    read_len: usize,
    devices: Mutex<HashMap<String, UsbDevice>>,
    subs: SubscriptionTable,
}

/// [`DeviceHandler`] for USB-attached devices.
///
/// Per device: a poll task reads one bulk-in transfer every poll interval and
/// feeds it to [`UsbHandler::enqueue`].  Subscriptions are plain callback
/// registrations; no request is sent to the device.
#[derive(Clone)]
pub struct UsbHandler {
    inner: Arc<UsbInner>,
}

impl UsbHandler {
    pub fn new(backend: Arc<dyn UsbBackend>, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(UsbInner {
                backend,
                poll_interval: config.usb_poll_interval(),
                read_len: config.usb_read_len,
                devices: Mutex::new(HashMap::new()),
                subs: SubscriptionTable::new(),
            }),
        }
    }

    /// Handler backed by the platform USB stack.
    pub fn with_nusb(config: &ClientConfig) -> Self {
        Self::new(Arc::new(NusbBackend), config)
    }

    /// Feed a chunk of the device's byte stream, decode every completed frame,
    /// and dispatch it to its subscriber.  Returns the number of frames
    /// decoded.
    ///
    /// Fails with [`TransportError::NotConnected`] (and drops the bytes) if
    /// the device is not connected, e.g. when a disconnect raced the read
    /// that produced them.
    pub fn enqueue(&self, device_id: &str, chunk: &[u8]) -> Result<usize> {
        self.inner.enqueue(device_id, chunk)
    }
}

impl UsbInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, UsbDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, device_id: &str) -> ConnectionState {
        self.lock()
            .get(device_id)
            .map(|d| d.state)
            .unwrap_or_default()
    }

    fn enqueue(&self, device_id: &str, chunk: &[u8]) -> Result<usize> {
        let mut devices = self.lock();
        let dev = devices
            .get_mut(device_id)
            .filter(|d| d.state == ConnectionState::Connected)
            .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;

        let frames = dev.fifo.push(chunk);
        let now = now_ms();
        for frame in &frames {
            dev.frames += 1;
            if dev.frames <= 3 || dev.frames % 500 == 0 {
                info!(
                    "{device_id}: frame #{} slot={} type={:?} crc_ok={}",
                    dev.frames, frame.slot, frame.packet_type, frame.crc_valid
                );
            }
            if let Some(state) =
                dev.delivery
                    .deliver(&self.subs, frame.slot, frame.packet_type, &frame.data, now)
            {
                dev.uio = state;
            }
        }
        Ok(frames.len())
    }

    /// Link to a connected device, or `NotConnected`.
    fn connected_link(&self, device_id: &str) -> Result<Arc<dyn UsbLink>> {
        self.lock()
            .get(device_id)
            .filter(|d| d.state == ConnectionState::Connected)
            .and_then(|d| d.link.clone())
            .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))
    }

    fn require_connected<T>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut UsbDevice) -> Result<T>,
    ) -> Result<T> {
        let mut devices = self.lock();
        match devices.get_mut(device_id) {
            Some(dev) if dev.state == ConnectionState::Connected => f(dev),
            _ => Err(TransportError::NotConnected(device_id.to_owned())),
        }
    }

    /// Tear down after a failed transfer.  The poll task sees the entry gone
    /// and exits on its next tick.
    fn device_lost(&self, device_id: &str) {
        let removed = self.lock().remove(device_id);
        self.subs.remove_device(device_id);
        if let Some(dev) = removed {
            info!("{device_id}: USB device disconnected");
            (dev.on_disconnect)(device_id);
        }
    }
}

fn spawn_poller(inner: Arc<UsbInner>, device_id: String, link: Arc<dyn UsbLink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if inner.state(&device_id) != ConnectionState::Connected {
                break;
            }
            let read = tokio::time::timeout(inner.poll_interval, link.read(inner.read_len)).await;
            let Ok(read) = read else {
                continue;
            };
            match read {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => {
                    if let Err(e) = inner.enqueue(&device_id, &bytes) {
                        debug!("{device_id}: dropping {} byte(s) read during teardown: {e}", bytes.len());
                        break;
                    }
                }
                Err(e) => {
                    if inner.state(&device_id) == ConnectionState::Connected {
                        warn!("{device_id}: bulk read failed: {e}");
                        inner.device_lost(&device_id);
                    }
                    break;
                }
            }
        }
        debug!("{device_id}: poll task finished");
    })
}

#[async_trait]
impl DeviceHandler for UsbHandler {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Usb
    }

    async fn start_scan(&self, on_found: ScanCallback) -> Result<()> {
        for record in self.inner.backend.list_devices().await? {
            debug!("USB scan: found {} ({})", record.name, record.id);
            if on_found(record) {
                break;
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        false
    }

    /// USB has no active rediscovery: known ids are assumed present.
    async fn refresh_previous(&self, known: &[DeviceRecord]) -> Result<Vec<DeviceRecord>> {
        Ok(known
            .iter()
            .filter(|d| d.interface_type == InterfaceType::Usb)
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        device_id: &str,
        profile: DeviceProfile,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        {
            let mut devices = self.inner.lock();
            if devices.contains_key(device_id) {
                return Err(TransportError::AlreadyConnected(device_id.to_owned()));
            }
            devices.insert(
                device_id.to_owned(),
                UsbDevice {
                    state: ConnectionState::Connecting,
                    link: None,
                    fifo: FrameFifo::new(),
                    delivery: Delivery::new(device_id, profile),
                    uio: UioState::default(),
                    poller: None,
                    on_disconnect,
                    frames: 0,
                },
            );
        }

        let link = match self.inner.backend.open(device_id).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.lock().remove(device_id);
                return Err(e);
            }
        };

        let mut devices = self.inner.lock();
        let dev = devices
            .get_mut(device_id)
            .ok_or_else(|| TransportError::NotConnected(device_id.to_owned()))?;
        dev.link = Some(link.clone());
        dev.state = ConnectionState::Connected;
        dev.poller = Some(spawn_poller(self.inner.clone(), device_id.to_owned(), link));
        info!("{device_id}: USB connected");
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let poller = self.inner.require_connected(device_id, |dev| {
            dev.state = ConnectionState::Disconnecting;
            Ok(dev.poller.take())
        })?;
        if let Some(poller) = poller {
            poller.abort();
        }

        let removed = self.inner.lock().remove(device_id);
        self.inner.subs.remove_device(device_id);
        info!("{device_id}: USB disconnected");
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

    async fn set_uio_state(&self, device_id: &str, state: UioState) -> Result<()> {
        let link = self.inner.connected_link(device_id)?;
        let frame = encode_frame(0, PacketType::Uio, &encode_uio_state(state))?;
        if let Err(e) = link.write(frame.to_vec()).await {
            warn!("{device_id}: UIO write failed: {e}");
            self.inner.device_lost(device_id);
            return Err(e);
        }
        self.inner.require_connected(device_id, |dev| {
            dev.uio = state;
            Ok(())
        })
    }

    async fn get_device_strength(&self, device_id: &str) -> Result<u8> {
        self.inner
            .require_connected(device_id, |_| Ok(USB_SENTINEL_LEVEL))
    }

    async fn get_device_battery_level(&self, device_id: &str) -> Result<u8> {
        self.inner
            .require_connected(device_id, |_| Ok(USB_SENTINEL_LEVEL))
    }
}
