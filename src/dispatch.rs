//! Device dispatch: routes every device operation to the handler of the
//! device's transport.
//!
//! The dispatcher is an explicit value handed to its consumers; there is no
//! process-wide transport selection.  It holds one handler per
//! [`InterfaceType`] and a table of every device seen by a scan or
//! rediscovery pass, which is how a bare device id is mapped to its handler.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::ble_client::BleHandler;
use crate::config::ClientConfig;
use crate::emulated::EmulatedHandler;
use crate::error::{Result, TransportError};
use crate::handler::{
    DeviceHandler, DisconnectCallback, MetricsCallback, ScanCallback, SignalCallback, UioCallback,
};
use crate::types::{ConnectionState, DeviceProfile, DeviceRecord, InterfaceType, UioState};
use crate::usb_client::UsbHandler;

pub struct DeviceDispatcher {
    handlers: HashMap<InterfaceType, Arc<dyn DeviceHandler>>,
    devices: Arc<Mutex<HashMap<String, DeviceRecord>>>,
    scan_poll_interval: Duration,
}

impl DeviceDispatcher {
    /// Dispatcher with no handlers; add them with [`with_handler`](Self::with_handler).
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            devices: Arc::new(Mutex::new(HashMap::new())),
            scan_poll_interval: config.scan_poll_interval(),
        }
    }

    /// Register `handler` for its interface type, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn DeviceHandler>) -> Self {
        self.handlers.insert(handler.interface_type(), handler);
        self
    }

    /// Every transport the platform offers: USB always, BLE when an adapter
    /// is present, and the emulated device when enabled in `config`.
    pub async fn platform_default(config: &ClientConfig) -> Self {
        let mut dispatcher =
            Self::new(config).with_handler(Arc::new(UsbHandler::with_nusb(config)));
        match BleHandler::new(config.clone()).await {
            Ok(ble) => dispatcher = dispatcher.with_handler(Arc::new(ble)),
            Err(e) => warn!("BLE unavailable: {e}"),
        }
        if config.enable_emulated {
            dispatcher = dispatcher.with_handler(Arc::new(EmulatedHandler::new()));
        }
        info!("transports: {:?}", dispatcher.interfaces());
        dispatcher
    }

    pub fn interfaces(&self) -> Vec<InterfaceType> {
        let mut types: Vec<InterfaceType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Handler for `interface`, or `HandlerUnavailable`.
    pub fn handler(&self, interface: InterfaceType) -> Result<Arc<dyn DeviceHandler>> {
        self.handlers
            .get(&interface)
            .cloned()
            .ok_or(TransportError::HandlerUnavailable(interface))
    }

    // ── Device table ─────────────────────────────────────────────────────────

    pub fn register_device(&self, record: DeviceRecord) {
        register(&self.devices, record);
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.lock().ok()?.get(device_id).cloned()
    }

    pub fn known_devices(&self) -> Vec<DeviceRecord> {
        let mut all: Vec<DeviceRecord> = self
            .devices
            .lock()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Handler of a device seen by a previous scan.
    ///
    /// Fails with `DeviceNotFound` for an id no scan has reported and with
    /// `HandlerUnavailable` when its transport is not registered.
    pub fn get_device_handler(&self, device_id: &str) -> Result<Arc<dyn DeviceHandler>> {
        let record = self
            .device(device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_owned()))?;
        self.handler(record.interface_type)
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Scan one transport until `on_found` returns `true` or `timeout`
    /// elapses, then make sure the handler has stopped.
    ///
    /// Returns every device reported during the scan.  A discovery arriving
    /// after the scan stopped is still registered, but not returned.
    pub async fn scan(
        &self,
        interface: InterfaceType,
        on_found: ScanCallback,
        timeout: Duration,
    ) -> Result<Vec<DeviceRecord>> {
        let handler = self.handler(interface)?;
        let found = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));

        let wrapped: ScanCallback = {
            let devices = self.devices.clone();
            let found = found.clone();
            let done = done.clone();
            Arc::new(move |record: DeviceRecord| {
                register(&devices, record.clone());
                if let Ok(mut f) = found.lock() {
                    f.push(record.clone());
                }
                let stop = on_found(record);
                if stop {
                    done.store(true, Ordering::SeqCst);
                }
                stop
            })
        };

        info!("{interface} scan for up to {} ms", timeout.as_millis());
        handler.start_scan(wrapped).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while handler.is_scanning()
            && !done.load(Ordering::SeqCst)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(self.scan_poll_interval).await;
        }
        if handler.is_scanning() {
            handler.stop_scan().await?;
        }

        let found = found.lock().map(|f| f.clone()).unwrap_or_default();
        info!("{interface} scan finished: {} device(s)", found.len());
        Ok(found)
    }

    pub async fn stop_scan(&self, interface: InterfaceType) -> Result<()> {
        self.handler(interface)?.stop_scan().await
    }

    /// Re-find previously known devices, one rediscovery pass per transport
    /// present among `known`.  `on_found` sees each device found again.
    ///
    /// A transport that is not available here, or whose pass fails, is
    /// logged and skipped.
    pub async fn refresh_previous_devices(
        &self,
        known: &[DeviceRecord],
        on_found: impl Fn(&DeviceRecord) + Send + Sync,
    ) -> Result<Vec<DeviceRecord>> {
        if self.handlers.is_empty() {
            return Err(TransportError::NoInterfacesAvailable);
        }
        let interfaces: BTreeSet<InterfaceType> = known.iter().map(|d| d.interface_type).collect();

        let mut refreshed = Vec::new();
        for interface in interfaces {
            let Some(handler) = self.handlers.get(&interface) else {
                warn!("refresh: no {interface} transport on this platform");
                continue;
            };
            match handler.refresh_previous(known).await {
                Ok(records) => {
                    for record in records {
                        self.register_device(record.clone());
                        on_found(&record);
                        refreshed.push(record);
                    }
                }
                Err(e) => warn!("refresh over {interface} failed: {e}"),
            }
        }
        Ok(refreshed)
    }

    // ── Forwarded device operations ──────────────────────────────────────────

    pub async fn connect(
        &self,
        device_id: &str,
        profile: DeviceProfile,
        on_disconnect: DisconnectCallback,
    ) -> Result<()> {
        self.get_device_handler(device_id)?
            .connect(device_id, profile, on_disconnect)
            .await
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.get_device_handler(device_id)?.disconnect(device_id).await
    }

    pub fn connection_state(&self, device_id: &str) -> ConnectionState {
        self.get_device_handler(device_id)
            .map(|h| h.connection_state(device_id))
            .unwrap_or_default()
    }

    pub async fn subscribe_slot_signals(
        &self,
        device_id: &str,
        slot: u8,
        callback: SignalCallback,
    ) -> Result<()> {
        self.get_device_handler(device_id)?
            .subscribe_slot_signals(device_id, slot, callback)
            .await
    }

    pub async fn subscribe_slot_metrics(
        &self,
        device_id: &str,
        slot: u8,
        callback: MetricsCallback,
    ) -> Result<()> {
        self.get_device_handler(device_id)?
            .subscribe_slot_metrics(device_id, slot, callback)
            .await
    }

    pub async fn subscribe_uio(&self, device_id: &str, callback: UioCallback) -> Result<()> {
        self.get_device_handler(device_id)?
            .subscribe_uio(device_id, callback)
            .await
    }

    pub async fn get_uio_state(&self, device_id: &str) -> Result<UioState> {
        self.get_device_handler(device_id)?.get_uio_state(device_id).await
    }

    pub async fn set_uio_state(&self, device_id: &str, state: UioState) -> Result<()> {
        self.get_device_handler(device_id)?
            .set_uio_state(device_id, state)
            .await
    }

    pub async fn get_device_strength(&self, device_id: &str) -> Result<u8> {
        self.get_device_handler(device_id)?
            .get_device_strength(device_id)
            .await
    }

    pub async fn get_device_battery_level(&self, device_id: &str) -> Result<u8> {
        self.get_device_handler(device_id)?
            .get_device_battery_level(device_id)
            .await
    }
}

fn register(devices: &Mutex<HashMap<String, DeviceRecord>>, record: DeviceRecord) {
    if let Ok(mut table) = devices.lock() {
        table.insert(record.id.clone(), record);
    }
}
