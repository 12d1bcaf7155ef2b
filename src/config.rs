use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{BLE_SETTLE_DELAY, USB_POLL_INTERVAL};

/// Runtime configuration shared by the transports, the dispatcher, and
/// device sessions.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```
/// # use biotel_rs::config::ClientConfig;
/// let cfg: ClientConfig = serde_json::from_str(r#"{ "windowSecs": 30 }"#).unwrap();
/// assert_eq!(cfg.window_secs, 30);
/// assert_eq!(cfg.usb_poll_interval_ms, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// BLE scans only report devices whose advertised name starts with this.
    /// Default: `"Biotel"`.
    pub name_prefix: String,
    /// How long a dispatcher scan runs before it is stopped.  Default: 10 s.
    pub scan_timeout_ms: u64,
    /// Tick of the dispatcher's scan wait loop.  Default: 50 ms.
    pub scan_poll_interval_ms: u64,
    /// Duration of the active BLE scan used to re-find known devices.
    /// Default: 4 s.
    pub refresh_scan_ms: u64,
    /// Interval between USB bulk-in polls.  Default: 100 ms.
    pub usb_poll_interval_ms: u64,
    /// Size of each USB bulk-in request.  Default: 4096.
    pub usb_read_len: usize,
    /// Hard timeout on the BLE link-layer connect.  Default: 10 s.
    pub ble_connect_timeout_secs: u64,
    /// Hard timeout on GATT service discovery.  Default: 15 s.
    pub ble_discovery_timeout_secs: u64,
    /// Pause between BLE connect and service discovery.  Default: 600 ms.
    pub ble_settle_delay_ms: u64,
    /// Dashboard window kept in each slot stream.  Default: 60 s.
    pub window_secs: u64,
    /// Extra history kept beyond the window.  Default: 5 s.
    pub window_margin_secs: u64,
    /// Interval of the session's pruning task.  Default: 1 s.
    pub prune_interval_ms: u64,
    /// Register the emulated transport with the dispatcher.  Default: `false`.
    pub enable_emulated: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name_prefix: "Biotel".into(),
            scan_timeout_ms: 10_000,
            scan_poll_interval_ms: 50,
            refresh_scan_ms: 4_000,
            usb_poll_interval_ms: USB_POLL_INTERVAL.as_millis() as u64,
            usb_read_len: 4096,
            ble_connect_timeout_secs: 10,
            ble_discovery_timeout_secs: 15,
            ble_settle_delay_ms: BLE_SETTLE_DELAY.as_millis() as u64,
            window_secs: 60,
            window_margin_secs: 5,
            prune_interval_ms: 1_000,
            enable_emulated: false,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scan_poll_interval_ms.max(1))
    }

    pub fn refresh_scan(&self) -> Duration {
        Duration::from_millis(self.refresh_scan_ms)
    }

    pub fn usb_poll_interval(&self) -> Duration {
        Duration::from_millis(self.usb_poll_interval_ms.max(1))
    }

    pub fn ble_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ble_connect_timeout_secs)
    }

    pub fn ble_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.ble_discovery_timeout_secs)
    }

    pub fn ble_settle_delay(&self) -> Duration {
        Duration::from_millis(self.ble_settle_delay_ms)
    }

    /// Window plus margin in milliseconds: the history a session retains.
    pub fn retention_ms(&self) -> i64 {
        ((self.window_secs + self.window_margin_secs) * 1000) as i64
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms.max(1))
    }
}
