//! # biotel-rs
//!
//! Async Rust library and command-line monitor for streaming multi-slot
//! biosignal telemetry from acquisition devices over USB or Bluetooth Low
//! Energy.
//!
//! ## Transports
//!
//! | Transport | Framing | Strength / battery | Notes |
//! |---|---|---|---|
//! | USB | 248-byte frames, CRC16, reassembly FIFO | fixed 100 | vendor-specific bulk interface, polled every 100 ms |
//! | BLE | one payload per GATT notification | RSSI / Battery Level characteristic | one signal + one metric characteristic per slot |
//! | Emulated | none | fixed 100 | synthetic device `emulated-0`, no hardware needed |
//!
//! Every transport implements [`handler::DeviceHandler`] and feeds the same
//! payload decoders, so downstream code never depends on how a device is
//! attached.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use biotel_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::default();
//!     let dispatcher = Arc::new(DeviceDispatcher::platform_default(&config).await);
//!
//!     let found = dispatcher
//!         .scan(InterfaceType::Usb, Arc::new(|_| true), config.scan_timeout())
//!         .await?;
//!     let device = found.first().ok_or_else(|| anyhow::anyhow!("no device"))?;
//!
//!     let profile = DeviceProfile::from_json_file("profile.json")?;
//!     let session =
//!         DeviceSession::open(dispatcher, &device.id, profile, &config, Arc::new(|_| {})).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     let rows = session.with_stream(0, |s| s.len())?;
//!     println!("slot 0: {rows} rows");
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`dispatch`] | Routes device operations to the right transport; scan and rediscovery |
//! | [`session`] | Per-device slot streams with bounded-window pruning |
//! | [`handler`] | The transport contract, callback types, and shared payload delivery |
//! | [`ble_client`] | BLE transport (btleplug) |
//! | [`usb_client`] | USB transport (nusb) and its backend seam |
//! | [`emulated`] | Synthetic transport |
//! | [`frame`] | USB frame codec, CRC16, and reassembly FIFO |
//! | [`parse`] | Signal, metric, and UIO payload decoders and encoders |
//! | [`stream`] | Slot stream store and its derived mask views |
//! | [`types`] | Slot parameters, rows, mask word, device records |
//! | [`protocol`] | Wire constants, UUIDs, timing defaults |
//! | [`config`] | Runtime configuration |
//! | [`error`] | Error types |

pub mod ble_client;
pub mod config;
pub mod dispatch;
pub mod emulated;
pub mod error;
pub mod frame;
pub mod handler;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod types;
pub mod usb_client;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Dispatch and sessions ─────────────────────────────────────────────────
    pub use crate::config::ClientConfig;
    pub use crate::dispatch::DeviceDispatcher;
    pub use crate::session::DeviceSession;

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::ble_client::BleHandler;
    pub use crate::emulated::{EmulatedHandler, EMULATED_DEVICE_ID};
    pub use crate::handler::{
        DeviceHandler, DisconnectCallback, MetricsCallback, ScanCallback, SignalCallback,
        UioCallback,
    };
    pub use crate::usb_client::{UsbBackend, UsbHandler, UsbLink};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::error::TransportError;
    pub use crate::stream::{SegmentBound, SlotStream};
    pub use crate::types::{
        ConnectionState, DeviceProfile, DeviceRecord, ElementType, InterfaceType, MaskRow,
        MaskWord, MetricRow, SignalBatch, SignalRow, SlotParameters, UioState,
    };
}
