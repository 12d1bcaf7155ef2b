//! One connected device and its slot streams.
//!
//! A [`DeviceSession`] connects a device through the dispatcher, subscribes
//! every configured slot, and appends whatever the transport delivers to that
//! slot's [`SlotStream`].  A background task prunes the streams to the
//! configured window so memory stays bounded while nobody is reading.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::dispatch::DeviceDispatcher;
use crate::error::Result;
use crate::handler::{check_slot, now_ms, DisconnectCallback};
use crate::protocol::SLOT_COUNT;
use crate::stream::SlotStream;
use crate::types::{ConnectionState, DeviceProfile, DeviceRecord};

type Streams = Arc<Mutex<[SlotStream; SLOT_COUNT]>>;

fn lock(streams: &Streams) -> MutexGuard<'_, [SlotStream; SLOT_COUNT]> {
    streams.lock().unwrap_or_else(|e| e.into_inner())
}

fn prune_streams(streams: &Streams, oldest_ts: i64) {
    for stream in lock(streams).iter_mut() {
        stream.prune(oldest_ts);
    }
}

pub struct DeviceSession {
    device_id: String,
    dispatcher: Arc<DeviceDispatcher>,
    profile: DeviceProfile,
    streams: Streams,
    retention_ms: i64,
    pruner: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Connect `device_id` and start recording every configured slot.
    ///
    /// `on_disconnect` runs after the streams were cleared, for user- and
    /// device-initiated disconnects alike.
    pub async fn open(
        dispatcher: Arc<DeviceDispatcher>,
        device_id: &str,
        profile: DeviceProfile,
        config: &ClientConfig,
        on_disconnect: DisconnectCallback,
    ) -> Result<Self> {
        let streams: Streams = Arc::new(Mutex::new(Default::default()));

        let forward: DisconnectCallback = {
            let streams = streams.clone();
            Arc::new(move |id: &str| {
                for stream in lock(&streams).iter_mut() {
                    stream.clear();
                }
                on_disconnect(id);
            })
        };
        dispatcher.connect(device_id, profile.clone(), forward).await?;

        let mut session = Self {
            device_id: device_id.to_owned(),
            dispatcher,
            profile,
            streams,
            retention_ms: config.retention_ms(),
            pruner: None,
        };
        if let Err(e) = session.subscribe_all().await {
            warn!("{device_id}: subscribing failed, disconnecting: {e}");
            session.dispatcher.disconnect(device_id).await.ok();
            return Err(e);
        }
        session.pruner = Some(session.spawn_pruner(config));
        info!("{device_id}: session open");
        Ok(session)
    }

    async fn subscribe_all(&self) -> Result<()> {
        let slots: Vec<u8> = self.profile.configured_slots().collect();
        for slot in slots {
            let streams = self.streams.clone();
            self.dispatcher
                .subscribe_slot_signals(
                    &self.device_id,
                    slot,
                    Arc::new(move |slot, batch| {
                        if let Some(s) = lock(&streams).get_mut(slot as usize) {
                            s.add(batch);
                        }
                    }),
                )
                .await?;

            let streams = self.streams.clone();
            self.dispatcher
                .subscribe_slot_metrics(
                    &self.device_id,
                    slot,
                    Arc::new(move |slot, rows| {
                        if let Some(s) = lock(&streams).get_mut(slot as usize) {
                            s.add_metrics(rows);
                        }
                    }),
                )
                .await?;
            debug!("{}: subscribed slot {slot}", self.device_id);
        }
        Ok(())
    }

    fn spawn_pruner(&self, config: &ClientConfig) -> JoinHandle<()> {
        let streams = self.streams.clone();
        let retention_ms = self.retention_ms;
        let interval = config.prune_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                prune_streams(&streams, now_ms() - retention_ms);
            }
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device(&self) -> Option<DeviceRecord> {
        self.dispatcher.device(&self.device_id)
    }

    pub fn dispatcher(&self) -> &Arc<DeviceDispatcher> {
        &self.dispatcher
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.dispatcher.connection_state(&self.device_id)
    }

    /// Drop rows older than `now − (window + margin)` from every slot.
    pub fn prune_to_window(&self, now: i64) {
        prune_streams(&self.streams, now - self.retention_ms);
    }

    /// Run `f` against one slot's stream while holding the session lock.
    /// Keep `f` short: delivery for every slot waits on it.
    pub fn with_stream<R>(&self, slot: u8, f: impl FnOnce(&SlotStream) -> R) -> Result<R> {
        check_slot(slot)?;
        let streams = lock(&self.streams);
        Ok(f(&streams[slot as usize]))
    }

    /// Disconnect the device and discard everything recorded.
    pub async fn close(mut self) -> Result<()> {
        if let Some(pruner) = self.pruner.take() {
            pruner.abort();
        }
        for stream in lock(&self.streams).iter_mut() {
            stream.clear();
        }
        info!("{}: closing session", self.device_id);
        self.dispatcher.disconnect(&self.device_id).await
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.take() {
            pruner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::{EmulatedHandler, EMULATED_DEVICE_ID};
    use crate::error::TransportError;
    use crate::types::{ElementType, SlotParameters};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn profile() -> DeviceProfile {
        DeviceProfile::default().with_slot(
            2,
            SlotParameters {
                channel_count: 2,
                sample_rate_hz: 200.0,
                element_type: ElementType::I16,
                metric_count: 1,
            },
        )
    }

    fn dispatcher_with_tick(tick: Duration) -> Arc<DeviceDispatcher> {
        let d = DeviceDispatcher::new(&ClientConfig::default())
            .with_handler(Arc::new(EmulatedHandler::with_tick(tick)));
        d.register_device(EmulatedHandler::device_record());
        Arc::new(d)
    }

    fn dispatcher() -> Arc<DeviceDispatcher> {
        dispatcher_with_tick(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn emulated_rows_reach_the_configured_slot() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        let session = DeviceSession::open(
            dispatcher(),
            EMULATED_DEVICE_ID,
            profile(),
            &ClientConfig::default(),
            Arc::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let rows = session.with_stream(2, |s| s.len()).unwrap();
        assert!(rows > 0);
        assert_eq!(session.with_stream(2, |s| s.masks().len()).unwrap(), rows);
        assert_eq!(session.with_stream(0, |s| s.len()).unwrap(), 0);
        assert!(matches!(
            session.with_stream(4, |s| s.len()),
            Err(TransportError::InvalidSlot(4))
        ));

        let dispatcher = session.dispatcher().clone();
        session.close().await.unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            dispatcher.connection_state(EMULATED_DEVICE_ID),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn prune_to_window_drops_old_rows() {
        // The first tick fires at once; the next is far enough away not to
        // refill the stream between prune and check.
        let session = DeviceSession::open(
            dispatcher_with_tick(Duration::from_millis(500)),
            EMULATED_DEVICE_ID,
            profile(),
            &ClientConfig::default(),
            Arc::new(|_| {}),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.with_stream(2, |s| s.len()).unwrap(), 100);
        session.prune_to_window(now_ms());
        assert_eq!(session.with_stream(2, |s| s.len()).unwrap(), 100);

        session.prune_to_window(now_ms() + 10 * 60 * 1000);
        assert_eq!(session.with_stream(2, |s| s.len()).unwrap(), 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_fails_to_open() {
        let result = DeviceSession::open(
            dispatcher(),
            "missing",
            profile(),
            &ClientConfig::default(),
            Arc::new(|_| {}),
        )
        .await;
        assert!(matches!(result, Err(TransportError::DeviceNotFound(_))));
    }
}
