use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use biotel_rs::config::ClientConfig;
use biotel_rs::dispatch::DeviceDispatcher;
use biotel_rs::error::{Result, TransportError};
use biotel_rs::frame::{decode_frame, encode_frame, PacketType};
use biotel_rs::handler::DeviceHandler;
use biotel_rs::parse::{encode_metrics_payload, encode_signal_payload};
use biotel_rs::session::DeviceSession;
use biotel_rs::types::{
    ConnectionState, DeviceProfile, DeviceRecord, ElementType, InterfaceType, MaskWord,
    SlotParameters, UioState,
};
use biotel_rs::usb_client::{UsbBackend, UsbHandler, UsbLink};

const DEVICE: &str = "1-4";

// ── In-memory USB ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockLink {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    unplugged: AtomicBool,
    /// Reads never complete while set.
    stalled: AtomicBool,
    reads: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MockLink {
    fn feed(&self, chunk: &[u8]) {
        self.chunks.lock().unwrap().push_back(chunk.to_vec());
    }
}

#[async_trait]
impl UsbLink for MockLink {
    async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged").into());
        }
        let mut chunk = self.chunks.lock().unwrap().pop_front().unwrap_or_default();
        chunk.truncate(max_len);
        Ok(chunk)
    }

    async fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint stalled").into());
        }
        self.written.lock().unwrap().push(data);
        Ok(())
    }
}

struct MockBackend {
    link: Arc<MockLink>,
}

#[async_trait]
impl UsbBackend for MockBackend {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(vec![DeviceRecord {
            id: DEVICE.into(),
            interface_type: InterfaceType::Usb,
            name: "Biotel USB".into(),
        }])
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn UsbLink>> {
        if device_id == DEVICE {
            Ok(self.link.clone() as Arc<dyn UsbLink>)
        } else {
            Err(TransportError::DeviceNotFound(device_id.into()))
        }
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        usb_poll_interval_ms: 5,
        ..ClientConfig::default()
    }
}

fn profile() -> DeviceProfile {
    DeviceProfile::default().with_slot(
        0,
        SlotParameters {
            channel_count: 2,
            sample_rate_hz: 100.0,
            element_type: ElementType::I16,
            metric_count: 2,
        },
    )
}

fn setup() -> (Arc<MockLink>, UsbHandler, Arc<DeviceDispatcher>) {
    let link = Arc::new(MockLink::default());
    let handler = UsbHandler::new(Arc::new(MockBackend { link: link.clone() }), &config());
    let dispatcher = DeviceDispatcher::new(&config()).with_handler(Arc::new(handler.clone()));
    (link, handler, Arc::new(dispatcher))
}

fn signal_frame(rows: usize) -> [u8; 248] {
    let rows: Vec<(MaskWord, Vec<f64>)> = (0..rows)
        .map(|i| (MaskWord::new(1, 3, 0), vec![i as f64, -(i as f64)]))
        .collect();
    let payload = encode_signal_payload(&rows, ElementType::I16);
    encode_frame(0, PacketType::Signal, &payload).unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn open_session(
    dispatcher: &Arc<DeviceDispatcher>,
    disconnects: Arc<AtomicUsize>,
) -> DeviceSession {
    let found = dispatcher
        .scan(InterfaceType::Usb, Arc::new(|_| true), Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    DeviceSession::open(
        dispatcher.clone(),
        DEVICE,
        profile(),
        &config(),
        Arc::new(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_one_frame_yields_five_evenly_spaced_rows() {
    let (_link, handler, dispatcher) = setup();
    let session = open_session(&dispatcher, Arc::new(AtomicUsize::new(0))).await;

    assert_eq!(handler.enqueue(DEVICE, &signal_frame(5)).unwrap(), 1);

    let (signals, masks) = session
        .with_stream(0, |s| {
            let signals: Vec<i64> = s.signals().iter().map(|r| r.timestamp_ms).collect();
            let masks: Vec<i64> = s.masks().iter().map(|r| r.timestamp_ms).collect();
            (signals, masks)
        })
        .unwrap();
    assert_eq!(signals.len(), 5);
    assert_eq!(masks, signals);
    for pair in signals.windows(2) {
        assert_eq!(pair[1] - pair[0], 10);
    }
    let channels = session
        .with_stream(0, |s| s.signals().back().map(|r| r.channels.clone()))
        .unwrap();
    assert_eq!(channels, Some(vec![4.0, -4.0]));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_poller_reassembles_split_frames_after_garbage() {
    let (link, _handler, dispatcher) = setup();
    let session = open_session(&dispatcher, Arc::new(AtomicUsize::new(0))).await;

    let frame = signal_frame(3);
    let mut stream = vec![0x13];
    stream.extend_from_slice(&frame);
    stream.extend_from_slice(&frame);
    link.feed(&stream[..100]);
    link.feed(&stream[100..300]);
    link.feed(&stream[300..]);

    assert!(wait_for(|| session.with_stream(0, |s| s.len()).unwrap() == 6).await);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_metrics_frame_is_truncated_to_metric_count() {
    let (_link, handler, dispatcher) = setup();
    let session = open_session(&dispatcher, Arc::new(AtomicUsize::new(0))).await;

    let payload = encode_metrics_payload(&[1.5, 2.5, 3.5]);
    let frame = encode_frame(0, PacketType::Metrics, &payload).unwrap();
    handler.enqueue(DEVICE, &frame).unwrap();

    let values = session
        .with_stream(0, |s| s.metrics().front().map(|r| r.values.clone()))
        .unwrap();
    assert_eq!(values, Some(vec![1.5, 2.5]));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_unplugged_device_reports_disconnect() {
    let (link, handler, dispatcher) = setup();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let session = open_session(&dispatcher, disconnects.clone()).await;
    handler.enqueue(DEVICE, &signal_frame(2)).unwrap();

    link.unplugged.store(true, Ordering::SeqCst);
    assert!(wait_for(|| disconnects.load(Ordering::SeqCst) == 1).await);

    assert_eq!(handler.connection_state(DEVICE), ConnectionState::Disconnected);
    assert_eq!(session.with_stream(0, |s| s.len()).unwrap(), 0);
    assert!(matches!(
        handler.enqueue(DEVICE, &signal_frame(1)),
        Err(TransportError::NotConnected(_))
    ));
    assert!(matches!(
        dispatcher.get_uio_state(DEVICE).await,
        Err(TransportError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_operations_require_connection() {
    let (_link, handler, _dispatcher) = setup();
    assert_eq!(handler.connection_state(DEVICE), ConnectionState::Disconnected);
    assert!(matches!(
        handler.subscribe_slot_signals(DEVICE, 0, Arc::new(|_, _| {})).await,
        Err(TransportError::NotConnected(_))
    ));
    assert!(matches!(handler.disconnect(DEVICE).await, Err(TransportError::NotConnected(_))));
    assert!(matches!(
        handler.get_device_battery_level(DEVICE).await,
        Err(TransportError::NotConnected(_))
    ));
    assert!(matches!(
        handler.enqueue(DEVICE, &[0x55]),
        Err(TransportError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_connect_twice_and_unknown_device() {
    let (_link, handler, _dispatcher) = setup();
    handler
        .connect(DEVICE, profile(), Arc::new(|_| {}))
        .await
        .unwrap();
    assert!(matches!(
        handler.connect(DEVICE, profile(), Arc::new(|_| {})).await,
        Err(TransportError::AlreadyConnected(_))
    ));
    assert!(matches!(
        handler.connect("9-9", profile(), Arc::new(|_| {})).await,
        Err(TransportError::DeviceNotFound(_))
    ));
    assert_eq!(handler.connection_state("9-9"), ConnectionState::Disconnected);

    assert!(matches!(
        handler.subscribe_slot_metrics(DEVICE, 1, Arc::new(|_, _| {})).await,
        Err(TransportError::Configuration(_))
    ));
    assert!(matches!(
        handler.subscribe_slot_metrics(DEVICE, 7, Arc::new(|_, _| {})).await,
        Err(TransportError::InvalidSlot(7))
    ));
    assert_eq!(handler.get_device_strength(DEVICE).await.unwrap(), 100);
    assert_eq!(handler.get_device_battery_level(DEVICE).await.unwrap(), 100);
    handler.disconnect(DEVICE).await.unwrap();
}

#[tokio::test]
async fn test_uio_state_is_written_as_a_frame_and_reported_back() {
    let (link, handler, dispatcher) = setup();
    let session = open_session(&dispatcher, Arc::new(AtomicUsize::new(0))).await;

    let state = UioState::default().with_line(0, true).with_line(9, true);
    dispatcher.set_uio_state(DEVICE, state).await.unwrap();
    assert_eq!(dispatcher.get_uio_state(DEVICE).await.unwrap(), state);

    let written = link.written.lock().unwrap().clone();
    assert_eq!(written.len(), 1);
    let frame = decode_frame(&written[0]).unwrap();
    assert_eq!(frame.slot, 0);
    assert_eq!(frame.packet_type, PacketType::Uio);
    assert!(frame.crc_valid);
    assert_eq!(&frame.data[..2], &state.lines.to_le_bytes());

    let reported = Arc::new(Mutex::new(None));
    let r = reported.clone();
    dispatcher
        .subscribe_uio(DEVICE, Arc::new(move |s| *r.lock().unwrap() = Some(s)))
        .await
        .unwrap();
    let device_state = UioState { lines: 0x8001 };
    let frame = encode_frame(0, PacketType::Uio, &device_state.lines.to_le_bytes()).unwrap();
    handler.enqueue(DEVICE, &frame).unwrap();
    assert_eq!(*reported.lock().unwrap(), Some(device_state));
    assert_eq!(dispatcher.get_uio_state(DEVICE).await.unwrap(), device_state);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_uio_write_tears_the_device_down() {
    let (link, handler, dispatcher) = setup();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let session = open_session(&dispatcher, disconnects.clone()).await;
    handler.enqueue(DEVICE, &signal_frame(2)).unwrap();

    link.fail_writes.store(true, Ordering::SeqCst);
    let result = dispatcher.set_uio_state(DEVICE, UioState { lines: 1 }).await;
    assert!(matches!(result, Err(TransportError::Io(_))));

    assert_eq!(handler.connection_state(DEVICE), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(session.with_stream(0, |s| s.len()).unwrap(), 0);
    assert!(matches!(
        dispatcher.get_uio_state(DEVICE).await,
        Err(TransportError::NotConnected(_))
    ));

    // The poll task exits instead of reporting the device lost a second time.
    link.unplugged.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stalled_read_is_abandoned_after_poll_interval() {
    let (link, _handler, dispatcher) = setup();
    link.stalled.store(true, Ordering::SeqCst);
    let session = open_session(&dispatcher, Arc::new(AtomicUsize::new(0))).await;

    assert!(wait_for(|| link.reads.load(Ordering::SeqCst) >= 3).await);

    link.stalled.store(false, Ordering::SeqCst);
    link.feed(&signal_frame(4));
    assert!(wait_for(|| session.with_stream(0, |s| s.len()).unwrap() == 4).await);
    session.close().await.unwrap();
}
