use std::sync::{Arc, Mutex};
use std::time::Duration;

use biotel_rs::config::ClientConfig;
use biotel_rs::dispatch::DeviceDispatcher;
use biotel_rs::emulated::{EmulatedHandler, EMULATED_DEVICE_ID};
use biotel_rs::error::TransportError;
use biotel_rs::session::DeviceSession;
use biotel_rs::types::{
    ConnectionState, DeviceProfile, ElementType, InterfaceType, SlotParameters, UioState,
};

fn profile() -> DeviceProfile {
    let params = |rate: f64, element_type| SlotParameters {
        channel_count: 3,
        sample_rate_hz: rate,
        element_type,
        metric_count: 2,
    };
    DeviceProfile::default()
        .with_slot(0, params(100.0, ElementType::I16))
        .with_slot(3, params(250.0, ElementType::F32))
}

fn dispatcher() -> Arc<DeviceDispatcher> {
    Arc::new(
        DeviceDispatcher::new(&ClientConfig::default())
            .with_handler(Arc::new(EmulatedHandler::with_tick(Duration::from_millis(10)))),
    )
}

#[tokio::test]
async fn test_scan_then_stream_from_emulated_device() {
    let dispatcher = dispatcher();
    let found = dispatcher
        .scan(InterfaceType::Emulated, Arc::new(|_| false), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(found, vec![EmulatedHandler::device_record()]);

    let session = DeviceSession::open(
        dispatcher.clone(),
        EMULATED_DEVICE_ID,
        profile(),
        &ClientConfig::default(),
        Arc::new(|_| {}),
    )
    .await
    .unwrap();
    assert_eq!(
        dispatcher.connection_state(EMULATED_DEVICE_ID),
        ConnectionState::Connected
    );

    tokio::time::sleep(Duration::from_millis(600)).await;

    let (rows, metrics, fiducials) = session
        .with_stream(3, |s| (s.len(), s.metrics().len(), s.fiducials().len()))
        .unwrap();
    assert!(rows > 0);
    assert!(metrics > 0);
    assert!(fiducials > 0);
    assert_eq!(
        session
            .with_stream(3, |s| s.metrics().back().map(|m| m.values.len()))
            .unwrap(),
        Some(2)
    );
    assert!(session.with_stream(0, |s| s.len()).unwrap() > 0);
    assert_eq!(session.with_stream(1, |s| s.len()).unwrap(), 0);
    assert_eq!(session.with_stream(0, |s| s.qos_state()).unwrap(), 3);

    assert_eq!(dispatcher.get_device_battery_level(EMULATED_DEVICE_ID).await.unwrap(), 100);
    assert_eq!(dispatcher.get_device_strength(EMULATED_DEVICE_ID).await.unwrap(), 100);

    session.close().await.unwrap();
    assert_eq!(
        dispatcher.connection_state(EMULATED_DEVICE_ID),
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_emulated_uio_round_trip() {
    let dispatcher = dispatcher();
    dispatcher.register_device(EmulatedHandler::device_record());
    dispatcher
        .connect(EMULATED_DEVICE_ID, profile(), Arc::new(|_| {}))
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    dispatcher
        .subscribe_uio(EMULATED_DEVICE_ID, Arc::new(move |state| s.lock().unwrap().push(state)))
        .await
        .unwrap();

    let state = UioState { lines: 0x00F0 };
    dispatcher.set_uio_state(EMULATED_DEVICE_ID, state).await.unwrap();
    assert_eq!(dispatcher.get_uio_state(EMULATED_DEVICE_ID).await.unwrap(), state);
    assert_eq!(*seen.lock().unwrap(), vec![state]);

    dispatcher.disconnect(EMULATED_DEVICE_ID).await.unwrap();
    assert!(matches!(
        dispatcher.set_uio_state(EMULATED_DEVICE_ID, state).await,
        Err(TransportError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_unknown_emulated_id_is_rejected() {
    let dispatcher = dispatcher();
    assert!(matches!(
        dispatcher.connect("emulated-7", profile(), Arc::new(|_| {})).await,
        Err(TransportError::DeviceNotFound(_))
    ));
    assert!(matches!(
        dispatcher.handler(InterfaceType::Usb),
        Err(TransportError::HandlerUnavailable(InterfaceType::Usb))
    ));
}
