//! Scan pass behaviour of the central session against a scripted transport

use std::sync::Arc;
use std::time::Duration;

use gattlink_ble::{GattSession, SessionEvent, TransportError};
use gattlink_core::{short_uuid, AdvertisementData, GattError, ManagerState, SessionConfig};
use gattlink_harness::{
    advertisement, device, drain, expect_event, test_service_uuid, wait_for, CentralCall,
    CentralOp, MockCentral,
};
use tokio::time::Instant;

fn spawn(mock: &Arc<MockCentral>, scan_timeout: Duration) -> GattSession {
    GattSession::spawn(
        mock.clone(),
        SessionConfig::new().with_scan_timeout(scan_timeout),
    )
}

fn is_timeout(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ScanTimedOut(_))
}

#[tokio::test(start_paused = true)]
async fn test_scan_times_out_with_devices_seen_during_pass() {
    let _ = tracing_subscriber::fmt::try_init();
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();
    let started = Instant::now();

    session.start_scan().await.unwrap();
    assert!(session.is_scanning().await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(mock.advertise(device(1), -60, advertisement("thermo")));

    let mut seen = Vec::new();
    let devices = loop {
        match expect_event(&mut events).await {
            SessionEvent::ScanTimedOut(devices) => break devices,
            other => seen.push(other),
        }
    };
    let discovered: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::DeviceDiscovered(found) => Some(found),
            _ => None,
        })
        .collect();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].id, device(1));
    assert_eq!(discovered[0].name.as_deref(), Some("thermo"));
    assert_eq!(discovered[0].rssi, -60);

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(
        devices.iter().map(|d| d.id).collect::<Vec<_>>(),
        vec![device(1)]
    );
    assert!(!session.is_scanning().await.unwrap());
    assert_eq!(mock.count(CentralOp::StopScan), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_uses_configured_filter() {
    let mock = Arc::new(MockCentral::new());
    let session = GattSession::spawn(
        mock.clone(),
        SessionConfig::new().with_scan_service_filter(vec![test_service_uuid()]),
    );

    session.start_scan().await.unwrap();
    assert_eq!(
        mock.calls(),
        vec![CentralCall::StartScan {
            services: vec![test_service_uuid()],
            allow_duplicates: true,
        }]
    );
    assert_eq!(session.start_scan().await, Err(GattError::AlreadyScanning));
    assert_eq!(mock.count(CentralOp::StartScan), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_cancels_timer() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();

    session.stop_scan().await.unwrap();
    assert_eq!(mock.count(CentralOp::StopScan), 0);

    session.start_scan().await.unwrap();
    session.stop_scan().await.unwrap();
    session.stop_scan().await.unwrap();
    assert_eq!(mock.count(CentralOp::StopScan), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!session.is_scanning().await.unwrap());
    assert!(!drain(&mut events).iter().any(is_timeout));
}

#[tokio::test(start_paused = true)]
async fn test_late_sightings_are_dropped() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));

    session.start_scan().await.unwrap();
    session.stop_scan().await.unwrap();
    mock.advertise(device(2), -70, advertisement("late"));

    assert!(session.devices().await.unwrap().is_empty());
    assert!(!session.is_scanning().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_evicts_devices_not_seen_again() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();

    session.start_scan().await.unwrap();
    mock.advertise(device(1), -50, advertisement("one"));
    mock.advertise(device(2), -50, advertisement("two"));
    wait_for(&mut events, is_timeout).await;
    assert_eq!(session.devices().await.unwrap().len(), 2);

    // A linked device survives even when it is not seen again
    session.connect(device(3)).await.unwrap();
    mock.complete_connect(device(3));
    wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceConnected(_))).await;

    session.start_scan().await.unwrap();
    mock.advertise(device(1), -55, advertisement("one"));
    let SessionEvent::ScanTimedOut(seen) = wait_for(&mut events, is_timeout).await else {
        unreachable!()
    };
    assert_eq!(seen.len(), 1);

    let known: Vec<_> = session
        .devices()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(known, vec![device(1), device(3)]);
    assert_eq!(
        session
            .discovered_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect::<Vec<_>>(),
        vec![device(1)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_continuous_scan_filters_and_never_times_out() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();

    session
        .start_scan_with(vec![test_service_uuid()], true)
        .await
        .unwrap();

    let other = AdvertisementData {
        service_uuids: vec![short_uuid(0x180F)],
        ..Default::default()
    };
    mock.advertise(device(1), -40, other);
    mock.advertise(device(2), -40, advertisement("wanted"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(session.is_scanning().await.unwrap());

    let seen = drain(&mut events);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].device_id(), Some(device(2)));
}

#[tokio::test(start_paused = true)]
async fn test_native_scan_failure_returns_to_idle() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();

    mock.fail(
        CentralOp::StartScan,
        TransportError::ScanFailed("too frequently".into()),
    );
    session.start_scan().await.unwrap();
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::ScanFailed { .. })).await,
        SessionEvent::ScanFailed { .. }
    ));
    assert!(!session.is_scanning().await.unwrap());

    mock.clear_failure(CentralOp::StartScan);
    session.start_scan().await.unwrap();
    assert!(session.is_scanning().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_radio_loss_ends_scan() {
    let mock = Arc::new(MockCentral::new());
    let session = spawn(&mock, Duration::from_secs(2));
    let mut events = session.events();

    session.start_scan().await.unwrap();
    mock.power(ManagerState::PoweredOff);

    wait_for(&mut events, |e| matches!(e, SessionEvent::ScanFailed { .. })).await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::ManagerStateChanged(_))).await,
        SessionEvent::ManagerStateChanged(ManagerState::PoweredOff)
    );
    assert!(!session.is_scanning().await.unwrap());
}
