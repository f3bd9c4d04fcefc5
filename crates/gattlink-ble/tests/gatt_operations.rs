//! Discovery, reads, writes and subscriptions on a connected device

use std::sync::Arc;

use gattlink_ble::{
    CharacteristicRef, GattSession, SessionEvent, SessionEventReceiver, TransportError,
    TransportEvent,
};
use gattlink_core::{
    short_uuid, DeviceId, GattError, SessionConfig, WriteMode, CLIENT_CHARACTERISTIC_CONFIGURATION,
};
use gattlink_harness::{
    device, drain, target, test_service, test_service_uuid, wait_for, CentralCall, CentralOp,
    MockCentral, INDICATING, NOTIFYING, READ_ONLY, WRITABLE, WRITE_NO_RESPONSE,
};

async fn connected(mock: &Arc<MockCentral>) -> (GattSession, SessionEventReceiver) {
    let session = GattSession::spawn(mock.clone(), SessionConfig::new());
    let mut events = session.events();

    session.connect(device(1)).await.unwrap();
    mock.complete_connect(device(1));
    session.discover_services(device(1)).await.unwrap();
    mock.complete_discovery(device(1), vec![test_service()]);
    wait_for(&mut events, |e| matches!(e, SessionEvent::ServicesDiscovered { .. })).await;

    mock.clear_calls();
    (session, events)
}

async fn read(session: &GattSession, at: CharacteristicRef) -> gattlink_core::Result<()> {
    session
        .read_characteristic(at.device, at.service, at.characteristic)
        .await
}

async fn write(
    session: &GattSession,
    at: CharacteristicRef,
    data: &[u8],
    mode: WriteMode,
) -> gattlink_core::Result<()> {
    session
        .write_characteristic(at.device, at.service, at.characteristic, data, mode)
        .await
}

async fn updating(session: &GattSession, at: CharacteristicRef) -> bool {
    session
        .device(at.device)
        .await
        .unwrap()
        .and_then(|d| {
            d.characteristic(&at.service, &at.characteristic)
                .ok()
                .map(|c| c.updating)
        })
        .unwrap_or(false)
}

fn is_notification_change(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::NotificationStateChanged { .. })
}

// ----------------------------------------------------------------------------
// Service Discovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_discovery_preconditions() {
    let mock = Arc::new(MockCentral::new());
    let session = GattSession::spawn(mock.clone(), SessionConfig::new());
    let mut events = session.events();

    assert_eq!(
        session.discover_services(device(1)).await,
        Err(GattError::DeviceNotFound { device: device(1) })
    );

    session.connect(device(1)).await.unwrap();
    assert!(matches!(
        session.discover_services(device(1)).await,
        Err(GattError::InvalidState { operation: "discover services", .. })
    ));

    mock.complete_connect(device(1));
    session.discover_services(device(1)).await.unwrap();
    assert!(matches!(
        session.discover_services(device(1)).await,
        Err(GattError::OperationInProgress { .. })
    ));
    assert!(matches!(
        read(&session, target(device(1), READ_ONLY)).await,
        Err(GattError::OperationInProgress { .. })
    ));

    mock.complete_discovery(device(1), vec![test_service()]);
    let SessionEvent::ServicesDiscovered { device: id, services } = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ServicesDiscovered { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(id, device(1));
    assert_eq!(services, vec![test_service()]);
    assert_eq!(mock.count(CentralOp::DiscoverServices), 1);
}

#[tokio::test]
async fn test_unsolicited_service_table_is_ignored() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;

    mock.complete_discovery(device(1), Vec::new());
    let known = session.device(device(1)).await.unwrap().unwrap();
    assert_eq!(known.services, vec![test_service()]);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_discovery_failure_is_reported() {
    let mock = Arc::new(MockCentral::new());
    let session = GattSession::spawn(mock.clone(), SessionConfig::new());
    let mut events = session.events();

    session.connect(device(1)).await.unwrap();
    mock.complete_connect(device(1));
    session.discover_services(device(1)).await.unwrap();
    mock.emit(TransportEvent::ServiceDiscoveryFailed {
        device: device(1),
        reason: "gatt 129".into(),
    });

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::ServiceDiscoveryFailed { .. })).await,
        SessionEvent::ServiceDiscoveryFailed {
            device: device(1),
            reason: "gatt 129".into()
        }
    );
    // A new pass may start once the failed one is over
    session.discover_services(device(1)).await.unwrap();
}

// ----------------------------------------------------------------------------
// Access Checks
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_operations_require_matching_properties() {
    let mock = Arc::new(MockCentral::new());
    let (session, _events) = connected(&mock).await;
    let unsupported = |operation: &'static str, characteristic: u16| GattError::UnsupportedOperation {
        operation,
        characteristic: short_uuid(characteristic),
    };

    assert_eq!(
        read(&session, target(device(1), WRITABLE)).await,
        Err(unsupported("read", WRITABLE))
    );
    assert_eq!(
        write(&session, target(device(1), READ_ONLY), b"x", WriteMode::Auto).await,
        Err(unsupported("write", READ_ONLY))
    );
    assert_eq!(
        write(&session, target(device(1), WRITE_NO_RESPONSE), b"x", WriteMode::WithResponse).await,
        Err(unsupported("write", WRITE_NO_RESPONSE))
    );
    assert_eq!(
        write(&session, target(device(1), WRITABLE), b"x", WriteMode::WithoutResponse).await,
        Err(unsupported("write without response", WRITABLE))
    );
    assert_eq!(
        session
            .subscribe(device(1), test_service_uuid(), short_uuid(READ_ONLY))
            .await,
        Err(unsupported("notify", READ_ONLY))
    );

    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_attributes_are_rejected() {
    let mock = Arc::new(MockCentral::new());
    let (session, _events) = connected(&mock).await;

    assert_eq!(
        session
            .read_characteristic(device(1), short_uuid(0x180F), short_uuid(0x2A19))
            .await,
        Err(GattError::ServiceNotFound {
            device: device(1),
            service: short_uuid(0x180F)
        })
    );
    assert_eq!(
        session
            .read_characteristic(device(1), test_service_uuid(), short_uuid(0x2A19))
            .await,
        Err(GattError::CharacteristicNotFound {
            service: test_service_uuid(),
            characteristic: short_uuid(0x2A19)
        })
    );
    let stranger = DeviceId::from_mac([9; 6]);
    assert_eq!(
        session.read_rssi(stranger).await,
        Err(GattError::DeviceNotFound { device: stranger })
    );
}

// ----------------------------------------------------------------------------
// Reads
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_reads_are_queued_per_device() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;
    let first = target(device(1), READ_ONLY);
    let second = target(device(1), NOTIFYING);

    read(&session, first).await.unwrap();
    read(&session, second).await.unwrap();
    assert_eq!(mock.calls(), vec![CentralCall::Read(first)]);

    mock.complete_read(first, b"one");
    read(&session, first).await.unwrap();
    assert_eq!(
        mock.calls(),
        vec![CentralCall::Read(first), CentralCall::Read(second)]
    );

    mock.complete_read(second, b"two");
    mock.fail_read(first, "insufficient authentication");

    let updates: Vec<_> = {
        session.devices().await.unwrap();
        drain(&mut events)
    };
    assert_eq!(
        updates,
        vec![
            SessionEvent::CharacteristicValueUpdated {
                device: device(1),
                service: first.service,
                characteristic: first.characteristic,
                value: b"one".to_vec(),
            },
            SessionEvent::CharacteristicValueUpdated {
                device: device(1),
                service: second.service,
                characteristic: second.characteristic,
                value: b"two".to_vec(),
            },
            SessionEvent::CharacteristicReadFailed {
                device: device(1),
                service: first.service,
                characteristic: first.characteristic,
                reason: "insufficient authentication".into(),
            },
        ]
    );

    let stored = session.device(device(1)).await.unwrap().unwrap();
    assert_eq!(
        stored
            .characteristic(&second.service, &second.characteristic)
            .unwrap()
            .string_value(),
        "two"
    );
}

#[tokio::test]
async fn test_rejected_read_frees_the_lane() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;

    mock.fail(CentralOp::Read, TransportError::ReadFailed("busy".into()));
    read(&session, target(device(1), READ_ONLY)).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::CharacteristicReadFailed { .. })).await;

    mock.clear_failure(CentralOp::Read);
    read(&session, target(device(1), NOTIFYING)).await.unwrap();
    assert_eq!(mock.count(CentralOp::Read), 2);
}

#[tokio::test]
async fn test_value_listeners_only_see_their_characteristic() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;
    let mut values = session
        .value_updates(device(1), short_uuid(NOTIFYING))
        .await
        .unwrap();

    mock.notify(target(device(1), READ_ONLY), b"other");
    mock.notify(target(device(1), NOTIFYING), b"42");
    mock.notify(target(device(1), 0x9999), b"unknown");
    session.devices().await.unwrap();

    assert_eq!(values.try_recv().ok(), Some(b"42".to_vec()));
    assert!(values.try_recv().is_err());

    let updates = drain(&mut events);
    assert_eq!(updates.len(), 2);
    assert!(updates
        .iter()
        .all(|e| matches!(e, SessionEvent::CharacteristicValueUpdated { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_eviction_closes_value_listeners() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;
    let dropped = session
        .value_updates(device(1), short_uuid(READ_ONLY))
        .await
        .unwrap();
    drop(dropped);
    let mut values = session
        .value_updates(device(1), short_uuid(NOTIFYING))
        .await
        .unwrap();

    session.disconnect(device(1)).await.unwrap();
    session.start_scan().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::ScanTimedOut(_))).await;

    assert_eq!(session.device(device(1)).await.unwrap(), None);
    assert_eq!(values.recv().await, None);
}

// ----------------------------------------------------------------------------
// Writes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_write_modes_complete_differently() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;
    let fire_and_forget = target(device(1), WRITE_NO_RESPONSE);
    let acknowledged = target(device(1), WRITABLE);

    write(&session, fire_and_forget, b"a", WriteMode::Auto).await.unwrap();
    assert_eq!(
        mock.calls(),
        vec![CentralCall::Write {
            target: fire_and_forget,
            data: b"a".to_vec(),
            mode: WriteMode::WithoutResponse
        }]
    );
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::WriteComplete {
            device: device(1),
            service: fire_and_forget.service,
            characteristic: fire_and_forget.characteristic,
            success: true,
            error: None,
        }]
    );

    write(&session, acknowledged, b"b", WriteMode::Auto).await.unwrap();
    assert!(drain(&mut events).is_empty());

    mock.complete_write(acknowledged, Err("write not permitted".into()));
    let SessionEvent::WriteComplete { success, error, .. } =
        wait_for(&mut events, |e| matches!(e, SessionEvent::WriteComplete { .. })).await
    else {
        unreachable!()
    };
    assert!(!success);
    assert_eq!(error.as_deref(), Some("write not permitted"));
}

#[tokio::test]
async fn test_writes_are_queued_per_device() {
    let mock = Arc::new(MockCentral::new());
    let (session, _events) = connected(&mock).await;
    let at = target(device(1), WRITABLE);

    write(&session, at, b"1", WriteMode::WithResponse).await.unwrap();
    write(&session, at, b"2", WriteMode::WithResponse).await.unwrap();
    assert_eq!(mock.count(CentralOp::Write), 1);

    mock.complete_write(at, Ok(()));
    session.devices().await.unwrap();
    assert_eq!(
        mock.calls().last(),
        Some(&CentralCall::Write {
            target: at,
            data: b"2".to_vec(),
            mode: WriteMode::WithResponse
        })
    );
}

// ----------------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_subscribe_without_descriptor_write() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;
    let at = target(device(1), NOTIFYING);

    session
        .subscribe(at.device, at.service, at.characteristic)
        .await
        .unwrap();
    assert_eq!(
        mock.calls(),
        vec![CentralCall::SetNotify {
            target: at,
            enable: true
        }]
    );
    assert!(!updating(&session, at).await);

    mock.complete_notification_state(at, true, Ok(()));
    let SessionEvent::NotificationStateChanged { updating: on, error, .. } =
        wait_for(&mut events, is_notification_change).await
    else {
        unreachable!()
    };
    assert!(on);
    assert_eq!(error, None);
    assert!(updating(&session, at).await);

    session
        .unsubscribe(at.device, at.service, at.characteristic)
        .await
        .unwrap();
    mock.complete_notification_state(at, false, Ok(()));
    wait_for(&mut events, is_notification_change).await;
    assert!(!updating(&session, at).await);
}

#[tokio::test]
async fn test_subscribe_writes_cccd_when_required() {
    let mock = Arc::new(MockCentral::new().with_cccd_write());
    let (session, mut events) = connected(&mock).await;
    let notify = target(device(1), NOTIFYING);
    let indicate = target(device(1), INDICATING);

    session
        .subscribe(notify.device, notify.service, notify.characteristic)
        .await
        .unwrap();
    session
        .subscribe(indicate.device, indicate.service, indicate.characteristic)
        .await
        .unwrap();
    // The second request waits behind the first on the write lane
    assert_eq!(mock.count(CentralOp::SetNotify), 1);

    mock.complete_cccd_write(notify, Ok(()));
    wait_for(&mut events, is_notification_change).await;
    mock.complete_cccd_write(indicate, Ok(()));
    wait_for(&mut events, is_notification_change).await;

    let descriptor_writes: Vec<_> = mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            CentralCall::WriteDescriptor {
                target,
                descriptor,
                value,
            } => {
                assert_eq!(descriptor, CLIENT_CHARACTERISTIC_CONFIGURATION);
                Some((target, value))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        descriptor_writes,
        vec![(notify, vec![0x01, 0x00]), (indicate, vec![0x02, 0x00])]
    );
    assert!(updating(&session, notify).await);
    assert!(updating(&session, indicate).await);
}

#[tokio::test]
async fn test_failed_cccd_write_rolls_back_and_reports_once() {
    let mock = Arc::new(MockCentral::new().with_cccd_write());
    let (session, mut events) = connected(&mock).await;
    let at = target(device(1), NOTIFYING);

    session
        .subscribe(at.device, at.service, at.characteristic)
        .await
        .unwrap();
    mock.complete_cccd_write(at, Err("gatt 133".into()));
    session.devices().await.unwrap();

    let reports: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(is_notification_change)
        .collect();
    assert_eq!(
        reports,
        vec![SessionEvent::NotificationStateChanged {
            device: device(1),
            service: at.service,
            characteristic: at.characteristic,
            updating: false,
            error: Some("gatt 133".into()),
        }]
    );
    assert!(!updating(&session, at).await);
    assert_eq!(
        mock.calls().last(),
        Some(&CentralCall::SetNotify {
            target: at,
            enable: false
        })
    );
}

#[tokio::test]
async fn test_rejected_notification_request_skips_descriptor() {
    let mock = Arc::new(MockCentral::new().with_cccd_write());
    let (session, mut events) = connected(&mock).await;
    let at = target(device(1), NOTIFYING);

    mock.fail(
        CentralOp::SetNotify,
        TransportError::SubscriptionFailed("no resources".into()),
    );
    session
        .subscribe(at.device, at.service, at.characteristic)
        .await
        .unwrap();

    let reports: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(is_notification_change)
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(mock.count(CentralOp::WriteDescriptor), 0);
    assert_eq!(mock.count(CentralOp::SetNotify), 1);
    assert!(!updating(&session, at).await);
}

// ----------------------------------------------------------------------------
// RSSI & Shutdown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_rssi_refresh() {
    let mock = Arc::new(MockCentral::new());
    let (session, mut events) = connected(&mock).await;

    session.read_rssi(device(1)).await.unwrap();
    assert_eq!(mock.calls(), vec![CentralCall::ReadRssi(device(1))]);

    mock.emit(TransportEvent::RssiRead {
        device: device(1),
        result: Ok(-42),
    });
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::RssiUpdated { .. })).await,
        SessionEvent::RssiUpdated {
            device: device(1),
            rssi: -42
        }
    );
    assert_eq!(session.device(device(1)).await.unwrap().unwrap().rssi, -42);

    mock.fail(CentralOp::ReadRssi, TransportError::RssiFailed("busy".into()));
    assert!(matches!(
        session.read_rssi(device(1)).await,
        Err(GattError::NativeOperationFailed { operation: "rssi", .. })
    ));
}

#[tokio::test]
async fn test_shutdown_disconnects_and_closes() {
    let mock = Arc::new(MockCentral::new());
    let (session, _events) = connected(&mock).await;

    session.shutdown().await.unwrap();
    assert_eq!(mock.calls(), vec![CentralCall::Disconnect(device(1))]);
    assert_eq!(session.devices().await, Err(GattError::SessionClosed));
}
