//! Scriptable central transport
//!
//! [`MockCentral`] records every native call the session makes and never
//! answers on its own: tests play the native stack by emitting callbacks
//! through the helpers below. Failures can be injected per operation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use gattlink_ble::{
    CharacteristicRef, GattTransport, TransportCapabilities, TransportError, TransportEvent,
    TransportEventSink, TransportResult,
};
use gattlink_core::{AdvertisementData, DeviceId, ManagerState, Service, WriteMode};
use tracing::debug;
use uuid::Uuid;

/// Native call observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    StartScan {
        services: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    Read(CharacteristicRef),
    Write {
        target: CharacteristicRef,
        data: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        target: CharacteristicRef,
        enable: bool,
    },
    WriteDescriptor {
        target: CharacteristicRef,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    ReadRssi(DeviceId),
}

/// Operation kinds, used for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CentralOp {
    StartScan,
    StopScan,
    Connect,
    CancelConnect,
    Disconnect,
    DiscoverServices,
    Read,
    Write,
    SetNotify,
    WriteDescriptor,
    ReadRssi,
}

impl CentralCall {
    pub fn op(&self) -> CentralOp {
        match self {
            CentralCall::StartScan { .. } => CentralOp::StartScan,
            CentralCall::StopScan => CentralOp::StopScan,
            CentralCall::Connect(_) => CentralOp::Connect,
            CentralCall::CancelConnect(_) => CentralOp::CancelConnect,
            CentralCall::Disconnect(_) => CentralOp::Disconnect,
            CentralCall::DiscoverServices(_) => CentralOp::DiscoverServices,
            CentralCall::Read(_) => CentralOp::Read,
            CentralCall::Write { .. } => CentralOp::Write,
            CentralCall::SetNotify { .. } => CentralOp::SetNotify,
            CentralCall::WriteDescriptor { .. } => CentralOp::WriteDescriptor,
            CentralCall::ReadRssi(_) => CentralOp::ReadRssi,
        }
    }
}

#[derive(Default)]
struct State {
    sink: Option<TransportEventSink>,
    calls: Vec<CentralCall>,
    failures: HashMap<CentralOp, TransportError>,
    capabilities: TransportCapabilities,
}

#[derive(Default)]
pub struct MockCentral {
    state: Mutex<State>,
}

impl MockCentral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a stack that needs an explicit CCCD write (Android)
    pub fn with_cccd_write(self) -> Self {
        self.lock().capabilities.cccd_write_required = true;
        self
    }

    /// Make every later call of `op` fail with `error`
    pub fn fail(&self, op: CentralOp, error: TransportError) {
        self.lock().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: CentralOp) {
        self.lock().failures.remove(&op);
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: CentralOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Deliver a native callback; returns `false` if no session is attached
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    pub fn power(&self, state: ManagerState) -> bool {
        self.emit(TransportEvent::ManagerStateChanged(state))
    }

    pub fn advertise(&self, device: DeviceId, rssi: i16, advertisement: AdvertisementData) -> bool {
        self.emit(TransportEvent::DeviceDiscovered {
            device,
            rssi,
            advertisement,
        })
    }

    pub fn complete_connect(&self, device: DeviceId) -> bool {
        self.emit(TransportEvent::DeviceConnected { device })
    }

    pub fn fail_connect(&self, device: DeviceId, reason: &str) -> bool {
        self.emit(TransportEvent::ConnectionFailed {
            device,
            reason: reason.to_string(),
        })
    }

    /// Unsolicited link loss
    pub fn drop_link(&self, device: DeviceId) -> bool {
        self.emit(TransportEvent::DeviceDisconnected {
            device,
            reason: Some("link supervision timeout".to_string()),
        })
    }

    pub fn complete_discovery(&self, device: DeviceId, services: Vec<Service>) -> bool {
        self.emit(TransportEvent::ServicesDiscovered { device, services })
    }

    pub fn complete_read(&self, target: CharacteristicRef, value: &[u8]) -> bool {
        self.emit(TransportEvent::CharacteristicRead {
            target,
            result: Ok(value.to_vec()),
        })
    }

    pub fn fail_read(&self, target: CharacteristicRef, reason: &str) -> bool {
        self.emit(TransportEvent::CharacteristicRead {
            target,
            result: Err(reason.to_string()),
        })
    }

    pub fn complete_write(&self, target: CharacteristicRef, result: Result<(), String>) -> bool {
        self.emit(TransportEvent::CharacteristicWritten { target, result })
    }

    pub fn notify(&self, target: CharacteristicRef, value: &[u8]) -> bool {
        self.emit(TransportEvent::CharacteristicNotified {
            target,
            value: value.to_vec(),
        })
    }

    pub fn complete_cccd_write(&self, target: CharacteristicRef, result: Result<(), String>) -> bool {
        self.emit(TransportEvent::DescriptorWritten {
            target,
            descriptor: gattlink_core::CLIENT_CHARACTERISTIC_CONFIGURATION,
            result,
        })
    }

    pub fn complete_notification_state(
        &self,
        target: CharacteristicRef,
        enabled: bool,
        result: Result<(), String>,
    ) -> bool {
        self.emit(TransportEvent::NotificationStateUpdated {
            target,
            enabled,
            result,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: CentralCall) -> TransportResult<()> {
        let mut state = self.lock();
        debug!("mock central: {:?}", call);
        let failure = state.failures.get(&call.op()).cloned();
        state.calls.push(call);
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GattTransport for MockCentral {
    fn attach(&self, sink: TransportEventSink) {
        self.lock().sink = Some(sink);
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.lock().capabilities
    }

    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()> {
        self.record(CentralCall::StartScan {
            services: services.to_vec(),
            allow_duplicates,
        })
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.record(CentralCall::StopScan)
    }

    async fn connect(&self, device: DeviceId) -> TransportResult<()> {
        self.record(CentralCall::Connect(device))
    }

    async fn cancel_connect(&self, device: DeviceId) -> TransportResult<()> {
        self.record(CentralCall::CancelConnect(device))
    }

    async fn disconnect(&self, device: DeviceId) -> TransportResult<()> {
        self.record(CentralCall::Disconnect(device))
    }

    async fn discover_services(&self, device: DeviceId) -> TransportResult<()> {
        self.record(CentralCall::DiscoverServices(device))
    }

    async fn read(&self, target: CharacteristicRef) -> TransportResult<()> {
        self.record(CentralCall::Read(target))
    }

    async fn write(
        &self,
        target: CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) -> TransportResult<()> {
        self.record(CentralCall::Write {
            target,
            data: data.to_vec(),
            mode,
        })
    }

    async fn set_notify(&self, target: CharacteristicRef, enable: bool) -> TransportResult<()> {
        self.record(CentralCall::SetNotify { target, enable })
    }

    async fn write_descriptor(
        &self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        self.record(CentralCall::WriteDescriptor {
            target,
            descriptor,
            value: value.to_vec(),
        })
    }

    async fn read_rssi(&self, device: DeviceId) -> TransportResult<()> {
        self.record(CentralCall::ReadRssi(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::device;

    #[tokio::test]
    async fn test_records_calls_and_injects_failures() {
        let mock = MockCentral::new();
        assert!(mock.connect(device(1)).await.is_ok());

        mock.fail(CentralOp::Connect, TransportError::ConnectionFailed("busy".into()));
        assert!(mock.connect(device(2)).await.is_err());
        assert_eq!(mock.count(CentralOp::Connect), 2);

        mock.clear_failure(CentralOp::Connect);
        assert!(mock.connect(device(3)).await.is_ok());
        assert_eq!(mock.calls().last(), Some(&CentralCall::Connect(device(3))));
    }

    #[test]
    fn test_emit_without_session() {
        let mock = MockCentral::new();
        assert!(!mock.complete_connect(device(1)));
    }
}
