//! Scriptable peripheral transport

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use gattlink_ble::{
    AdvertiseFailure, AdvertisingSupport, AttStatus, PeripheralEventSink, PeripheralTransport,
    PeripheralTransportEvent, RequestId, TransportError, TransportResult,
};
use gattlink_core::{AdvertiseConfig, DeviceId, ManagerState, Service};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    AddService(Uuid),
    RemoveService(Uuid),
    StartAdvertising(AdvertiseConfig),
    StopAdvertising,
    Respond {
        request: RequestId,
        status: AttStatus,
        value: Option<Vec<u8>>,
    },
    NotifyValue {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        centrals: Vec<DeviceId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralOp {
    AddService,
    RemoveService,
    StartAdvertising,
    StopAdvertising,
    Respond,
    NotifyValue,
}

impl PeripheralCall {
    pub fn op(&self) -> PeripheralOp {
        match self {
            PeripheralCall::AddService(_) => PeripheralOp::AddService,
            PeripheralCall::RemoveService(_) => PeripheralOp::RemoveService,
            PeripheralCall::StartAdvertising(_) => PeripheralOp::StartAdvertising,
            PeripheralCall::StopAdvertising => PeripheralOp::StopAdvertising,
            PeripheralCall::Respond { .. } => PeripheralOp::Respond,
            PeripheralCall::NotifyValue { .. } => PeripheralOp::NotifyValue,
        }
    }
}

struct State {
    sink: Option<PeripheralEventSink>,
    radio: ManagerState,
    support: AdvertisingSupport,
    calls: Vec<PeripheralCall>,
    failures: HashMap<PeripheralOp, TransportError>,
}

/// Mock peripheral manager; powered on with full advertising support by default
pub struct MockPeripheral {
    state: Mutex<State>,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                sink: None,
                radio: ManagerState::PoweredOn,
                support: AdvertisingSupport::full(),
                calls: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Radio state reported when a session attaches
    pub fn with_state(self, radio: ManagerState) -> Self {
        self.lock().radio = radio;
        self
    }

    pub fn with_support(self, support: AdvertisingSupport) -> Self {
        self.lock().support = support;
        self
    }

    pub fn fail(&self, op: PeripheralOp, error: TransportError) {
        self.lock().failures.insert(op, error);
    }

    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: PeripheralOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn emit(&self, event: PeripheralTransportEvent) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    /// Change the radio state and report it to the session
    pub fn power(&self, radio: ManagerState) -> bool {
        self.lock().radio = radio;
        self.emit(PeripheralTransportEvent::StateChanged(radio))
    }

    pub fn advertise_result(&self, result: Result<(), AdvertiseFailure>) -> bool {
        self.emit(PeripheralTransportEvent::AdvertiseStarted(result))
    }

    pub fn service_added(&self, service: Uuid, result: Result<(), String>) -> bool {
        self.emit(PeripheralTransportEvent::ServiceAdded { service, result })
    }

    pub fn remote_read(
        &self,
        request: RequestId,
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
    ) -> bool {
        self.emit(PeripheralTransportEvent::ReadRequest {
            request,
            central,
            service,
            characteristic,
            offset,
        })
    }

    pub fn remote_write(
        &self,
        request: RequestId,
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.emit(PeripheralTransportEvent::WriteRequest {
            request,
            central,
            service,
            characteristic,
            offset: 0,
            value: value.to_vec(),
            response_needed: true,
        })
    }

    pub fn subscribe(&self, central: DeviceId, service: Uuid, characteristic: Uuid) -> bool {
        self.emit(PeripheralTransportEvent::Subscribed {
            central,
            service,
            characteristic,
        })
    }

    pub fn unsubscribe(&self, central: DeviceId, service: Uuid, characteristic: Uuid) -> bool {
        self.emit(PeripheralTransportEvent::Unsubscribed {
            central,
            service,
            characteristic,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: PeripheralCall) -> TransportResult<()> {
        let mut state = self.lock();
        debug!("mock peripheral: {:?}", call);
        let failure = state.failures.get(&call.op()).cloned();
        state.calls.push(call);
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PeripheralTransport for MockPeripheral {
    fn attach(&self, sink: PeripheralEventSink) {
        self.lock().sink = Some(sink);
    }

    fn state(&self) -> ManagerState {
        self.lock().radio
    }

    fn advertising_support(&self) -> AdvertisingSupport {
        self.lock().support
    }

    async fn add_service(&self, service: &Service) -> TransportResult<()> {
        self.record(PeripheralCall::AddService(service.uuid))
    }

    async fn remove_service(&self, service: Uuid) -> TransportResult<()> {
        self.record(PeripheralCall::RemoveService(service))
    }

    async fn start_advertising(&self, config: &AdvertiseConfig) -> TransportResult<()> {
        self.record(PeripheralCall::StartAdvertising(config.clone()))
    }

    async fn stop_advertising(&self) -> TransportResult<()> {
        self.record(PeripheralCall::StopAdvertising)
    }

    async fn respond(
        &self,
        request: RequestId,
        status: AttStatus,
        value: Option<&[u8]>,
    ) -> TransportResult<()> {
        self.record(PeripheralCall::Respond {
            request,
            status,
            value: value.map(<[u8]>::to_vec),
        })
    }

    async fn notify_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        centrals: &[DeviceId],
    ) -> TransportResult<()> {
        self.record(PeripheralCall::NotifyValue {
            service,
            characteristic,
            value: value.to_vec(),
            centrals: centrals.to_vec(),
        })
    }
}
