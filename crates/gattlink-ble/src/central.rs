//! Central role GATT session
//!
//! [`GattSession`] is a cheap handle onto a single task that owns every piece
//! of central state: the known-device table, the scan pass, the link states
//! and the per-device operation lanes. Native callbacks, timer expiries and
//! caller commands are all applied by that task, one at a time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use gattlink_core::{
    Device, DeviceId, DeviceState, GattError, ManagerState, Result, Service, SessionConfig,
    WriteMode, CLIENT_CHARACTERISTIC_CONFIGURATION,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{
    create_command_channel, create_session_event_channel, create_transport_channel,
    CommandReceiver, CommandSender, SessionEventReceiver, SessionEventSender, ValueReceiver,
    ValueSender,
};
use crate::connection::{ConnectAction, ConnectedOutcome, ConnectionSession, DisconnectAction};
use crate::dispatch::{Dispatcher, InlineDispatcher, NativeCall, NativeOperation};
use crate::error::TransportResult;
use crate::events::SessionEvent;
use crate::operations::{OperationLanes, WriteOp};
use crate::scan::{ScanSession, Sighting};
use crate::transport::{CharacteristicRef, GattTransport, TransportCapabilities, TransportEvent};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum DeviceQuery {
    All,
    Discovered,
    Connected,
    One(DeviceId),
}

pub(crate) enum Command {
    StartScan {
        filter: Vec<Uuid>,
        continuous: bool,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        device: DeviceId,
        reply: Reply<()>,
    },
    Disconnect {
        device: DeviceId,
        reply: Reply<()>,
    },
    DiscoverServices {
        device: DeviceId,
        reply: Reply<()>,
    },
    Read {
        target: CharacteristicRef,
        reply: Reply<()>,
    },
    Write {
        target: CharacteristicRef,
        data: Vec<u8>,
        mode: WriteMode,
        reply: Reply<()>,
    },
    SetNotify {
        target: CharacteristicRef,
        enable: bool,
        reply: Reply<()>,
    },
    ReadRssi {
        device: DeviceId,
        reply: Reply<()>,
    },
    ValueUpdates {
        device: DeviceId,
        characteristic: Uuid,
        reply: Reply<ValueReceiver>,
    },
    Snapshot {
        query: DeviceQuery,
        reply: Reply<Vec<Device>>,
    },
    IsScanning {
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Debug)]
enum TimerExpiry {
    Scan { generation: u64 },
    Connect { device: DeviceId, attempt: u64 },
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

/// Handle onto a running central session
///
/// Calls return once the session has accepted the request. Precondition
/// failures come back as errors; native outcomes are published on the
/// [`events`](GattSession::events) feed.
#[derive(Clone)]
pub struct GattSession {
    commands: CommandSender,
    events: SessionEventSender,
    config: Arc<SessionConfig>,
}

impl GattSession {
    /// Start a session task on the current tokio runtime
    pub fn spawn(transport: Arc<dyn GattTransport>, config: SessionConfig) -> Self {
        Self::spawn_with_dispatcher(transport, config, Arc::new(InlineDispatcher))
    }

    /// Start a session whose policy-selected native calls go through `dispatcher`
    pub fn spawn_with_dispatcher(
        transport: Arc<dyn GattTransport>,
        config: SessionConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let (commands, command_rx) = create_command_channel(&config.channels);
        let events = create_session_event_channel(&config.channels);
        let (sink, native_rx) = create_transport_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        transport.attach(sink);
        let task = CentralTask {
            capabilities: transport.capabilities(),
            transport,
            dispatcher,
            config: config.clone(),
            events: events.clone(),
            devices: HashMap::new(),
            scan: ScanSession::new(),
            links: ConnectionSession::new(),
            lanes: OperationLanes::new(),
            listeners: HashMap::new(),
            timer_tx,
            scan_timer: None,
            connect_timers: HashMap::new(),
        };
        tokio::spawn(task.run(command_rx, native_rx, timer_rx));

        Self {
            commands,
            events,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events emitted from now on
    pub fn events(&self) -> SessionEventReceiver {
        self.events.subscribe()
    }

    /// Scan with the configured service filter until the scan timeout
    pub async fn start_scan(&self) -> Result<()> {
        self.start_scan_with(self.config.scan_service_filter.clone(), false)
            .await
    }

    /// Scan for `filter`; a continuous scan runs until [`stop_scan`](Self::stop_scan)
    pub async fn start_scan_with(&self, filter: Vec<Uuid>, continuous: bool) -> Result<()> {
        self.request(|reply| Command::StartScan {
            filter,
            continuous,
            reply,
        })
        .await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| Command::StopScan { reply }).await
    }

    pub async fn connect(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| Command::Connect { device, reply }).await
    }

    pub async fn disconnect(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| Command::Disconnect { device, reply })
            .await
    }

    pub async fn discover_services(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| Command::DiscoverServices { device, reply })
            .await
    }

    pub async fn read_characteristic(
        &self,
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let target = CharacteristicRef::new(device, service, characteristic);
        self.request(|reply| Command::Read { target, reply }).await
    }

    pub async fn write_characteristic(
        &self,
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        data: impl Into<Vec<u8>>,
        mode: WriteMode,
    ) -> Result<()> {
        let target = CharacteristicRef::new(device, service, characteristic);
        let data = data.into();
        self.request(|reply| Command::Write {
            target,
            data,
            mode,
            reply,
        })
        .await
    }

    pub async fn subscribe(&self, device: DeviceId, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.set_notify(CharacteristicRef::new(device, service, characteristic), true)
            .await
    }

    pub async fn unsubscribe(
        &self,
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.set_notify(CharacteristicRef::new(device, service, characteristic), false)
            .await
    }

    pub async fn read_rssi(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| Command::ReadRssi { device, reply }).await
    }

    /// Receive every value delivered for one characteristic of one device
    pub async fn value_updates(&self, device: DeviceId, characteristic: Uuid) -> Result<ValueReceiver> {
        self.request(|reply| Command::ValueUpdates {
            device,
            characteristic,
            reply,
        })
        .await
    }

    /// Every known device, ordered by id
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.snapshot(DeviceQuery::All).await
    }

    /// Devices seen during the current or last scan pass, in sighting order
    pub async fn discovered_devices(&self) -> Result<Vec<Device>> {
        self.snapshot(DeviceQuery::Discovered).await
    }

    pub async fn connected_devices(&self) -> Result<Vec<Device>> {
        self.snapshot(DeviceQuery::Connected).await
    }

    pub async fn device(&self, id: DeviceId) -> Result<Option<Device>> {
        Ok(self.snapshot(DeviceQuery::One(id)).await?.into_iter().next())
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(|reply| Command::IsScanning { reply }).await
    }

    /// Stop scanning, drop every link and end the session task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn set_notify(&self, target: CharacteristicRef, enable: bool) -> Result<()> {
        self.request(|reply| Command::SetNotify {
            target,
            enable,
            reply,
        })
        .await
    }

    async fn snapshot(&self, query: DeviceQuery) -> Result<Vec<Device>> {
        self.request(|reply| Command::Snapshot { query, reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| GattError::SessionClosed)?;
        response.await.map_err(|_| GattError::SessionClosed)?
    }
}

// ----------------------------------------------------------------------------
// Session Task
// ----------------------------------------------------------------------------

struct CentralTask {
    transport: Arc<dyn GattTransport>,
    dispatcher: Arc<dyn Dispatcher>,
    config: SessionConfig,
    capabilities: TransportCapabilities,
    events: SessionEventSender,
    /// Known devices; survives scan passes until evicted
    devices: HashMap<DeviceId, Device>,
    scan: ScanSession,
    links: ConnectionSession,
    lanes: OperationLanes,
    listeners: HashMap<(DeviceId, Uuid), Vec<ValueSender>>,
    timer_tx: mpsc::UnboundedSender<TimerExpiry>,
    scan_timer: Option<JoinHandle<()>>,
    connect_timers: HashMap<DeviceId, JoinHandle<()>>,
}

impl CentralTask {
    async fn run(
        mut self,
        mut commands: CommandReceiver,
        mut native: mpsc::UnboundedReceiver<TransportEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerExpiry>,
    ) {
        info!("GATT session started");

        loop {
            // Native callbacks first so that commands observe every event
            // delivered before them
            tokio::select! {
                biased;

                Some(event) = native.recv() => self.handle_transport_event(event).await,

                Some(expiry) = timers.recv() => self.handle_timer(expiry).await,

                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("GATT session stopped");
    }

    fn emit(&self, event: SessionEvent) {
        // Having no subscribers is not an error
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan {
                filter,
                continuous,
                reply,
            } => {
                let result = self.start_scan(filter, continuous).await;
                let _ = reply.send(result);
            }
            Command::StopScan { reply } => {
                self.stop_scan().await;
                let _ = reply.send(Ok(()));
            }
            Command::Connect { device, reply } => {
                self.connect(device).await;
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect { device, reply } => {
                let result = self.disconnect(device).await;
                let _ = reply.send(result);
            }
            Command::DiscoverServices { device, reply } => {
                let result = self.discover_services(device).await;
                let _ = reply.send(result);
            }
            Command::Read { target, reply } => {
                let result = self.read(target).await;
                let _ = reply.send(result);
            }
            Command::Write {
                target,
                data,
                mode,
                reply,
            } => {
                let result = self.write(target, data, mode).await;
                let _ = reply.send(result);
            }
            Command::SetNotify {
                target,
                enable,
                reply,
            } => {
                let result = self.set_notify(target, enable).await;
                let _ = reply.send(result);
            }
            Command::ReadRssi { device, reply } => {
                let result = self.read_rssi(device).await;
                let _ = reply.send(result);
            }
            Command::ValueUpdates {
                device,
                characteristic,
                reply,
            } => {
                self.listeners.retain(|_, senders| {
                    senders.retain(|sender| !sender.is_closed());
                    !senders.is_empty()
                });
                let (tx, rx) = mpsc::unbounded_channel();
                self.listeners
                    .entry((device, characteristic))
                    .or_default()
                    .push(tx);
                let _ = reply.send(Ok(rx));
            }
            Command::Snapshot { query, reply } => {
                let _ = reply.send(Ok(self.snapshot_devices(query)));
            }
            Command::IsScanning { reply } => {
                let _ = reply.send(Ok(self.scan.is_scanning()));
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ManagerStateChanged(state) => self.on_manager_state(state),
            TransportEvent::DeviceDiscovered {
                device,
                rssi,
                advertisement,
            } => {
                let sighting = self.scan.observe(device, &advertisement);
                if sighting == Sighting::Dropped {
                    debug!("Dropping sighting of {} outside an active scan", device);
                    return;
                }
                if sighting == Sighting::New {
                    debug!("Discovered {} (rssi {})", device, rssi);
                }
                let known = self
                    .devices
                    .entry(device)
                    .or_insert_with(|| Device::new(device));
                known.refresh(rssi, advertisement);
                let snapshot = known.clone();
                self.emit(SessionEvent::DeviceDiscovered(snapshot));
            }
            TransportEvent::ScanFailed { reason } => {
                if self.scan.is_scanning() {
                    warn!("Scan failed: {}", reason);
                    self.cancel_scan_timer();
                    self.scan.fail();
                    self.emit(SessionEvent::ScanFailed { reason });
                }
            }
            TransportEvent::DeviceConnected { device } => self.on_connected(device).await,
            TransportEvent::ConnectionFailed { device, reason } => {
                self.fail_connect(device, reason)
            }
            TransportEvent::DeviceDisconnected { device, reason } => {
                self.on_disconnected(device, reason)
            }
            TransportEvent::ServicesDiscovered { device, services } => {
                self.on_services_discovered(device, services)
            }
            TransportEvent::ServiceDiscoveryFailed { device, reason } => {
                if self.lanes.end_discovery(&device) {
                    warn!("Service discovery on {} failed: {}", device, reason);
                    self.emit(SessionEvent::ServiceDiscoveryFailed { device, reason });
                }
            }
            TransportEvent::CharacteristicRead { target, result } => {
                self.on_characteristic_read(target, result).await
            }
            TransportEvent::CharacteristicNotified { target, value } => {
                self.apply_value(target, value)
            }
            TransportEvent::CharacteristicWritten { target, result } => {
                self.on_characteristic_written(target, result).await
            }
            TransportEvent::DescriptorWritten {
                target,
                descriptor,
                result,
            } => self.on_descriptor_written(target, descriptor, result).await,
            TransportEvent::NotificationStateUpdated {
                target,
                enabled,
                result,
            } => self.on_notification_state(target, enabled, result).await,
            TransportEvent::RssiRead { device, result } => match result {
                Ok(rssi) => {
                    if let Some(known) = self.devices.get_mut(&device) {
                        known.rssi = rssi;
                    }
                    self.emit(SessionEvent::RssiUpdated { device, rssi });
                }
                Err(reason) => warn!("RSSI read on {} failed: {}", device, reason),
            },
        }
    }

    async fn handle_timer(&mut self, expiry: TimerExpiry) {
        match expiry {
            TimerExpiry::Scan { generation } => self.on_scan_timeout(generation).await,
            TimerExpiry::Connect { device, attempt } => {
                self.on_connect_timeout(device, attempt).await
            }
        }
    }

    async fn run_native(&self, operation: NativeOperation, call: NativeCall) -> TransportResult<()> {
        if operation.is_routed(&self.config.dispatch) {
            self.dispatcher.dispatch(operation, call).await
        } else {
            call.await
        }
    }

    // ------------------------------------------------------------------------
    // Radio & Scanning
    // ------------------------------------------------------------------------

    fn on_manager_state(&mut self, state: ManagerState) {
        info!("Radio state changed to {}", state);

        if !state.is_powered_on() && self.scan.is_scanning() {
            self.cancel_scan_timer();
            self.scan.fail();
            self.emit(SessionEvent::ScanFailed {
                reason: format!("radio {}", state),
            });
        }
        self.emit(SessionEvent::ManagerStateChanged(state));
    }

    async fn start_scan(&mut self, filter: Vec<Uuid>, continuous: bool) -> Result<()> {
        let start = self.scan.start(filter, continuous)?;
        let filter = self.scan.filter().to_vec();
        info!(
            "Starting scan (generation {}, continuous: {})",
            start.generation, continuous
        );

        if let Err(e) = self
            .transport
            .start_scan(&filter, self.config.allow_duplicates)
            .await
        {
            warn!("Native scan start failed: {}", e);
            self.scan.fail();
            self.emit(SessionEvent::ScanFailed {
                reason: e.to_string(),
            });
            return Ok(());
        }

        if start.timed {
            self.arm_scan_timer(start.generation);
        }
        Ok(())
    }

    async fn stop_scan(&mut self) {
        self.cancel_scan_timer();
        if !self.scan.stop() {
            return;
        }

        info!("Stopping scan");
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Native scan stop failed: {}", e);
        }
    }

    fn arm_scan_timer(&mut self, generation: u64) {
        self.cancel_scan_timer();
        let timers = self.timer_tx.clone();
        let timeout = self.config.scan_timeout;
        self.scan_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(TimerExpiry::Scan { generation });
        }));
    }

    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
    }

    async fn on_scan_timeout(&mut self, generation: u64) {
        let Some(discovered) = self.scan.on_timeout(generation) else {
            debug!("Ignoring stale scan timer (generation {})", generation);
            return;
        };
        self.scan_timer = None;

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Native scan stop failed: {}", e);
        }

        let stale: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(id, device)| !discovered.contains(id) && !device.state.is_linked())
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.devices.remove(id);
            self.links.forget(id);
            self.lanes.abort_device(id);
        }
        self.listeners.retain(|(device, _), _| !stale.contains(device));

        let devices: Vec<Device> = discovered
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect();
        info!(
            "Scan timed out: {} discovered, {} evicted",
            devices.len(),
            stale.len()
        );
        self.emit(SessionEvent::ScanTimedOut(devices));
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    fn sync_state(&mut self, device: DeviceId) {
        let state = self.links.state(&device);
        if let Some(known) = self.devices.get_mut(&device) {
            known.state = state;
        }
    }

    fn snapshot(&self, device: DeviceId) -> Device {
        self.devices.get(&device).cloned().unwrap_or_else(|| {
            let mut unknown = Device::new(device);
            unknown.state = self.links.state(&device);
            unknown
        })
    }

    async fn connect(&mut self, device: DeviceId) {
        self.devices
            .entry(device)
            .or_insert_with(|| Device::new(device));

        match self.links.begin_connect(device) {
            ConnectAction::AlreadyConnected => {
                debug!("Already connected to {}", device);
                self.emit(SessionEvent::DeviceConnected(self.snapshot(device)));
            }
            ConnectAction::AlreadyConnecting => {
                debug!("Connect to {} already pending", device);
            }
            ConnectAction::Issue { attempt } => {
                self.sync_state(device);
                info!("Connecting to {} (attempt {})", device, attempt);
                self.arm_connect_timer(device, attempt);

                let transport = self.transport.clone();
                let call = async move { transport.connect(device).await }.boxed();
                if let Err(e) = self.run_native(NativeOperation::Connect, call).await {
                    self.fail_connect(device, e.to_string());
                }
            }
        }
    }

    fn arm_connect_timer(&mut self, device: DeviceId, attempt: u64) {
        let timers = self.timer_tx.clone();
        let timeout = self.config.connection_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(TimerExpiry::Connect { device, attempt });
        });
        if let Some(previous) = self.connect_timers.insert(device, timer) {
            previous.abort();
        }
    }

    fn cancel_connect_timer(&mut self, device: &DeviceId) {
        if let Some(timer) = self.connect_timers.remove(device) {
            timer.abort();
        }
    }

    fn fail_connect(&mut self, device: DeviceId, reason: String) {
        if !self.links.on_failed(device) {
            debug!("Ignoring connect failure for {} with no pending attempt", device);
            return;
        }

        self.cancel_connect_timer(&device);
        self.sync_state(device);
        warn!("Failed to connect to {}: {}", device, reason);
        self.emit(SessionEvent::DeviceFailedToConnect {
            device: self.snapshot(device),
            reason,
        });
    }

    async fn on_connect_timeout(&mut self, device: DeviceId, attempt: u64) {
        if !self.links.on_timeout(device, attempt) {
            debug!("Ignoring stale connect timer for {} (attempt {})", device, attempt);
            return;
        }
        self.connect_timers.remove(&device);
        self.sync_state(device);
        warn!("Connection to {} timed out", device);

        let transport = self.transport.clone();
        let call = async move { transport.cancel_connect(device).await }.boxed();
        if let Err(e) = self.run_native(NativeOperation::Disconnect, call).await {
            warn!("Failed to cancel connect to {}: {}", device, e);
        }

        self.emit(SessionEvent::DeviceFailedToConnect {
            device: self.snapshot(device),
            reason: GattError::ConnectionTimedOut.to_string(),
        });
    }

    async fn on_connected(&mut self, device: DeviceId) {
        match self.links.on_connected(device) {
            ConnectedOutcome::Established => {
                self.cancel_connect_timer(&device);
                self.sync_state(device);
                info!("Connected to {}", device);
                self.emit(SessionEvent::DeviceConnected(self.snapshot(device)));
            }
            ConnectedOutcome::Duplicate => {
                debug!("Duplicate connect callback for {}", device);
                self.emit(SessionEvent::DeviceConnected(self.snapshot(device)));
            }
            ConnectedOutcome::Stray => {
                warn!("Tearing down link to {} with no pending connect", device);
                let transport = self.transport.clone();
                let call = async move { transport.disconnect(device).await }.boxed();
                if let Err(e) = self.run_native(NativeOperation::Disconnect, call).await {
                    warn!("Failed to tear down stray link to {}: {}", device, e);
                }
            }
        }
    }

    async fn disconnect(&mut self, device: DeviceId) -> Result<()> {
        // Unknown and evicted devices have no link and report as disconnected
        let action = self.links.begin_disconnect(device);
        let call: Option<NativeCall> = match action {
            DisconnectAction::CancelAttempt => {
                self.cancel_connect_timer(&device);
                let transport = self.transport.clone();
                Some(async move { transport.cancel_connect(device).await }.boxed())
            }
            DisconnectAction::Teardown => {
                let transport = self.transport.clone();
                Some(async move { transport.disconnect(device).await }.boxed())
            }
            DisconnectAction::AlreadyDisconnected => None,
        };

        if let Some(call) = call {
            if let Err(e) = self.run_native(NativeOperation::Disconnect, call).await {
                warn!("Native disconnect from {} failed: {}", device, e);
            }
            self.fail_pending(device, "device disconnected");
            info!("Disconnected from {}", device);
        } else {
            debug!("{} already disconnected", device);
        }

        self.sync_state(device);
        self.emit(SessionEvent::DeviceDisconnected(self.snapshot(device)));
        Ok(())
    }

    fn on_disconnected(&mut self, device: DeviceId, reason: Option<String>) {
        if !self.links.on_disconnected(device) {
            debug!("Ignoring disconnect callback for {}", device);
            return;
        }

        let reason = reason.unwrap_or_else(|| "link lost".to_string());
        warn!("Link to {} lost: {}", device, reason);
        self.fail_pending(device, &reason);
        self.sync_state(device);
        self.emit(SessionEvent::DeviceDisconnected(self.snapshot(device)));
    }

    /// Fail everything outstanding on a device whose link went away
    fn fail_pending(&mut self, device: DeviceId, reason: &str) {
        let aborted = self.lanes.abort_device(&device);

        if aborted.discovery {
            self.emit(SessionEvent::ServiceDiscoveryFailed {
                device,
                reason: reason.to_string(),
            });
        }
        for target in aborted.reads {
            self.emit(SessionEvent::CharacteristicReadFailed {
                device,
                service: target.service,
                characteristic: target.characteristic,
                reason: reason.to_string(),
            });
        }
        for op in aborted.writes {
            match op {
                WriteOp::Value { target, .. } => {
                    self.emit_write_complete(target, Some(reason.to_string()))
                }
                WriteOp::Notify { target, .. } => {
                    self.emit(SessionEvent::NotificationStateChanged {
                        device,
                        service: target.service,
                        characteristic: target.characteristic,
                        updating: false,
                        error: Some(reason.to_string()),
                    })
                }
            }
        }

        if let Some(known) = self.devices.get_mut(&device) {
            for characteristic in known.characteristics_mut() {
                characteristic.updating = false;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Service Discovery
    // ------------------------------------------------------------------------

    fn require_connected(&self, device: DeviceId, operation: &'static str) -> Result<()> {
        if !self.devices.contains_key(&device) {
            return Err(GattError::DeviceNotFound { device });
        }
        let state = self.links.state(&device);
        if state != DeviceState::Connected {
            return Err(GattError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    async fn discover_services(&mut self, device: DeviceId) -> Result<()> {
        self.require_connected(device, "discover services")?;
        self.lanes.begin_discovery(device)?;
        info!("Discovering services on {}", device);

        let transport = self.transport.clone();
        let call = async move { transport.discover_services(device).await }.boxed();
        if let Err(e) = self.run_native(NativeOperation::DiscoverServices, call).await {
            self.lanes.end_discovery(&device);
            warn!("Service discovery on {} rejected: {}", device, e);
            self.emit(SessionEvent::ServiceDiscoveryFailed {
                device,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn on_services_discovered(&mut self, device: DeviceId, services: Vec<Service>) {
        if !self.lanes.end_discovery(&device) {
            debug!("Ignoring unsolicited service table for {}", device);
            return;
        }

        let services: Vec<Service> = services
            .into_iter()
            .map(|mut service| {
                let uuid = service.uuid;
                for characteristic in service.characteristics.iter_mut() {
                    characteristic.service_uuid = uuid;
                }
                service
            })
            .collect();

        if let Some(known) = self.devices.get_mut(&device) {
            known.services = services.clone();
        }
        info!("Discovered {} services on {}", services.len(), device);
        self.emit(SessionEvent::ServicesDiscovered { device, services });
    }

    // ------------------------------------------------------------------------
    // Characteristic Operations
    // ------------------------------------------------------------------------

    /// Look up a characteristic that an operation may act on
    fn characteristic(
        &self,
        target: &CharacteristicRef,
        operation: &'static str,
    ) -> Result<&gattlink_core::Characteristic> {
        self.require_connected(target.device, operation)?;
        if self.lanes.is_discovering(&target.device) {
            return Err(GattError::OperationInProgress {
                operation: "service discovery",
                device: target.device,
            });
        }
        self.devices
            .get(&target.device)
            .ok_or(GattError::DeviceNotFound {
                device: target.device,
            })?
            .characteristic(&target.service, &target.characteristic)
    }

    async fn read(&mut self, target: CharacteristicRef) -> Result<()> {
        self.characteristic(&target, "read characteristic")?
            .require_read()?;

        if self.lanes.submit_read(target) {
            self.issue_reads(target).await;
        } else {
            debug!("Queued read of {}", target);
        }
        Ok(())
    }

    /// Issue a read, moving down the queue past reads the stack rejects
    async fn issue_reads(&mut self, target: CharacteristicRef) {
        let mut next = Some(target);
        while let Some(target) = next.take() {
            match self.transport.read(target).await {
                Ok(()) => debug!("Read issued for {}", target),
                Err(e) => {
                    warn!("Read of {} rejected: {}", target, e);
                    self.lanes.take_read(&target);
                    self.emit(SessionEvent::CharacteristicReadFailed {
                        device: target.device,
                        service: target.service,
                        characteristic: target.characteristic,
                        reason: e.to_string(),
                    });
                    next = self.lanes.next_read(&target.device);
                }
            }
        }
    }

    async fn on_characteristic_read(
        &mut self,
        target: CharacteristicRef,
        result: core::result::Result<Vec<u8>, String>,
    ) {
        let completed = self.lanes.take_read(&target);

        match result {
            Ok(value) => self.apply_value(target, value),
            Err(reason) if completed => {
                warn!("Read of {} failed: {}", target, reason);
                self.emit(SessionEvent::CharacteristicReadFailed {
                    device: target.device,
                    service: target.service,
                    characteristic: target.characteristic,
                    reason,
                });
            }
            Err(reason) => debug!("Ignoring unsolicited read failure on {}: {}", target, reason),
        }

        if completed {
            if let Some(next) = self.lanes.next_read(&target.device) {
                self.issue_reads(next).await;
            }
        }
    }

    /// Store a delivered value and fan it out
    fn apply_value(&mut self, target: CharacteristicRef, value: Vec<u8>) {
        let Some(characteristic) = self
            .devices
            .get_mut(&target.device)
            .and_then(|device| {
                device
                    .characteristic_mut(&target.service, &target.characteristic)
                    .ok()
            })
        else {
            debug!("Dropping value for unknown characteristic {}", target);
            return;
        };
        characteristic.value = Some(value.clone());

        if let Some(listeners) = self
            .listeners
            .get_mut(&(target.device, target.characteristic))
        {
            listeners.retain(|listener| listener.send(value.clone()).is_ok());
        }

        self.emit(SessionEvent::CharacteristicValueUpdated {
            device: target.device,
            service: target.service,
            characteristic: target.characteristic,
            value,
        });
    }

    async fn write(&mut self, target: CharacteristicRef, data: Vec<u8>, mode: WriteMode) -> Result<()> {
        let mode = self
            .characteristic(&target, "write characteristic")?
            .resolve_write_mode(mode)?;

        match self.lanes.submit_write(WriteOp::Value { target, data, mode }) {
            Some(op) => self.run_write_lane(op).await,
            None => debug!("Queued write to {}", target),
        }
        Ok(())
    }

    async fn set_notify(&mut self, target: CharacteristicRef, enable: bool) -> Result<()> {
        let operation = if enable { "subscribe" } else { "unsubscribe" };
        let characteristic = self.characteristic(&target, operation)?;
        characteristic.require_update()?;
        let cccd = self
            .capabilities
            .cccd_write_required
            .then(|| characteristic.cccd_value(enable));

        match self.lanes.submit_write(WriteOp::Notify {
            target,
            enable,
            cccd,
        }) {
            Some(op) => self.run_write_lane(op).await,
            None => debug!("Queued {} on {}", operation, target),
        }
        Ok(())
    }

    async fn read_rssi(&mut self, device: DeviceId) -> Result<()> {
        self.require_connected(device, "read rssi")?;
        self.transport.read_rssi(device).await?;
        Ok(())
    }

    /// Drive the write lane until an op is left waiting on a native callback
    async fn run_write_lane(&mut self, op: WriteOp) {
        let device = op.target().device;
        let mut next = Some(op);
        while let Some(op) = next.take() {
            if self.issue_write(op).await {
                next = self.lanes.next_write(&device);
            }
        }
    }

    /// Issue a write-lane op; returns `true` when it already finished
    async fn issue_write(&mut self, op: WriteOp) -> bool {
        match op {
            WriteOp::Value { target, data, mode } => {
                match self.transport.write(target, &data, mode).await {
                    Ok(()) if mode == WriteMode::WithResponse => false,
                    Ok(()) => {
                        self.lanes.take_write(&target.device, |_| true);
                        self.emit_write_complete(target, None);
                        true
                    }
                    Err(e) => {
                        warn!("Write to {} rejected: {}", target, e);
                        self.lanes.take_write(&target.device, |_| true);
                        self.emit_write_complete(target, Some(e.to_string()));
                        true
                    }
                }
            }
            WriteOp::Notify {
                target,
                enable,
                cccd,
            } => {
                if let Err(e) = self.transport.set_notify(target, enable).await {
                    self.lanes.take_write(&target.device, |_| true);
                    self.finish_notify(target, enable, Err(e.to_string()), false)
                        .await;
                    return true;
                }

                let Some(value) = cccd else {
                    return false;
                };
                match self
                    .transport
                    .write_descriptor(target, CLIENT_CHARACTERISTIC_CONFIGURATION, &value)
                    .await
                {
                    Ok(()) => false,
                    Err(e) => {
                        self.lanes.take_write(&target.device, |_| true);
                        self.finish_notify(target, enable, Err(e.to_string()), true)
                            .await;
                        true
                    }
                }
            }
        }
    }

    fn emit_write_complete(&self, target: CharacteristicRef, error: Option<String>) {
        self.emit(SessionEvent::WriteComplete {
            device: target.device,
            service: target.service,
            characteristic: target.characteristic,
            success: error.is_none(),
            error,
        });
    }

    /// Settle a notification change; failures leave `updating` untouched
    async fn finish_notify(
        &mut self,
        target: CharacteristicRef,
        enable: bool,
        result: core::result::Result<(), String>,
        rollback: bool,
    ) {
        let error = match result {
            Ok(()) => {
                if let Some(characteristic) = self.devices.get_mut(&target.device).and_then(|d| {
                    d.characteristic_mut(&target.service, &target.characteristic)
                        .ok()
                }) {
                    characteristic.updating = enable;
                }
                info!(
                    "Notifications {} on {}",
                    if enable { "enabled" } else { "disabled" },
                    target
                );
                None
            }
            Err(reason) => {
                warn!("Failed to change notifications on {}: {}", target, reason);
                if rollback {
                    if let Err(e) = self.transport.set_notify(target, !enable).await {
                        warn!("Rolling back notification request on {} failed: {}", target, e);
                    }
                }
                Some(reason)
            }
        };

        let updating = self
            .devices
            .get(&target.device)
            .and_then(|d| d.characteristic(&target.service, &target.characteristic).ok())
            .map(|c| c.updating)
            .unwrap_or(false);

        self.emit(SessionEvent::NotificationStateChanged {
            device: target.device,
            service: target.service,
            characteristic: target.characteristic,
            updating,
            error,
        });
    }

    async fn on_characteristic_written(
        &mut self,
        target: CharacteristicRef,
        result: core::result::Result<(), String>,
    ) {
        let matched = self.lanes.take_write(&target.device, |op| {
            matches!(op, WriteOp::Value { target: t, .. } if *t == target)
        });
        if matched.is_none() {
            debug!("Ignoring unsolicited write confirmation for {}", target);
            return;
        }

        self.emit_write_complete(target, result.err());
        if let Some(next) = self.lanes.next_write(&target.device) {
            self.run_write_lane(next).await;
        }
    }

    async fn on_descriptor_written(
        &mut self,
        target: CharacteristicRef,
        descriptor: Uuid,
        result: core::result::Result<(), String>,
    ) {
        if descriptor != CLIENT_CHARACTERISTIC_CONFIGURATION {
            debug!("Ignoring write of descriptor {} on {}", descriptor, target);
            return;
        }

        let Some(WriteOp::Notify { enable, .. }) = self.lanes.take_write(&target.device, |op| {
            matches!(op, WriteOp::Notify { target: t, cccd: Some(_), .. } if *t == target)
        }) else {
            debug!("Ignoring unsolicited CCCD confirmation for {}", target);
            return;
        };

        self.finish_notify(target, enable, result, true).await;
        if let Some(next) = self.lanes.next_write(&target.device) {
            self.run_write_lane(next).await;
        }
    }

    async fn on_notification_state(
        &mut self,
        target: CharacteristicRef,
        enabled: bool,
        result: core::result::Result<(), String>,
    ) {
        let Some(WriteOp::Notify { enable, .. }) = self.lanes.take_write(&target.device, |op| {
            matches!(op, WriteOp::Notify { target: t, cccd: None, .. } if *t == target)
        }) else {
            debug!("Ignoring unsolicited notification state for {}", target);
            return;
        };

        let result = result.and_then(|()| {
            if enabled == enable {
                Ok(())
            } else {
                Err(format!("native notification state stayed {}", enabled))
            }
        });
        self.finish_notify(target, enable, result, false).await;
        if let Some(next) = self.lanes.next_write(&target.device) {
            self.run_write_lane(next).await;
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots & Shutdown
    // ------------------------------------------------------------------------

    fn snapshot_devices(&self, query: DeviceQuery) -> Vec<Device> {
        match query {
            DeviceQuery::All | DeviceQuery::Connected => {
                let mut devices: Vec<Device> = self
                    .devices
                    .values()
                    .filter(|d| {
                        !matches!(query, DeviceQuery::Connected)
                            || d.state == DeviceState::Connected
                    })
                    .cloned()
                    .collect();
                devices.sort_by_key(|d| d.id);
                devices
            }
            DeviceQuery::Discovered => self
                .scan
                .discovered()
                .iter()
                .filter_map(|id| self.devices.get(id).cloned())
                .collect(),
            DeviceQuery::One(id) => self.devices.get(&id).cloned().into_iter().collect(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down GATT session");
        self.stop_scan().await;

        for (_, timer) in self.connect_timers.drain() {
            timer.abort();
        }
        for device in self.links.linked() {
            if let Err(e) = self.disconnect(device).await {
                warn!("Failed to disconnect {} during shutdown: {}", device, e);
            }
        }
    }
}
