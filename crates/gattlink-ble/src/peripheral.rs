//! Peripheral role GATT session
//!
//! Owns the local service table, the advertiser lifecycle and the set of
//! centrals subscribed to each characteristic. Remote ATT requests are
//! answered from the table by the session task.

use std::collections::HashMap;
use std::sync::Arc;

use gattlink_core::{
    check_payload, AdvertiseConfig, ChannelConfig, Characteristic, DeviceId, GattError,
    ManagerState, Result, Service,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{
    create_peripheral_command_channel, create_peripheral_event_channel,
    create_peripheral_transport_channel, PeripheralCommandReceiver, PeripheralCommandSender,
    PeripheralEventReceiver, PeripheralEventSender,
};
use crate::events::PeripheralEvent;
use crate::transport::{
    AdvertiseFailure, AdvertisingSupport, AttStatus, PeripheralTransport,
    PeripheralTransportEvent, RequestId,
};

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum PeripheralCommand {
    AddService {
        service: Service,
        reply: Reply<()>,
    },
    RemoveService {
        service: Uuid,
        reply: Reply<()>,
    },
    ClearServices {
        reply: Reply<()>,
    },
    StartAdvertising {
        config: AdvertiseConfig,
        reply: Reply<()>,
    },
    StopAdvertising {
        reply: Reply<()>,
    },
    UpdateValue {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    Services {
        reply: Reply<Vec<Service>>,
    },
    State {
        reply: Reply<ManagerState>,
    },
    IsAdvertising {
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Advertising {
    Stopped,
    /// Native start issued, outcome pending
    Starting(AdvertiseConfig),
    Active(AdvertiseConfig),
}

// ----------------------------------------------------------------------------
// Session Handle
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct PeripheralSession {
    commands: PeripheralCommandSender,
    events: PeripheralEventSender,
    support: AdvertisingSupport,
}

impl PeripheralSession {
    /// Start a peripheral session task on the current tokio runtime
    pub fn spawn(transport: Arc<dyn PeripheralTransport>, channels: ChannelConfig) -> Self {
        let (commands, command_rx) = create_peripheral_command_channel(&channels);
        let events = create_peripheral_event_channel(&channels);
        let (sink, native_rx) = create_peripheral_transport_channel();

        transport.attach(sink);
        let support = transport.advertising_support();
        let task = PeripheralTask {
            state: transport.state(),
            transport,
            events: events.clone(),
            services: Vec::new(),
            advertising: Advertising::Stopped,
            subscribers: HashMap::new(),
        };
        tokio::spawn(task.run(command_rx, native_rx));

        Self {
            commands,
            events,
            support,
        }
    }

    pub fn events(&self) -> PeripheralEventReceiver {
        self.events.subscribe()
    }

    /// Advertising features of the local controller; partial support is
    /// reported through [`AdvertisingSupport::is_degraded`]
    pub fn supports_advertising(&self) -> AdvertisingSupport {
        self.support
    }

    /// Register a service; completion arrives as `ServiceAdded`
    pub async fn add_service(&self, service: Service) -> Result<()> {
        self.request(|reply| PeripheralCommand::AddService { service, reply })
            .await
    }

    pub async fn remove_service(&self, service: Uuid) -> Result<()> {
        self.request(|reply| PeripheralCommand::RemoveService { service, reply })
            .await
    }

    pub async fn clear_services(&self) -> Result<()> {
        self.request(|reply| PeripheralCommand::ClearServices { reply })
            .await
    }

    pub async fn start_advertising(&self, config: AdvertiseConfig) -> Result<()> {
        self.request(|reply| PeripheralCommand::StartAdvertising { config, reply })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(|reply| PeripheralCommand::StopAdvertising { reply })
            .await
    }

    /// Store a new local value and notify every subscribed central
    pub async fn update_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let value = value.into();
        self.request(|reply| PeripheralCommand::UpdateValue {
            service,
            characteristic,
            value,
            reply,
        })
        .await
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        self.request(|reply| PeripheralCommand::Services { reply })
            .await
    }

    pub async fn state(&self) -> Result<ManagerState> {
        self.request(|reply| PeripheralCommand::State { reply }).await
    }

    pub async fn is_advertising(&self) -> Result<bool> {
        self.request(|reply| PeripheralCommand::IsAdvertising { reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| PeripheralCommand::Shutdown { reply })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> PeripheralCommand) -> Result<T> {
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

struct PeripheralTask {
    transport: Arc<dyn PeripheralTransport>,
    events: PeripheralEventSender,
    state: ManagerState,
    /// Local services in registration order
    services: Vec<Service>,
    advertising: Advertising,
    subscribers: HashMap<(Uuid, Uuid), Vec<DeviceId>>,
}

impl PeripheralTask {
    async fn run(
        mut self,
        mut commands: PeripheralCommandReceiver,
        mut native: mpsc::UnboundedReceiver<PeripheralTransportEvent>,
    ) {
        info!("Peripheral session started");

        loop {
            tokio::select! {
                biased;

                Some(event) = native.recv() => self.handle_transport_event(event).await,

                command = commands.recv() => match command {
                    Some(PeripheralCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All peripheral handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("Peripheral session stopped");
    }

    fn emit(&self, event: PeripheralEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::AddService { service, reply } => {
                let result = self.add_service(service).await;
                let _ = reply.send(result);
            }
            PeripheralCommand::RemoveService { service, reply } => {
                let result = self.remove_service(service).await;
                let _ = reply.send(result);
            }
            PeripheralCommand::ClearServices { reply } => {
                let result = self.clear_services().await;
                let _ = reply.send(result);
            }
            PeripheralCommand::StartAdvertising { config, reply } => {
                let result = self.start_advertising(config).await;
                let _ = reply.send(result);
            }
            PeripheralCommand::StopAdvertising { reply } => {
                self.stop_advertising().await;
                let _ = reply.send(Ok(()));
            }
            PeripheralCommand::UpdateValue {
                service,
                characteristic,
                value,
                reply,
            } => {
                let result = self.update_value(service, characteristic, value).await;
                let _ = reply.send(result);
            }
            PeripheralCommand::Services { reply } => {
                let _ = reply.send(Ok(self.services.clone()));
            }
            PeripheralCommand::State { reply } => {
                let _ = reply.send(Ok(self.state));
            }
            PeripheralCommand::IsAdvertising { reply } => {
                let _ = reply.send(Ok(matches!(self.advertising, Advertising::Active(_))));
            }
            PeripheralCommand::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_transport_event(&mut self, event: PeripheralTransportEvent) {
        match event {
            PeripheralTransportEvent::StateChanged(state) => {
                info!("Peripheral radio state changed to {}", state);
                self.state = state;
                if !state.is_powered_on() && self.advertising != Advertising::Stopped {
                    info!("Advertising stopped by radio state change");
                    self.advertising = Advertising::Stopped;
                }
                self.emit(PeripheralEvent::ManagerStateChanged(state));
            }
            PeripheralTransportEvent::ServiceAdded { service, result } => match result {
                Ok(()) => {
                    debug!("Service {} registered", service);
                    self.emit(PeripheralEvent::ServiceAdded {
                        service,
                        error: None,
                    });
                }
                Err(reason) => {
                    warn!("Registering service {} failed: {}", service, reason);
                    self.forget_service(&service);
                    self.emit(PeripheralEvent::ServiceAdded {
                        service,
                        error: Some(reason),
                    });
                }
            },
            PeripheralTransportEvent::AdvertiseStarted(result) => {
                let Advertising::Starting(config) = &self.advertising else {
                    debug!("Ignoring advertiser callback with no pending start");
                    return;
                };
                let config = config.clone();
                match result {
                    Ok(()) => {
                        info!("Advertising started");
                        self.advertising = Advertising::Active(config.clone());
                        self.emit(PeripheralEvent::AdvertiseStartSuccess(config));
                    }
                    Err(failure) => {
                        warn!("Advertising failed to start: {}", failure);
                        self.advertising = Advertising::Stopped;
                        self.emit(PeripheralEvent::AdvertiseStartFailed(failure));
                    }
                }
            }
            PeripheralTransportEvent::ReadRequest {
                request,
                central,
                service,
                characteristic,
                offset,
            } => {
                self.serve_read(request, central, service, characteristic, offset)
                    .await
            }
            PeripheralTransportEvent::WriteRequest {
                request,
                central,
                service,
                characteristic,
                offset,
                value,
                response_needed,
            } => {
                let status = self.apply_write(service, characteristic, offset, &value);
                if response_needed {
                    self.respond(request, status, None).await;
                }
                debug!(
                    "Write of {} bytes from {} to {}: {:?}",
                    value.len(),
                    central,
                    characteristic,
                    status
                );
                self.emit(PeripheralEvent::WriteRequestReceived {
                    central,
                    service,
                    characteristic,
                    value,
                    status,
                });
            }
            PeripheralTransportEvent::Subscribed {
                central,
                service,
                characteristic,
            } => {
                if self.characteristic(&service, &characteristic).is_none() {
                    debug!("Ignoring subscription to unknown characteristic {}", characteristic);
                    return;
                }
                let centrals = self.subscribers.entry((service, characteristic)).or_default();
                if !centrals.contains(&central) {
                    centrals.push(central);
                }
                self.sync_updating(service, characteristic);
                info!("{} subscribed to {}", central, characteristic);
                self.emit(PeripheralEvent::CentralSubscribed {
                    central,
                    characteristic,
                });
            }
            PeripheralTransportEvent::Unsubscribed {
                central,
                service,
                characteristic,
            } => {
                if let Some(centrals) = self.subscribers.get_mut(&(service, characteristic)) {
                    centrals.retain(|c| *c != central);
                }
                self.sync_updating(service, characteristic);
                info!("{} unsubscribed from {}", central, characteristic);
                self.emit(PeripheralEvent::CentralUnsubscribed {
                    central,
                    characteristic,
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Service Table
    // ------------------------------------------------------------------------

    fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<&Characteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == *service)?
            .characteristic(characteristic)
    }

    fn characteristic_mut(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == *service)?
            .characteristic_mut(characteristic)
    }

    fn sync_updating(&mut self, service: Uuid, characteristic: Uuid) {
        let subscribed = self
            .subscribers
            .get(&(service, characteristic))
            .is_some_and(|centrals| !centrals.is_empty());
        if let Some(local) = self.characteristic_mut(&service, &characteristic) {
            local.updating = subscribed;
        }
    }

    fn forget_service(&mut self, service: &Uuid) {
        self.services.retain(|s| s.uuid != *service);
        self.subscribers.retain(|(owner, _), _| owner != service);
    }

    async fn add_service(&mut self, mut service: Service) -> Result<()> {
        let uuid = service.uuid;
        for characteristic in service.characteristics.iter_mut() {
            characteristic.service_uuid = uuid;
        }

        if self.advertising != Advertising::Stopped {
            info!("Adding service {} while advertising", uuid);
        }
        if self.services.iter().any(|s| s.uuid == uuid) {
            debug!("Replacing registered service {}", uuid);
            if let Err(e) = self.transport.remove_service(uuid).await {
                warn!("Failed to unregister previous {}: {}", uuid, e);
            }
            self.forget_service(&uuid);
        }

        self.transport.add_service(&service).await?;
        self.services.push(service);
        Ok(())
    }

    async fn remove_service(&mut self, service: Uuid) -> Result<()> {
        if !self.services.iter().any(|s| s.uuid == service) {
            debug!("Service {} is not registered", service);
            return Ok(());
        }

        self.transport.remove_service(service).await?;
        self.forget_service(&service);
        info!("Removed service {}", service);
        Ok(())
    }

    async fn clear_services(&mut self) -> Result<()> {
        let registered: Vec<Uuid> = self.services.iter().map(|s| s.uuid).collect();
        for service in registered {
            self.remove_service(service).await?;
        }
        Ok(())
    }

    async fn update_value(&mut self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> Result<()> {
        let local = self
            .characteristic_mut(&service, &characteristic)
            .ok_or(GattError::CharacteristicNotFound {
                service,
                characteristic,
            })?;
        local.value = Some(value.clone());

        let centrals = self
            .subscribers
            .get(&(service, characteristic))
            .cloned()
            .unwrap_or_default();
        if centrals.is_empty() {
            return Ok(());
        }

        debug!(
            "Notifying {} centrals of {} ({})",
            centrals.len(),
            characteristic,
            hex::encode(&value)
        );
        self.transport
            .notify_value(service, characteristic, &value, &centrals)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    async fn start_advertising(&mut self, config: AdvertiseConfig) -> Result<()> {
        if !self.state.is_powered_on() {
            return Err(GattError::InvalidState {
                operation: "start advertising",
                state: self.state.to_string(),
            });
        }
        if let Some((_, data)) = &config.service_data {
            check_payload(data)?;
        }

        if self.advertising != Advertising::Stopped {
            self.emit(PeripheralEvent::AdvertiseStartFailed(
                AdvertiseFailure::AlreadyStarted,
            ));
            return Ok(());
        }

        let support = self.transport.advertising_support();
        if !support.can_advertise() {
            warn!("Controller cannot advertise");
            self.emit(PeripheralEvent::AdvertiseStartFailed(
                AdvertiseFailure::Unsupported,
            ));
            return Ok(());
        }
        if support.is_degraded() {
            warn!("Advertising with partial controller support: {:?}", support);
        }

        match self.transport.start_advertising(&config).await {
            Ok(()) => {
                debug!("Advertiser start issued");
                self.advertising = Advertising::Starting(config);
            }
            Err(e) => {
                warn!("Advertiser start rejected: {}", e);
                self.emit(PeripheralEvent::AdvertiseStartFailed(
                    AdvertiseFailure::InternalError,
                ));
            }
        }
        Ok(())
    }

    async fn stop_advertising(&mut self) {
        if self.advertising == Advertising::Stopped {
            return;
        }

        self.advertising = Advertising::Stopped;
        if let Err(e) = self.transport.stop_advertising().await {
            warn!("Native advertiser stop failed: {}", e);
        }
        info!("Advertising stopped");
    }

    // ------------------------------------------------------------------------
    // Remote Requests
    // ------------------------------------------------------------------------

    async fn serve_read(
        &mut self,
        request: RequestId,
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
    ) {
        let (status, value) = match self.characteristic(&service, &characteristic) {
            None => (AttStatus::AttributeNotFound, None),
            Some(local) if !local.can_read() => (AttStatus::ReadNotPermitted, None),
            Some(local) => {
                let stored = local.value.as_deref().unwrap_or_default();
                match stored.get(offset..) {
                    Some(tail) => (AttStatus::Success, Some(tail.to_vec())),
                    None => (AttStatus::InvalidOffset, None),
                }
            }
        };

        self.respond(request, status, value.as_deref()).await;
        debug!("Read of {} by {}: {:?}", characteristic, central, status);
        self.emit(PeripheralEvent::ReadRequestServed {
            central,
            service,
            characteristic,
            status,
        });
    }

    fn apply_write(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
        value: &[u8],
    ) -> AttStatus {
        let Some(local) = self.characteristic_mut(&service, &characteristic) else {
            return AttStatus::AttributeNotFound;
        };
        if !local.can_write() {
            return AttStatus::WriteNotPermitted;
        }

        let mut stored = local.value.take().unwrap_or_default();
        if offset > stored.len() {
            local.value = Some(stored);
            return AttStatus::InvalidOffset;
        }
        stored.truncate(offset);
        stored.extend_from_slice(value);
        local.value = Some(stored);
        AttStatus::Success
    }

    async fn respond(&self, request: RequestId, status: AttStatus, value: Option<&[u8]>) {
        if let Err(e) = self.transport.respond(request, status, value).await {
            warn!("Failed to answer request {}: {}", request, e);
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down peripheral session");
        self.stop_advertising().await;
        self.subscribers.clear();
    }
}
