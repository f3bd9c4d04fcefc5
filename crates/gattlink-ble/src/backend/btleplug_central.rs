//! Central transport over btleplug
//!
//! btleplug exposes awaitable calls rather than callbacks, so every
//! long-running request is spawned and its outcome posted to the session
//! sink. Adapter events (sightings, link changes) are pumped from the moment
//! a session attaches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic as NativeCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, Service as NativeService, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use gattlink_core::{
    AdvertisementData, Characteristic, Descriptor, DeviceId, ManagerState, NativeStack, Service,
    WriteMode,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};
use crate::transport::{
    CharacteristicRef, GattTransport, TransportCapabilities, TransportEvent, TransportEventSink,
};

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Stable mapping between btleplug peripheral ids and session device ids
#[derive(Default)]
struct DeviceIds {
    by_device: HashMap<DeviceId, PeripheralId>,
    by_peripheral: HashMap<PeripheralId, DeviceId>,
}

impl DeviceIds {
    fn register(&mut self, id: &PeripheralId, address: BDAddr) -> DeviceId {
        if let Some(device) = self.by_peripheral.get(id) {
            return *device;
        }

        // Some platforms (CoreBluetooth) hide the address
        let mac = address.into_inner();
        let device = if mac == [0; 6] {
            DeviceId::from_uuid(Uuid::new_v4())
        } else {
            DeviceId::from_mac(mac)
        };
        self.by_device.insert(device, id.clone());
        self.by_peripheral.insert(id.clone(), device);
        device
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

struct Shared {
    adapter: Adapter,
    sink: OnceLock<TransportEventSink>,
    ids: RwLock<DeviceIds>,
    pending_connects: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    notification_pumps: Mutex<HashSet<DeviceId>>,
}

/// [`GattTransport`] backed by the first btleplug adapter
#[derive(Clone)]
pub struct BtleplugCentral {
    shared: Arc<Shared>,
}

impl BtleplugCentral {
    /// Open the first adapter the platform reports
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Platform(format!("Failed to create BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Platform(format!("Failed to get BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotAvailable)?;

        info!("BLE adapter initialized");
        Ok(Self::from_adapter(adapter))
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                sink: OnceLock::new(),
                ids: RwLock::new(DeviceIds::default()),
                pending_connects: Mutex::new(HashMap::new()),
                notification_pumps: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl Shared {
    fn sink(&self) -> TransportResult<TransportEventSink> {
        self.sink
            .get()
            .cloned()
            .ok_or_else(|| TransportError::EventStreamFailed("no session attached".to_string()))
    }

    async fn peripheral(&self, device: DeviceId) -> TransportResult<Peripheral> {
        let id = self
            .ids
            .read()
            .await
            .by_device
            .get(&device)
            .cloned()
            .ok_or(TransportError::UnknownDevice { device })?;
        self.adapter
            .peripheral(&id)
            .await
            .map_err(|e| TransportError::Platform(e.to_string()))
    }

    async fn device_id(&self, peripheral: &Peripheral) -> DeviceId {
        self.ids
            .write()
            .await
            .register(&peripheral.id(), peripheral.address())
    }

    async fn characteristic(
        &self,
        target: CharacteristicRef,
    ) -> TransportResult<(Peripheral, NativeCharacteristic)> {
        let peripheral = self.peripheral(target.device).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.characteristic && c.service_uuid == target.service)
            .ok_or(TransportError::CharacteristicNotFound {
                characteristic: target.characteristic,
            })?;
        Ok((peripheral, characteristic))
    }

    /// Translate adapter events until the session goes away
    async fn pump_events(self: Arc<Self>, sink: TransportEventSink) {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to get BLE events: {}", e);
                sink.send(TransportEvent::ManagerStateChanged(ManagerState::Unsupported));
                return;
            }
        };
        sink.send(TransportEvent::ManagerStateChanged(ManagerState::PoweredOn));

        while let Some(event) = events.next().await {
            let delivered = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    match self.sighting(&id).await {
                        Some(event) => sink.send(event),
                        None => true,
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let device = self.ids.read().await.by_peripheral.get(&id).copied();
                    match device {
                        Some(device) => {
                            self.notification_pumps.lock().await.remove(&device);
                            sink.send(TransportEvent::DeviceDisconnected {
                                device,
                                reason: None,
                            })
                        }
                        None => true,
                    }
                }
                // Connects are reported by the task that issued them
                _ => true,
            };
            if !delivered {
                break;
            }
        }
        debug!("BLE event pump ended");
    }

    async fn sighting(&self, id: &PeripheralId) -> Option<TransportEvent> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let device = self.device_id(&peripheral).await;

        Some(TransportEvent::DeviceDiscovered {
            device,
            rssi: properties.rssi.unwrap_or_default(),
            advertisement: AdvertisementData {
                local_name: properties.local_name,
                service_uuids: properties.services,
                service_data: properties.service_data.into_iter().collect::<BTreeMap<_, _>>(),
                manufacturer_data: properties
                    .manufacturer_data
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
                tx_power: properties.tx_power_level,
            },
        })
    }

    /// Forward notifications for a device, once per link
    async fn ensure_notification_pump(&self, device: DeviceId, peripheral: Peripheral) -> TransportResult<()> {
        if !self.notification_pumps.lock().await.insert(device) {
            return Ok(());
        }

        let sink = self.sink()?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid);
                let Some(service) = service else {
                    continue;
                };
                let target = CharacteristicRef::new(device, service, notification.uuid);
                if !sink.send(TransportEvent::CharacteristicNotified {
                    target,
                    value: notification.value,
                }) {
                    break;
                }
            }
            debug!("Notification pump for {} ended", device);
        });
        Ok(())
    }
}

fn convert_service(native: &NativeService) -> Service {
    let mut service = Service::new(native.uuid);
    if !native.primary {
        service = service.secondary();
    }

    for native_characteristic in &native.characteristics {
        let properties = NativeStack::Btleplug
            .properties_from_native(u32::from(native_characteristic.properties.bits()));
        let mut characteristic =
            Characteristic::new(native_characteristic.uuid, native.uuid, properties);
        for descriptor in &native_characteristic.descriptors {
            characteristic = characteristic.with_descriptor(Descriptor::new(descriptor.uuid));
        }
        service = service.with_characteristic(characteristic);
    }
    service
}

#[async_trait]
impl GattTransport for BtleplugCentral {
    fn attach(&self, sink: TransportEventSink) {
        if self.shared.sink.set(sink.clone()).is_err() {
            warn!("btleplug transport is already attached to a session");
            return;
        }
        tokio::spawn(self.shared.clone().pump_events(sink));
    }

    fn capabilities(&self) -> TransportCapabilities {
        // btleplug writes the CCCD itself as part of subscribe
        TransportCapabilities {
            cccd_write_required: false,
        }
    }

    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()> {
        if !allow_duplicates {
            debug!("btleplug always reports repeated advertisements");
        }
        self.shared
            .adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.shared
            .adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn connect(&self, device: DeviceId) -> TransportResult<()> {
        let peripheral = self.shared.peripheral(device).await?;
        let sink = self.shared.sink()?;
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::DeviceConnected { device },
                Err(e) => TransportEvent::ConnectionFailed {
                    device,
                    reason: e.to_string(),
                },
            };
            shared.pending_connects.lock().await.remove(&device);
            sink.send(event);
        });
        self.shared.pending_connects.lock().await.insert(device, task);
        Ok(())
    }

    async fn cancel_connect(&self, device: DeviceId) -> TransportResult<()> {
        if let Some(task) = self.shared.pending_connects.lock().await.remove(&device) {
            task.abort();
        }
        // Drop a link that came up just before the abort
        let peripheral = self.shared.peripheral(device).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::DisconnectFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn disconnect(&self, device: DeviceId) -> TransportResult<()> {
        let peripheral = self.shared.peripheral(device).await?;
        self.shared.notification_pumps.lock().await.remove(&device);
        peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed(e.to_string()))
    }

    async fn discover_services(&self, device: DeviceId) -> TransportResult<()> {
        let peripheral = self.shared.peripheral(device).await?;
        let sink = self.shared.sink()?;

        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => TransportEvent::ServicesDiscovered {
                    device,
                    services: peripheral.services().iter().map(convert_service).collect(),
                },
                Err(e) => TransportEvent::ServiceDiscoveryFailed {
                    device,
                    reason: e.to_string(),
                },
            };
            sink.send(event);
        });
        Ok(())
    }

    async fn read(&self, target: CharacteristicRef) -> TransportResult<()> {
        let (peripheral, characteristic) = self.shared.characteristic(target).await?;
        let sink = self.shared.sink()?;

        tokio::spawn(async move {
            let result = peripheral
                .read(&characteristic)
                .await
                .map_err(|e| e.to_string());
            sink.send(TransportEvent::CharacteristicRead { target, result });
        });
        Ok(())
    }

    async fn write(
        &self,
        target: CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) -> TransportResult<()> {
        let (peripheral, characteristic) = self.shared.characteristic(target).await?;

        if mode != WriteMode::WithResponse {
            return peripheral
                .write(&characteristic, data, WriteType::WithoutResponse)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()));
        }

        let sink = self.shared.sink()?;
        let data = data.to_vec();
        tokio::spawn(async move {
            let result = peripheral
                .write(&characteristic, &data, WriteType::WithResponse)
                .await
                .map_err(|e| e.to_string());
            sink.send(TransportEvent::CharacteristicWritten { target, result });
        });
        Ok(())
    }

    async fn set_notify(&self, target: CharacteristicRef, enable: bool) -> TransportResult<()> {
        let (peripheral, characteristic) = self.shared.characteristic(target).await?;
        if enable {
            self.shared
                .ensure_notification_pump(target.device, peripheral.clone())
                .await?;
        }

        let sink = self.shared.sink()?;
        tokio::spawn(async move {
            let outcome = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            let (enabled, result) = match outcome {
                Ok(()) => (enable, Ok(())),
                Err(e) => (!enable, Err(e.to_string())),
            };
            sink.send(TransportEvent::NotificationStateUpdated {
                target,
                enabled,
                result,
            });
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        let (peripheral, characteristic) = self.shared.characteristic(target).await?;
        let native_descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or(TransportError::DescriptorWriteFailed(format!(
                "descriptor {} not found",
                descriptor
            )))?;

        let sink = self.shared.sink()?;
        let value = value.to_vec();
        tokio::spawn(async move {
            let result = peripheral
                .write_descriptor(&native_descriptor, &value)
                .await
                .map_err(|e| e.to_string());
            sink.send(TransportEvent::DescriptorWritten {
                target,
                descriptor,
                result,
            });
        });
        Ok(())
    }

    async fn read_rssi(&self, device: DeviceId) -> TransportResult<()> {
        let peripheral = self.shared.peripheral(device).await?;
        let sink = self.shared.sink()?;

        tokio::spawn(async move {
            let result = match peripheral.properties().await {
                Ok(Some(properties)) => properties
                    .rssi
                    .ok_or_else(|| "no RSSI reported".to_string()),
                Ok(None) => Err("no properties reported".to_string()),
                Err(e) => Err(e.to_string()),
            };
            sink.send(TransportEvent::RssiRead { device, result });
        });
        Ok(())
    }
}
