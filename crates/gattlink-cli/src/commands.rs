//! Command handlers for the gattlink CLI

use std::sync::Arc;
use std::time::Duration;

use gattlink_ble::{BtleplugCentral, GattSession, SessionEvent, SessionEventReceiver};
use gattlink_core::{as_short_uuid, expand_uuid, Device, DeviceId, GattError, Service, WriteMode};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::{CliError, Result};

/// Characteristic addressed on the command line
#[derive(Debug, Clone, Copy)]
struct Target {
    device: DeviceId,
    service: Uuid,
    characteristic: Uuid,
}

impl Target {
    fn parse(device: &str, service: &str, characteristic: &str) -> Result<Self> {
        Ok(Self {
            device: device.parse()?,
            service: expand_uuid(service)?,
            characteristic: expand_uuid(characteristic)?,
        })
    }
}

#[derive(Serialize)]
struct ValueReport<'a> {
    device: DeviceId,
    characteristic: Uuid,
    hex: String,
    text: &'a str,
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher {
    session: GattSession,
    events: SessionEventReceiver,
    config: CliConfig,
}

impl CommandDispatcher {
    /// Open the default adapter and run one command against it
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        let transport = BtleplugCentral::new().await?;
        let session = GattSession::spawn(Arc::new(transport), config.session_config()?);
        let mut dispatcher = Self {
            events: session.events(),
            session,
            config,
        };

        let result = dispatcher.run(cli.command).await;
        if let Err(e) = dispatcher.session.shutdown().await {
            warn!("Session shutdown failed: {}", e);
        }
        result
    }

    async fn run(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Scan {
                timeout,
                services,
                continuous,
            } => self.handle_scan(timeout, services, continuous).await,
            Commands::Inspect { device } => {
                let device = self.open(device.parse()?).await?;
                self.print_device(&device)
            }
            Commands::Read {
                device,
                service,
                characteristic,
            } => {
                let target = Target::parse(&device, &service, &characteristic)?;
                self.handle_read(target).await
            }
            Commands::Write {
                device,
                service,
                characteristic,
                value,
                no_response,
            } => {
                let target = Target::parse(&device, &service, &characteristic)?;
                let data = hex::decode(value.trim_start_matches("0x"))?;
                let mode = if no_response {
                    WriteMode::WithoutResponse
                } else {
                    WriteMode::Auto
                };
                self.handle_write(target, data, mode).await
            }
            Commands::Watch {
                device,
                service,
                characteristic,
                count,
            } => {
                let target = Target::parse(&device, &service, &characteristic)?;
                self.handle_watch(target, count).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    async fn handle_scan(
        &mut self,
        timeout: Option<u64>,
        services: Vec<String>,
        continuous: bool,
    ) -> Result<()> {
        let filter = if services.is_empty() {
            self.config.service_filter()?
        } else {
            services
                .iter()
                .map(|s| expand_uuid(s))
                .collect::<gattlink_core::Result<Vec<_>>>()?
        };
        let limit = timeout
            .map(Duration::from_secs)
            .unwrap_or(self.session.config().scan_timeout);

        info!("Scanning for {:?} (filter: {:?})", limit, filter);
        // The session timer is not used so that `--timeout` can differ from
        // the configured scan timeout
        self.session.start_scan_with(filter, true).await?;

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline, if !continuous => break,
                _ = tokio::signal::ctrl_c() => break,
                event = self.events.recv() => match event {
                    Ok(SessionEvent::DeviceDiscovered(device)) => self.print_sighting(&device)?,
                    Ok(SessionEvent::ScanFailed { reason }) => {
                        return Err(CliError::OperationFailed(format!("Scan failed: {}", reason)))
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(GattError::SessionClosed.into()),
                },
            }
        }

        self.session.stop_scan().await?;
        Ok(())
    }

    /// Scan until `device` is seen so that the backend can resolve it
    async fn find(&mut self, device: DeviceId) -> Result<()> {
        if self.session.device(device).await?.is_some() {
            return Ok(());
        }

        debug!("Looking for {}", device);
        self.session.start_scan_with(Vec::new(), true).await?;
        let limit = self.session.config().scan_timeout;
        let seen = self
            .wait(limit, &format!("{} to advertise", device), |event| match event {
                SessionEvent::DeviceDiscovered(found) if found.id == device => Some(Ok(())),
                SessionEvent::ScanFailed { reason } => {
                    Some(Err(CliError::OperationFailed(reason.clone())))
                }
                _ => None,
            })
            .await;
        self.session.stop_scan().await?;

        match seen {
            Err(CliError::Timeout(_)) => Err(CliError::DeviceNotSeen(device.to_string())),
            other => other,
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Find, connect and discover services; returns the populated device
    async fn open(&mut self, device: DeviceId) -> Result<Device> {
        self.find(device).await?;

        self.session.connect(device).await?;
        // The session enforces the connect timeout itself
        self.wait(Duration::MAX, "connection", |event| match event {
            SessionEvent::DeviceConnected(d) if d.id == device => Some(Ok(())),
            SessionEvent::DeviceFailedToConnect { device: d, reason } if d.id == device => Some(
                Err(CliError::OperationFailed(format!("Connection failed: {}", reason))),
            ),
            _ => None,
        })
        .await?;
        info!("Connected to {}", device);

        self.session.discover_services(device).await?;
        self.wait(self.config.operation_timeout(), "service discovery", |event| {
            match event {
                SessionEvent::ServicesDiscovered { device: d, .. } if *d == device => Some(Ok(())),
                SessionEvent::ServiceDiscoveryFailed { device: d, reason } if *d == device => {
                    Some(Err(CliError::OperationFailed(format!(
                        "Service discovery failed: {}",
                        reason
                    ))))
                }
                _ => None,
            }
        })
        .await?;

        self.session
            .device(device)
            .await?
            .ok_or_else(|| GattError::DeviceNotFound { device }.into())
    }

    // ------------------------------------------------------------------------
    // Characteristic Commands
    // ------------------------------------------------------------------------

    async fn handle_read(&mut self, target: Target) -> Result<()> {
        self.open(target.device).await?;
        self.session
            .read_characteristic(target.device, target.service, target.characteristic)
            .await?;

        let value = self
            .wait(self.config.operation_timeout(), "read", |event| match event {
                SessionEvent::CharacteristicValueUpdated {
                    device,
                    characteristic,
                    value,
                    ..
                } if *device == target.device && *characteristic == target.characteristic => {
                    Some(Ok(value.clone()))
                }
                SessionEvent::CharacteristicReadFailed {
                    device,
                    characteristic,
                    reason,
                    ..
                } if *device == target.device && *characteristic == target.characteristic => {
                    Some(Err(CliError::OperationFailed(format!("Read failed: {}", reason))))
                }
                _ => None,
            })
            .await?;

        self.print_value(&target, &value)
    }

    async fn handle_write(&mut self, target: Target, data: Vec<u8>, mode: WriteMode) -> Result<()> {
        self.open(target.device).await?;
        let size = data.len();
        self.session
            .write_characteristic(target.device, target.service, target.characteristic, data, mode)
            .await?;

        self.wait(self.config.operation_timeout(), "write", |event| match event {
            SessionEvent::WriteComplete {
                device,
                characteristic,
                error,
                ..
            } if *device == target.device && *characteristic == target.characteristic => {
                Some(match error {
                    None => Ok(()),
                    Some(reason) => Err(CliError::OperationFailed(format!(
                        "Write failed: {}",
                        reason
                    ))),
                })
            }
            _ => None,
        })
        .await?;

        println!("Wrote {} bytes to {}", size, target.characteristic);
        Ok(())
    }

    async fn handle_watch(&mut self, target: Target, count: Option<usize>) -> Result<()> {
        self.open(target.device).await?;
        let mut values = self
            .session
            .value_updates(target.device, target.characteristic)
            .await?;
        self.session
            .subscribe(target.device, target.service, target.characteristic)
            .await?;

        self.wait(self.config.operation_timeout(), "subscription", |event| match event {
            SessionEvent::NotificationStateChanged {
                device,
                characteristic,
                updating,
                error,
                ..
            } if *device == target.device && *characteristic == target.characteristic => {
                Some(match error {
                    None if *updating => Ok(()),
                    None => Err(CliError::OperationFailed("Notifications not enabled".into())),
                    Some(reason) => Err(CliError::OperationFailed(format!(
                        "Subscribe failed: {}",
                        reason
                    ))),
                })
            }
            _ => None,
        })
        .await?;
        info!("Watching {} (Ctrl-C to stop)", target.characteristic);

        let mut received = 0;
        while count.map_or(true, |limit| received < limit) {
            tokio::select! {
                value = values.recv() => match value {
                    Some(value) => {
                        self.print_value(&target, &value)?;
                        received += 1;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        self.session
            .unsubscribe(target.device, target.service, target.characteristic)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Wait for the first event `pick` resolves
    async fn wait<T>(
        &mut self,
        limit: Duration,
        what: &str,
        mut pick: impl FnMut(&SessionEvent) -> Option<Result<T>>,
    ) -> Result<T> {
        let events = &mut self.events;
        let waiting = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(outcome) = pick(&event) {
                            return outcome;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => debug!("Event feed lagged by {}", missed),
                    Err(RecvError::Closed) => return Err(GattError::SessionClosed.into()),
                }
            }
        };

        if limit == Duration::MAX {
            return waiting.await;
        }
        tokio::time::timeout(limit, waiting)
            .await
            .map_err(|_| CliError::Timeout(what.to_string()))?
    }

    fn print_sighting(&self, device: &Device) -> Result<()> {
        if self.config.output.json {
            println!("{}", serde_json::to_string(device)?);
        } else {
            println!(
                "{}  {:>4} dBm  {}",
                device.id,
                device.rssi,
                device.name.as_deref().unwrap_or("(unnamed)")
            );
        }
        Ok(())
    }

    fn print_device(&self, device: &Device) -> Result<()> {
        if self.config.output.json {
            println!("{}", serde_json::to_string_pretty(device)?);
            return Ok(());
        }

        println!(
            "{} ({})",
            device.id,
            device.name.as_deref().unwrap_or("unnamed")
        );
        for service in &device.services {
            print_service(service);
        }
        Ok(())
    }

    fn print_value(&self, target: &Target, value: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(value);
        if self.config.output.json {
            let report = ValueReport {
                device: target.device,
                characteristic: target.characteristic,
                hex: hex::encode(value),
                text: &text,
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}  {:?}", hex::encode(value), text);
        }
        Ok(())
    }
}

/// SIG-assigned UUIDs print in their 16-bit form
fn display_uuid(uuid: &Uuid) -> String {
    match as_short_uuid(uuid) {
        Some(short) => format!("{:04x}", short),
        None => uuid.to_string(),
    }
}

fn print_service(service: &Service) {
    println!("  service {}", display_uuid(&service.uuid));
    for characteristic in &service.characteristics {
        let properties: Vec<&str> = characteristic
            .properties
            .iter_names()
            .map(|(name, _)| name)
            .collect();
        println!(
            "    characteristic {}  [{}]",
            display_uuid(&characteristic.uuid),
            properties.join(" | ")
        );
    }
}
