//! Session and advertising configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Central Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for a central GATT session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a non-continuous scan runs before it times out
    pub scan_timeout: Duration,
    /// How long a connect attempt may stay pending
    pub connection_timeout: Duration,
    /// Only report devices advertising one of these services (empty = all)
    pub scan_service_filter: Vec<Uuid>,
    /// Ask the native stack to report every advertisement, not just the first
    pub allow_duplicates: bool,
    pub channels: ChannelConfig,
    pub dispatch: DispatchPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            scan_service_filter: Vec::new(),
            allow_duplicates: true,
            channels: ChannelConfig::default(),
            dispatch: DispatchPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Restrict scans to devices advertising the given services
    pub fn with_scan_service_filter(mut self, services: Vec<Uuid>) -> Self {
        self.scan_service_filter = services;
        self
    }

    pub fn with_allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the session task channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Buffer size for commands (handle → session task)
    pub command_buffer_size: usize,
    /// Capacity of the broadcast event feed (session task → subscribers)
    pub event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32, // Commands are caller paced
            event_buffer_size: 256,  // Scan sightings can be bursty
        }
    }
}

impl ChannelConfig {
    /// Small buffers for constrained hosts
    pub fn compact() -> Self {
        Self {
            command_buffer_size: 8,
            event_buffer_size: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Policy
// ----------------------------------------------------------------------------

/// Which native operations are routed through the host-supplied dispatcher
///
/// Some Android vendor stacks only accept connect/disconnect from the main
/// thread; the host registers a dispatcher for that and flags the operations
/// that need it here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    pub connect: bool,
    pub disconnect: bool,
    pub discover_services: bool,
}

impl DispatchPolicy {
    /// Route nothing through the dispatcher
    pub fn inline() -> Self {
        Self::default()
    }

    /// Route the link lifecycle calls through the dispatcher
    pub fn link_lifecycle() -> Self {
        Self {
            connect: true,
            disconnect: true,
            discover_services: false,
        }
    }

    pub fn with_connect(mut self, enabled: bool) -> Self {
        self.connect = enabled;
        self
    }

    pub fn with_disconnect(mut self, enabled: bool) -> Self {
        self.disconnect = enabled;
        self
    }

    pub fn with_discover_services(mut self, enabled: bool) -> Self {
        self.discover_services = enabled;
        self
    }
}

// ----------------------------------------------------------------------------
// Advertising Configuration
// ----------------------------------------------------------------------------

/// Advertising interval trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// Transmit power for advertising
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

/// What a peripheral session advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// Custom service data, subject to the advertisement payload ceiling
    pub service_data: Option<(Uuid, Vec<u8>)>,
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    pub connectable: bool,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            local_name: None,
            service_uuids: Vec::new(),
            service_data: None,
            mode: AdvertiseMode::default(),
            tx_power: TxPowerLevel::default(),
            connectable: true,
        }
    }
}

impl AdvertiseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn with_service_data(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.service_data = Some((uuid, data.into()));
        self
    }

    pub fn with_mode(mut self, mode: AdvertiseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tx_power(mut self, tx_power: TxPowerLevel) -> Self {
        self.tx_power = tx_power;
        self
    }

    pub fn with_connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::new()
            .with_scan_timeout(Duration::from_secs(2))
            .with_connection_timeout(Duration::from_secs(5))
            .with_dispatch(DispatchPolicy::link_lifecycle());

        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert!(config.dispatch.connect);
        assert!(!config.dispatch.discover_services);
        assert!(config.scan_service_filter.is_empty());
    }

    #[test]
    fn test_session_config_serde_round_trip() {
        let config = SessionConfig::default().with_channels(ChannelConfig::compact());
        let json = serde_json::to_string(&config).unwrap();
        let decoded: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
    }
}
