//! gattlink CLI configuration
//!
//! Loaded from a TOML file when `--config` is given, otherwise defaults.
//! Command line flags override individual values after loading. Durations are
//! written in whole seconds so the file stays hand-editable:
//!
//! ```toml
//! [scan]
//! timeout_secs = 5
//! services = ["180d"]
//!
//! [connection]
//! timeout_secs = 10
//! operation_timeout_secs = 15
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use gattlink_core::{expand_uuid, ChannelConfig, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub scan: ScanSettings,
    pub connection: ConnectionSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub timeout_secs: u64,
    /// Service filter, short (`180d`) or full UUIDs
    pub services: Vec<String>,
    pub allow_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub timeout_secs: u64,
    /// How long to wait for discovery, reads, writes and subscriptions
    pub operation_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub json: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            services: Vec::new(),
            allow_duplicates: false,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            operation_timeout_secs: 15,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: CliConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.timeout_secs == 0 {
            return Err(CliError::Config("scan.timeout_secs must be positive".into()));
        }
        if self.connection.timeout_secs == 0 || self.connection.operation_timeout_secs == 0 {
            return Err(CliError::Config(
                "connection timeouts must be positive".into(),
            ));
        }
        self.service_filter()?;
        Ok(())
    }

    pub fn service_filter(&self) -> Result<Vec<uuid::Uuid>> {
        self.scan
            .services
            .iter()
            .map(|s| expand_uuid(s).map_err(CliError::from))
            .collect()
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.operation_timeout_secs)
    }

    /// Session configuration for a one-shot command
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig::new()
            .with_scan_timeout(Duration::from_secs(self.scan.timeout_secs))
            .with_connection_timeout(Duration::from_secs(self.connection.timeout_secs))
            .with_scan_service_filter(self.service_filter()?)
            .with_allow_duplicates(self.scan.allow_duplicates)
            .with_channels(ChannelConfig::compact()))
    }
}
