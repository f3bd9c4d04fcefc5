//! gattlink CLI
//!
//! Library half of the `gattlink` binary: argument parsing, TOML
//! configuration and the command handlers that drive a [`GattSession`] over
//! the btleplug backend.
//!
//! [`GattSession`]: gattlink_ble::GattSession

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::CliConfig;
pub use error::{CliError, Result};
