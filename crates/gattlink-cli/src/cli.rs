//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Print devices and values as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan for advertising devices
    Scan {
        /// Scan duration in seconds (overrides the configuration)
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Only report devices advertising this service (repeatable)
        #[arg(short, long = "service")]
        services: Vec<String>,
        /// Keep scanning until interrupted
        #[arg(long)]
        continuous: bool,
    },
    /// Connect to a device and list its services
    Inspect {
        /// Device id (UUID or MAC address)
        device: String,
    },
    /// Read a characteristic value
    Read {
        device: String,
        service: String,
        characteristic: String,
    },
    /// Write a hex encoded value to a characteristic
    Write {
        device: String,
        service: String,
        characteristic: String,
        /// Value as hex, e.g. 0102ff
        value: String,
        /// Write without waiting for an acknowledgement
        #[arg(long)]
        no_response: bool,
    },
    /// Subscribe to a characteristic and print every update
    Watch {
        device: String,
        service: String,
        characteristic: String,
        /// Exit after this many values
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write() {
        let cli = Cli::parse_from([
            "gattlink",
            "--json",
            "write",
            "C0:FF:EE:00:00:01",
            "180d",
            "2a39",
            "01",
            "--no-response",
        ]);
        assert!(cli.json);
        match cli.command {
            Commands::Write {
                device,
                value,
                no_response,
                ..
            } => {
                assert_eq!(device, "C0:FF:EE:00:00:01");
                assert_eq!(value, "01");
                assert!(no_response);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_scan_filters() {
        let cli = Cli::parse_from(["gattlink", "scan", "-s", "180d", "-s", "180f", "-t", "3"]);
        match cli.command {
            Commands::Scan {
                timeout,
                services,
                continuous,
            } => {
                assert_eq!(timeout, Some(3));
                assert_eq!(services, vec!["180d", "180f"]);
                assert!(!continuous);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
