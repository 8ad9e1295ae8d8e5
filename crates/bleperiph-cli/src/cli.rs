//! Command-line interface definitions and parsing

use std::fmt;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
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

    /// Native Bluetooth stack to run on
    #[arg(short, long, value_enum, default_value_t = Backend::Simulated)]
    pub backend: Backend,

    /// Advertised local name, overriding the configuration
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Native stack selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-memory stack with scripted centrals
    Simulated,
    /// BlueZ over D-Bus (Linux, `bluez` feature)
    Bluez,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Simulated => write!(f, "simulated"),
            Backend::Bluez => write!(f, "bluez"),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve a UART-style service that echoes every write back as a notification
    Uart {
        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Notify subscribers of a counter characteristic periodically
    Notify {
        /// Message prefix for each notification
        #[arg(short, long, default_value = "bleperiph notification")]
        message: String,
        /// Number of notifications to send
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// Delay between notifications in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Publish the demo services and print the peripheral state as JSON
    Info,
    /// Print an example configuration file
    ExampleConfig,
}
