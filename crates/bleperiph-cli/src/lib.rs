//! bleperiph CLI library
//!
//! Command-line demos for the peripheral manager: a UART-style echo
//! service, a notification fan-out demo and a state dump.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::PeripheralApp;
pub use cli::{Backend, Cli, Commands};
pub use config::CliConfig;
pub use error::{CliError, Result};
