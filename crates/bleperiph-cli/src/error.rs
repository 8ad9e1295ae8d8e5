//! Error handling for the bleperiph CLI

use thiserror::Error;

use bleperiph::{
    AdvertiseError, DefinitionError, NativeError, NotifyError, PeripheralError, PublishError,
};

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Peripheral error: {0}")]
    Peripheral(#[from] PeripheralError),

    #[error("Native stack error: {0}")]
    Native(#[from] NativeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Adapter not ready: {0}")]
    AdapterNotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<DefinitionError> for CliError {
    fn from(err: DefinitionError) -> Self {
        CliError::Peripheral(err.into())
    }
}

impl From<PublishError> for CliError {
    fn from(err: PublishError) -> Self {
        CliError::Peripheral(err.into())
    }
}

impl From<AdvertiseError> for CliError {
    fn from(err: AdvertiseError) -> Self {
        CliError::Peripheral(err.into())
    }
}

impl From<NotifyError> for CliError {
    fn from(err: NotifyError) -> Self {
        CliError::Peripheral(err.into())
    }
}
