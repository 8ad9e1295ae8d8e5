//! Error types for the peripheral manager

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::advertising::SessionId;
use crate::dispatch::AttError;
use crate::gatt::{Permission, Property};

// ----------------------------------------------------------------------------
// Native Stack Errors
// ----------------------------------------------------------------------------

/// Failure reported by the native Bluetooth stack, surfaced verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}{}", .code.map(|code| format!(" (native code {code})")).unwrap_or_default())]
pub struct NativeError {
    /// Stack-specific error code, when the stack has one
    pub code: Option<i64>,
    /// Human readable description from the stack
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Operation Errors
// ----------------------------------------------------------------------------

/// Errors raised while defining or mutating service structure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Invalid UUID: {value}")]
    InvalidUuid { value: String },

    #[error("Service {service} is already defined")]
    DuplicateService { service: Uuid },

    #[error("UUID {uuid} is used more than once (service {service})")]
    DuplicateUuid { service: Uuid, uuid: Uuid },

    #[error("Characteristic {characteristic} can neither be read, written, notified nor indicated")]
    UselessCharacteristic { characteristic: Uuid },

    #[error("Characteristic {characteristic} has property {property:?} but lacks permission {permission:?}")]
    MissingPermission {
        characteristic: Uuid,
        property: Property,
        permission: Permission,
    },

    #[error("Service not found: {service}")]
    UnknownService { service: Uuid },

    #[error("Characteristic not found: {characteristic}")]
    UnknownCharacteristic { characteristic: Uuid },

    #[error("Service {service} is published; un-publish it before changing its structure")]
    AlreadyPublished { service: Uuid },

    #[error("Value for {characteristic} is {len} bytes (max: {max})")]
    ValueTooLong {
        characteristic: Uuid,
        len: usize,
        max: usize,
    },

    #[error("Peripheral manager has shut down")]
    Shutdown,
}

/// Errors raised while publishing or un-publishing a service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Bluetooth adapter not ready (state: {state})")]
    AdapterNotReady { state: AdapterState },

    #[error("Service not found: {service}")]
    UnknownService { service: Uuid },

    #[error("Native stack rejected service {service}: {source}")]
    Rejected {
        service: Uuid,
        #[source]
        source: NativeError,
    },

    #[error("Publishing service {service} timed out after {after_ms}ms")]
    Timeout { service: Uuid, after_ms: u64 },

    #[error("Service {service} has a publish in progress")]
    InProgress { service: Uuid },

    #[error("Service {service} is being advertised; stop advertising first")]
    Advertised { service: Uuid },

    #[error("Peripheral manager has shut down")]
    Shutdown,
}

/// Errors raised by the advertising controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("Bluetooth adapter not ready (state: {state})")]
    AdapterNotReady { state: AdapterState },

    #[error("Service {service} must be published before it is advertised")]
    ServiceNotPublished { service: Uuid },

    #[error("Advertising session {session} is still starting")]
    Busy { session: SessionId },

    #[error("Native stack rejected advertising session {session}: {source}")]
    Rejected {
        session: SessionId,
        #[source]
        source: NativeError,
    },

    #[error("Advertising session {session} did not start within {after_ms}ms")]
    Timeout { session: SessionId, after_ms: u64 },

    #[error("Advertising session {session} was stopped before it started")]
    Cancelled { session: SessionId },

    #[error("Native stack failed to stop advertising: {0}")]
    StopFailed(#[source] NativeError),

    #[error("Peripheral manager has shut down")]
    Shutdown,
}

/// Errors that reject a notify call as a whole, before any target is tried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Bluetooth adapter not ready (state: {state})")]
    AdapterNotReady { state: AdapterState },

    #[error("Characteristic not found: {characteristic}")]
    UnknownCharacteristic { characteristic: Uuid },

    #[error("Characteristic {characteristic} belongs to an unpublished service")]
    NotPublished { characteristic: Uuid },

    #[error("Characteristic {characteristic} supports neither notify nor indicate")]
    NotNotifiable { characteristic: Uuid },

    #[error("Payload is {len} bytes (max attribute length: {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Peripheral manager has shut down")]
    Shutdown,
}

/// Terminal failure of a notification that was accepted for delivery
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryFailure {
    #[error("central disconnected")]
    Disconnected,

    #[error("central unsubscribed")]
    NotSubscribed,

    #[error("Bluetooth adapter not ready")]
    AdapterNotReady,

    #[error("service was un-published")]
    Unpublished,

    #[error("cancelled")]
    Cancelled,

    #[error("native stack error: {0}")]
    Native(NativeError),
}

/// Validation failure of an inbound read or write request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Characteristic not found: {characteristic}")]
    UnknownCharacteristic { characteristic: Uuid },

    #[error("Characteristic {characteristic} belongs to an unpublished service")]
    NotPublished { characteristic: Uuid },

    #[error("Characteristic {characteristic} is not writable")]
    WriteNotPermitted { characteristic: Uuid },

    #[error("Characteristic {characteristic} is not readable")]
    ReadNotPermitted { characteristic: Uuid },

    #[error("Offset {offset} is past the end of {characteristic} ({len} bytes)")]
    InvalidOffset {
        characteristic: Uuid,
        offset: usize,
        len: usize,
    },

    #[error("Value for {characteristic} is {len} bytes (max: {max})")]
    InvalidLength {
        characteristic: Uuid,
        len: usize,
        max: usize,
    },
}

impl DispatchError {
    /// ATT error the native stack should answer the request with
    pub fn att_error(&self) -> AttError {
        match self {
            DispatchError::UnknownCharacteristic { .. } | DispatchError::NotPublished { .. } => {
                AttError::AttributeNotFound
            }
            DispatchError::WriteNotPermitted { .. } => AttError::WriteNotPermitted,
            DispatchError::ReadNotPermitted { .. } => AttError::ReadNotPermitted,
            DispatchError::InvalidOffset { .. } => AttError::InvalidOffset,
            DispatchError::InvalidLength { .. } => AttError::InvalidAttributeValueLength,
        }
    }
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Coarse classification of a [`PeripheralError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AdapterNotReady,
    Definition,
    Publish,
    Advertise,
    Notify,
    Dispatch,
    Shutdown,
}

/// Any error the peripheral manager can return
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Advertising error: {0}")]
    Advertise(#[from] AdvertiseError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Peripheral manager has shut down")]
    Shutdown,
}

impl PeripheralError {
    /// Classify the error; adapter readiness wins over the operation family
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeripheralError::Publish(PublishError::AdapterNotReady { .. })
            | PeripheralError::Advertise(AdvertiseError::AdapterNotReady { .. })
            | PeripheralError::Notify(NotifyError::AdapterNotReady { .. }) => {
                ErrorKind::AdapterNotReady
            }
            PeripheralError::Definition(DefinitionError::Shutdown)
            | PeripheralError::Publish(PublishError::Shutdown)
            | PeripheralError::Advertise(AdvertiseError::Shutdown)
            | PeripheralError::Notify(NotifyError::Shutdown)
            | PeripheralError::Shutdown => ErrorKind::Shutdown,
            PeripheralError::Definition(_) => ErrorKind::Definition,
            PeripheralError::Publish(_) => ErrorKind::Publish,
            PeripheralError::Advertise(_) => ErrorKind::Advertise,
            PeripheralError::Notify(_) => ErrorKind::Notify,
            PeripheralError::Dispatch(_) => ErrorKind::Dispatch,
        }
    }
}

/// Result type for peripheral manager queries
pub type PeripheralResult<T> = std::result::Result<T, PeripheralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_display() {
        assert_eq!(NativeError::new("busy").to_string(), "busy");
        assert_eq!(
            NativeError::with_code(10, "out of resources").to_string(),
            "out of resources (native code 10)"
        );
    }

    #[test]
    fn test_error_kind_prefers_adapter_readiness() {
        let err: PeripheralError = PublishError::AdapterNotReady {
            state: AdapterState::PoweredOff,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::AdapterNotReady);

        let err: PeripheralError = PublishError::UnknownService {
            service: Uuid::nil(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Publish);

        let err: PeripheralError = NotifyError::Shutdown.into();
        assert_eq!(err.kind(), ErrorKind::Shutdown);
    }

    #[test]
    fn test_dispatch_error_maps_to_att() {
        let characteristic = Uuid::nil();
        assert_eq!(
            DispatchError::WriteNotPermitted { characteristic }.att_error(),
            AttError::WriteNotPermitted
        );
        assert_eq!(
            DispatchError::NotPublished { characteristic }.att_error(),
            AttError::AttributeNotFound
        );
    }
}
