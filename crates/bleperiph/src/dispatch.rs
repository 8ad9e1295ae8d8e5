//! Inbound read/write request handling
//!
//! Every request the stack hands over is either answered or, for writes that
//! expect no response, logged. Validation failures are never dropped silently.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::central::CentralId;
use crate::error::DispatchError;
use crate::native::NativeStack;
use crate::protocol::MAX_ATTRIBUTE_LEN;
use crate::registry::ServiceRegistry;

// ----------------------------------------------------------------------------
// ATT Responses
// ----------------------------------------------------------------------------

/// Stack-assigned identifier of a request awaiting a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// ATT error codes the manager answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttError {
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    AttributeNotFound,
    InvalidAttributeValueLength,
    UnlikelyError,
}

impl AttError {
    /// ATT error code on the wire (Bluetooth Core Vol 3, Part F)
    pub fn code(self) -> u8 {
        match self {
            AttError::ReadNotPermitted => 0x02,
            AttError::WriteNotPermitted => 0x03,
            AttError::InvalidOffset => 0x07,
            AttError::AttributeNotFound => 0x0A,
            AttError::InvalidAttributeValueLength => 0x0D,
            AttError::UnlikelyError => 0x0E,
        }
    }
}

/// Answer to a read or write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttResponse {
    Value(Vec<u8>),
    Written,
    Error(AttError),
}

// ----------------------------------------------------------------------------
// Write Requests
// ----------------------------------------------------------------------------

/// A validated write, as delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub central: CentralId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    /// Write-with-response; the stack has already been answered
    pub respond_expected: bool,
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct WriteDispatcher {
    accepted: u64,
    rejected: u64,
}

impl WriteDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a write, store the value and answer the stack
    #[allow(clippy::too_many_arguments)]
    pub fn handle_write(
        &mut self,
        registry: &mut ServiceRegistry,
        stack: &dyn NativeStack,
        request: RequestId,
        central: CentralId,
        characteristic: Uuid,
        value: Vec<u8>,
        respond_expected: bool,
    ) -> Result<WriteRequest, DispatchError> {
        let service = match validate_write(registry, characteristic, value.len()) {
            Ok(service) => service,
            Err(err) => {
                self.rejected += 1;
                warn!("Rejecting write {} from {}: {}", request, central, err);
                if respond_expected {
                    stack.respond(request, AttResponse::Error(err.att_error()));
                }
                return Err(err);
            }
        };

        if let Err(err) = registry.set_value(characteristic, value.clone()) {
            warn!("Failed to cache written value for {}: {}", characteristic, err);
        }
        if respond_expected {
            stack.respond(request, AttResponse::Written);
        }

        self.accepted += 1;
        debug!(
            "Write {} from {} to {} ({} bytes)",
            request,
            central,
            characteristic,
            value.len()
        );
        Ok(WriteRequest {
            central,
            service,
            characteristic,
            value,
            respond_expected,
        })
    }

    /// Serve a read from the cached value
    pub fn handle_read(
        &mut self,
        registry: &ServiceRegistry,
        stack: &dyn NativeStack,
        request: RequestId,
        central: &CentralId,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<(), DispatchError> {
        match read_value(registry, characteristic, offset) {
            Ok(value) => {
                debug!("Read {} from {} on {}", request, central, characteristic);
                stack.respond(request, AttResponse::Value(value));
                Ok(())
            }
            Err(err) => {
                self.rejected += 1;
                warn!("Rejecting read {} from {}: {}", request, central, err);
                stack.respond(request, AttResponse::Error(err.att_error()));
                Err(err)
            }
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

/// Check a write target; returns the owning service
fn validate_write(
    registry: &ServiceRegistry,
    characteristic: Uuid,
    len: usize,
) -> Result<Uuid, DispatchError> {
    let target = registry
        .lookup(&characteristic)
        .ok_or(DispatchError::UnknownCharacteristic { characteristic })?;
    if !target.published {
        return Err(DispatchError::NotPublished { characteristic });
    }
    if !target.characteristic.is_writable() {
        return Err(DispatchError::WriteNotPermitted { characteristic });
    }
    if len > MAX_ATTRIBUTE_LEN {
        return Err(DispatchError::InvalidLength {
            characteristic,
            len,
            max: MAX_ATTRIBUTE_LEN,
        });
    }
    Ok(target.service)
}

fn read_value(
    registry: &ServiceRegistry,
    characteristic: Uuid,
    offset: usize,
) -> Result<Vec<u8>, DispatchError> {
    let target = registry
        .lookup(&characteristic)
        .ok_or(DispatchError::UnknownCharacteristic { characteristic })?;
    if !target.published {
        return Err(DispatchError::NotPublished { characteristic });
    }
    if !target.characteristic.is_readable() {
        return Err(DispatchError::ReadNotPermitted { characteristic });
    }
    let value = &target.characteristic.value;
    if offset > value.len() {
        return Err(DispatchError::InvalidOffset {
            characteristic,
            offset,
            len: value.len(),
        });
    }
    Ok(value[offset..].to_vec())
}
