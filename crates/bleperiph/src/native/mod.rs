//! Native Bluetooth stack boundary
//!
//! The manager talks to the radio only through [`NativeStack`]. Stacks report
//! their callbacks as [`NativeEvent`]s through the [`NativeEventSender`] they
//! receive on attach; those events share one ordered queue with caller
//! commands.

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;
pub mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::advertising::AdvertisingRequest;
use crate::central::{CentralId, SubscriptionKind};
use crate::dispatch::{AttResponse, RequestId};
use crate::error::NativeError;
use crate::gatt::ServiceDefinition;
use crate::manager::Input;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub use bluez::BluezStack;
pub use simulated::SimulatedStack;

// ----------------------------------------------------------------------------
// Stack Trait
// ----------------------------------------------------------------------------

/// Immediate result of handing a value to the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Outgoing buffer full; retry after `ReadyToSendMore`
    WouldBlock,
    Failed(NativeError),
}

/// Capability provider for the peripheral role
#[async_trait]
pub trait NativeStack: Send + Sync {
    /// Hand the stack its event sink; called once when the manager starts
    fn attach(&self, events: NativeEventSender);

    /// State of the radio at attach time
    fn power_state(&self) -> AdapterState;

    /// Register a service; resolves when the stack confirms or rejects it
    async fn publish_service(&self, service: &ServiceDefinition) -> Result<(), NativeError>;

    async fn unpublish_service(&self, service: Uuid) -> Result<(), NativeError>;

    async fn start_advertising(&self, request: &AdvertisingRequest) -> Result<(), NativeError>;

    async fn stop_advertising(&self) -> Result<(), NativeError>;

    /// Push a value to one central without waiting
    fn send_value(&self, central: &CentralId, characteristic: Uuid, value: &[u8]) -> SendOutcome;

    /// Answer a read or write request
    fn respond(&self, request: RequestId, response: AttResponse);
}

// ----------------------------------------------------------------------------
// Inbound Events
// ----------------------------------------------------------------------------

/// Callback from the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    StateChanged(AdapterState),
    CentralConnecting {
        central: CentralId,
    },
    CentralConnected {
        central: CentralId,
        max_update_len: Option<usize>,
    },
    CentralSubscribed {
        central: CentralId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
        max_update_len: Option<usize>,
    },
    CentralDisconnected {
        central: CentralId,
    },
    WriteRequest {
        request: RequestId,
        central: CentralId,
        characteristic: Uuid,
        value: Vec<u8>,
        respond_expected: bool,
    },
    ReadRequest {
        request: RequestId,
        central: CentralId,
        characteristic: Uuid,
        offset: usize,
    },
    ReadyToSendMore,
}

/// Sink a stack reports its callbacks through
///
/// Holds a weak sender, so a stack keeping it does not keep the manager
/// alive after the last handle is gone.
#[derive(Debug, Clone)]
pub struct NativeEventSender {
    inputs: mpsc::WeakUnboundedSender<Input>,
}

impl NativeEventSender {
    pub(crate) fn new(inputs: &mpsc::UnboundedSender<Input>) -> Self {
        Self {
            inputs: inputs.downgrade(),
        }
    }

    /// Queue an event; false once the manager has stopped
    pub fn send(&self, event: NativeEvent) -> bool {
        match self.inputs.upgrade() {
            Some(inputs) => inputs.send(Input::Native(event)).is_ok(),
            None => false,
        }
    }

    pub fn state_changed(&self, state: AdapterState) -> bool {
        self.send(NativeEvent::StateChanged(state))
    }

    pub fn central_connecting(&self, central: CentralId) -> bool {
        self.send(NativeEvent::CentralConnecting { central })
    }

    pub fn central_connected(&self, central: CentralId, max_update_len: Option<usize>) -> bool {
        self.send(NativeEvent::CentralConnected {
            central,
            max_update_len,
        })
    }

    pub fn central_disconnected(&self, central: CentralId) -> bool {
        self.send(NativeEvent::CentralDisconnected { central })
    }

    pub fn ready_to_send_more(&self) -> bool {
        self.send(NativeEvent::ReadyToSendMore)
    }
}
