//! Bluetooth Low Energy peripheral-role manager
//!
//! This crate hosts a GATT server on top of a native Bluetooth stack: it keeps
//! the service catalog, advertises, tracks connected centrals and their
//! subscriptions, routes their writes to listeners and fans notifications out
//! under the stack's flow control.
//!
//! ## Architecture
//!
//! - [`adapter`] - Radio power/authorization state
//! - [`gatt`] - Services, characteristics, descriptors and their validation
//! - [`registry`] - Service catalog; structure is frozen while published
//! - [`connection`] - Connected centrals and subscriptions
//! - [`advertising`] - Advertising session lifecycle
//! - [`dispatch`] - Inbound write/read validation and responses
//! - [`fanout`] - Per-central notification queues and retry on ready
//! - [`events`] - Listener registration and event delivery
//! - [`native`] - The stack boundary plus simulated and BlueZ stacks
//! - [`manager`] - The dispatch task and its caller handle
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bleperiph::{
//!     Characteristic, EventFilter, NotifyTarget, PeripheralBuilder, PeripheralEvent,
//!     ServiceDefinition, SimulatedStack, UART_RX_CHARACTERISTIC_UUID,
//!     UART_SERVICE_UUID, UART_TX_CHARACTERISTIC_UUID,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let peripheral = PeripheralBuilder::new(Arc::new(SimulatedStack::new())).start();
//!
//! let service = ServiceDefinition::new(UART_SERVICE_UUID)
//!     .with_characteristic(Characteristic::builder(UART_TX_CHARACTERISTIC_UUID).write().build())
//!     .with_characteristic(Characteristic::builder(UART_RX_CHARACTERISTIC_UUID).read().notify().build());
//! peripheral.define(service).await?;
//! peripheral.publish(UART_SERVICE_UUID).await?;
//! peripheral.start_advertising(UART_SERVICE_UUID, "uart-echo").await?;
//!
//! let mut events = peripheral.subscribe(EventFilter::All);
//! while let Some(event) = events.recv().await {
//!     if let PeripheralEvent::WriteRequest(write) = event {
//!         peripheral
//!             .notify(UART_RX_CHARACTERISTIC_UUID, write.value, NotifyTarget::AllSubscribed)
//!             .await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: BlueZ through `bluer` with the `bluez` feature
//! - **Everywhere**: [`SimulatedStack`] for tests and demos

pub mod adapter;
pub mod advertising;
pub mod central;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gatt;
pub mod manager;
pub mod native;
pub mod protocol;
pub mod registry;

// Public API exports
pub use adapter::AdapterState;
pub use advertising::{AdvertisingRequest, SessionId, SessionInfo, SessionState};
pub use central::{Central, CentralId, ConnectionState, Subscription, SubscriptionKind};
pub use config::PeripheralConfig;
pub use dispatch::{AttError, AttResponse, RequestId, WriteRequest};
pub use error::{
    AdvertiseError, DefinitionError, DeliveryFailure, DispatchError, ErrorKind, NativeError,
    NotifyError, PeripheralError, PeripheralResult, PublishError,
};
pub use events::{EventFilter, EventKind, EventSubscription, ListenerId, PeripheralEvent};
pub use fanout::{DeliveryReport, DeliveryStatus, NotificationId, NotifyTarget, TargetReport};
pub use gatt::{
    Characteristic, CharacteristicBuilder, Descriptor, Permission, Permissions, Properties,
    Property, ServiceBuilder, ServiceDefinition,
};
pub use manager::{PeripheralBuilder, PeripheralHandle, PeripheralInfo};
pub use native::{NativeEvent, NativeEventSender, NativeStack, SendOutcome, SimulatedStack};
pub use protocol::{
    parse_uuid, short_uuid, CLIENT_CONFIGURATION_UUID, UART_RX_CHARACTERISTIC_UUID,
    UART_SERVICE_UUID, UART_TX_CHARACTERISTIC_UUID, USER_DESCRIPTION_UUID,
};
pub use registry::{CharacteristicSummary, ServiceHandle, ServiceSummary};

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub use native::bluez::{BluezConfig, BluezStack};
