//! Event bus
//!
//! Listeners register through [`EventSubscription`] handles. Registrations
//! and cancellations travel through the manager's input queue, so a listener
//! added while an event is being delivered only sees the events after it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::advertising::SessionInfo;
use crate::central::{CentralId, SubscriptionKind};
use crate::dispatch::WriteRequest;
use crate::error::DeliveryFailure;
use crate::fanout::{DeliveryOutcome, NotificationId};
use crate::manager::{Command, Input};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Event categories listeners can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    AdapterState,
    Connection,
    Subscription,
    Write,
    Notification,
    Advertising,
}

/// Everything the manager reports to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeripheralEvent {
    /// Sent for every report from the stack, repeats included
    AdapterStateChanged {
        previous: AdapterState,
        current: AdapterState,
    },
    CentralConnected {
        central: CentralId,
        max_update_len: usize,
    },
    /// `purged` counts queued notifications failed by the disconnect
    CentralDisconnected {
        central: CentralId,
        purged: usize,
    },
    SubscriptionChanged {
        central: CentralId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
    },
    WriteRequest(WriteRequest),
    NotificationDelivered {
        notification: NotificationId,
        central: CentralId,
        characteristic: Uuid,
    },
    NotificationFailed {
        notification: NotificationId,
        central: CentralId,
        characteristic: Uuid,
        reason: DeliveryFailure,
    },
    AdvertisingStateChanged(SessionInfo),
}

impl PeripheralEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeripheralEvent::AdapterStateChanged { .. } => EventKind::AdapterState,
            PeripheralEvent::CentralConnected { .. } | PeripheralEvent::CentralDisconnected { .. } => {
                EventKind::Connection
            }
            PeripheralEvent::SubscriptionChanged { .. } => EventKind::Subscription,
            PeripheralEvent::WriteRequest(_) => EventKind::Write,
            PeripheralEvent::NotificationDelivered { .. }
            | PeripheralEvent::NotificationFailed { .. } => EventKind::Notification,
            PeripheralEvent::AdvertisingStateChanged(_) => EventKind::Advertising,
        }
    }
}

impl From<DeliveryOutcome> for PeripheralEvent {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Delivered {
                notification,
                central,
                characteristic,
            } => PeripheralEvent::NotificationDelivered {
                notification,
                central,
                characteristic,
            },
            DeliveryOutcome::Failed {
                notification,
                central,
                characteristic,
                reason,
            } => PeripheralEvent::NotificationFailed {
                notification,
                central,
                characteristic,
                reason,
            },
        }
    }
}

/// Which events a listener receives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    #[default]
    All,
    Only(Vec<EventKind>),
}

impl EventFilter {
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        EventFilter::Only(kinds.into_iter().collect())
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Bus
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Listener {
    id: ListenerId,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<PeripheralEvent>,
}

#[derive(Debug, Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
    pending: Vec<Listener>,
    dropped_writes: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a listener; it becomes active before the next published event
    pub fn register(
        &mut self,
        id: ListenerId,
        filter: EventFilter,
        sender: mpsc::UnboundedSender<PeripheralEvent>,
    ) {
        debug!("Registering {}", id);
        self.pending.push(Listener { id, filter, sender });
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.pending.retain(|listener| listener.id != id);
        self.listeners.retain(|listener| listener.id != id);
    }

    /// Deliver one event.
    ///
    /// Write requests go to exactly one listener, the earliest registered
    /// live one that accepts writes. Everything else goes to every match.
    pub fn publish(&mut self, event: PeripheralEvent) {
        self.listeners.append(&mut self.pending);
        let kind = event.kind();

        if kind == EventKind::Write {
            let mut pending = Some(event);
            for listener in self.listeners.iter().filter(|l| l.filter.matches(kind)) {
                let Some(event) = pending.take() else { break };
                if let Err(mpsc::error::SendError(event)) = listener.sender.send(event) {
                    pending = Some(event);
                }
            }
            if let Some(PeripheralEvent::WriteRequest(write)) = pending {
                self.dropped_writes += 1;
                warn!(
                    "No listener for write from {} to {}; dropping {} bytes",
                    write.central,
                    write.characteristic,
                    write.value.len()
                );
            }
        } else {
            for listener in self.listeners.iter().filter(|l| l.filter.matches(kind)) {
                let _ = listener.sender.send(event.clone());
            }
        }

        self.listeners.retain(|listener| !listener.sender.is_closed());
    }

    pub fn publish_all(&mut self, events: impl IntoIterator<Item = PeripheralEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Active plus queued listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len() + self.pending.len()
    }

    /// Write events dropped for lack of a listener
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    /// Close every listener stream
    pub fn close(&mut self) {
        self.pending.clear();
        self.listeners.clear();
    }
}

// ----------------------------------------------------------------------------
// Subscription Handle
// ----------------------------------------------------------------------------

/// Receiving end of a listener registration; dropping it cancels
#[derive(Debug)]
pub struct EventSubscription {
    id: ListenerId,
    events: mpsc::UnboundedReceiver<PeripheralEvent>,
    inputs: mpsc::WeakUnboundedSender<Input>,
}

impl EventSubscription {
    pub(crate) fn new(
        id: ListenerId,
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
        inputs: &mpsc::UnboundedSender<Input>,
    ) -> Self {
        Self {
            id,
            events,
            inputs: inputs.downgrade(),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next event; `None` once cancelled or the manager has shut down
    pub async fn recv(&mut self) -> Option<PeripheralEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PeripheralEvent> {
        self.events.try_recv().ok()
    }

    /// Stop receiving events
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.events.close();
        if let Some(inputs) = self.inputs.upgrade() {
            let _ = inputs.send(Input::Command(Command::Unsubscribe(self.id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_event() -> PeripheralEvent {
        PeripheralEvent::WriteRequest(WriteRequest {
            central: "a".into(),
            service: Uuid::from_u128(1),
            characteristic: Uuid::from_u128(2),
            value: vec![0x48, 0x49],
            respond_expected: true,
        })
    }

    fn state_event() -> PeripheralEvent {
        PeripheralEvent::AdapterStateChanged {
            previous: AdapterState::PoweredOn,
            current: AdapterState::PoweredOn,
        }
    }

    #[test]
    fn test_write_goes_to_exactly_one_listener() {
        let mut bus = EventBus::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        bus.register(ListenerId(1), EventFilter::All, first_tx);
        bus.register(ListenerId(2), EventFilter::All, second_tx);

        bus.publish(write_event());
        bus.publish(state_event());

        assert_eq!(first_rx.try_recv().ok(), Some(write_event()));
        assert_eq!(first_rx.try_recv().ok(), Some(state_event()));
        assert_eq!(second_rx.try_recv().ok(), Some(state_event()));
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn test_write_skips_closed_and_filtered_listeners() {
        let mut bus = EventBus::new();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel();
        bus.register(ListenerId(1), EventFilter::All, closed_tx);
        bus.register(ListenerId(2), EventFilter::only([EventKind::AdapterState]), state_tx);
        bus.register(ListenerId(3), EventFilter::only([EventKind::Write]), write_tx);
        drop(closed_rx);

        bus.publish(write_event());

        assert_eq!(write_rx.try_recv().ok(), Some(write_event()));
        assert_eq!(bus.listener_count(), 2);
        assert_eq!(bus.dropped_writes(), 0);
    }

    #[test]
    fn test_write_without_listener_is_counted() {
        let mut bus = EventBus::new();
        bus.publish(write_event());
        assert_eq!(bus.dropped_writes(), 1);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let mut bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register(ListenerId(1), EventFilter::All, tx);
        bus.unregister(ListenerId(1));

        bus.publish(state_event());
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.listener_count(), 0);
    }
}
