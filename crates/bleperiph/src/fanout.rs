//! Notification fan-out engine
//!
//! Resolves notify targets against the connection registry, enforces each
//! central's max update length and keeps a FIFO queue per central for
//! values the stack could not take yet. Queued values are retried when the
//! stack signals it is ready; every queued value ends delivered or failed.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::central::{Central, CentralId};
use crate::connection::ConnectionRegistry;
use crate::error::{DeliveryFailure, NativeError};
use crate::native::{NativeStack, SendOutcome};

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// Identifier of one notify call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ntf-{}", self.0)
    }
}

/// Which centrals a notify call addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyTarget {
    /// Every central subscribed to the characteristic at call time
    AllSubscribed,
    /// One central; must be subscribed
    Central(CentralId),
    /// Every connected central; unsubscribed ones report `NotSubscribed`
    AllConnected,
}

/// Outcome for one target of a notify call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Delivered,
    /// Waiting in the central's queue; the final outcome arrives as an event
    Queued,
    PayloadTooLarge { len: usize, max: usize },
    NotSubscribed,
    Disconnected,
    WouldBlockExceeded { depth: usize },
    Failed(NativeError),
}

impl DeliveryStatus {
    /// Delivered now or on its way
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Queued)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub central: CentralId,
    pub status: DeliveryStatus,
}

/// Per-target statuses of one notify call, fixed when the call returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub notification: NotificationId,
    pub characteristic: Uuid,
    pub targets: Vec<TargetReport>,
}

impl DeliveryReport {
    pub fn status_for(&self, central: &CentralId) -> Option<&DeliveryStatus> {
        self.targets
            .iter()
            .find(|target| &target.central == central)
            .map(|target| &target.status)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.count(|status| *status == DeliveryStatus::Delivered)
    }

    pub fn queued_count(&self) -> usize {
        self.count(|status| *status == DeliveryStatus::Queued)
    }

    /// Targets that will not receive the value
    pub fn rejected_count(&self) -> usize {
        self.count(|status| !status.is_accepted())
    }

    fn count(&self, predicate: impl Fn(&DeliveryStatus) -> bool) -> usize {
        self.targets
            .iter()
            .filter(|target| predicate(&target.status))
            .count()
    }
}

/// Final outcome of a queued notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    Delivered {
        notification: NotificationId,
        central: CentralId,
        characteristic: Uuid,
    },
    Failed {
        notification: NotificationId,
        central: CentralId,
        characteristic: Uuid,
        reason: DeliveryFailure,
    },
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedNotification {
    notification: NotificationId,
    characteristic: Uuid,
    payload: Vec<u8>,
    enqueued_at: Instant,
}

impl QueuedNotification {
    fn fail(self, central: &CentralId, reason: DeliveryFailure) -> DeliveryOutcome {
        DeliveryOutcome::Failed {
            notification: self.notification,
            central: central.clone(),
            characteristic: self.characteristic,
            reason,
        }
    }
}

#[derive(Debug)]
pub struct NotificationEngine {
    queues: BTreeMap<CentralId, VecDeque<QueuedNotification>>,
    max_queue_depth: usize,
    next_id: u64,
}

impl NotificationEngine {
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            queues: BTreeMap::new(),
            max_queue_depth,
            next_id: 0,
        }
    }

    /// Fan a value out to the resolved targets.
    ///
    /// The caller has already checked the characteristic and the radio.
    pub fn notify(
        &mut self,
        connections: &ConnectionRegistry,
        stack: &dyn NativeStack,
        characteristic: Uuid,
        payload: &[u8],
        target: &NotifyTarget,
    ) -> DeliveryReport {
        self.next_id += 1;
        let notification = NotificationId(self.next_id);

        let targets = resolve_targets(connections, &characteristic, target)
            .into_iter()
            .map(|(central, resolved)| {
                let status = match resolved {
                    Ok(central) => {
                        self.deliver(stack, notification, &central, characteristic, payload)
                    }
                    Err(status) => status,
                };
                TargetReport { central, status }
            })
            .collect::<Vec<_>>();

        debug!(
            "Notification {} on {}: {} targets",
            notification,
            characteristic,
            targets.len()
        );
        DeliveryReport {
            notification,
            characteristic,
            targets,
        }
    }

    fn deliver(
        &mut self,
        stack: &dyn NativeStack,
        notification: NotificationId,
        central: &Central,
        characteristic: Uuid,
        payload: &[u8],
    ) -> DeliveryStatus {
        if payload.len() > central.max_update_len {
            return DeliveryStatus::PayloadTooLarge {
                len: payload.len(),
                max: central.max_update_len,
            };
        }

        let queued = QueuedNotification {
            notification,
            characteristic,
            payload: payload.to_vec(),
            enqueued_at: Instant::now(),
        };

        // Anything already waiting goes first
        if self.queue_depth(&central.id) > 0 {
            return self.enqueue(&central.id, queued);
        }

        match stack.send_value(&central.id, characteristic, payload) {
            SendOutcome::Delivered => DeliveryStatus::Delivered,
            SendOutcome::WouldBlock => {
                trace!("Stack busy for {}, queueing {}", central.id, notification);
                self.enqueue(&central.id, queued)
            }
            SendOutcome::Failed(err) => {
                warn!(
                    "Native send of {} to {} failed: {}",
                    notification, central.id, err
                );
                DeliveryStatus::Failed(err)
            }
        }
    }

    fn enqueue(&mut self, central: &CentralId, queued: QueuedNotification) -> DeliveryStatus {
        let queue = self.queues.entry(central.clone()).or_default();
        if queue.len() >= self.max_queue_depth {
            if queue.is_empty() {
                self.queues.remove(central);
            }
            return DeliveryStatus::WouldBlockExceeded {
                depth: self.max_queue_depth,
            };
        }
        queue.push_back(queued);
        DeliveryStatus::Queued
    }

    /// Retry queued values in enqueue order after the stack signalled
    /// readiness; each central stops at its first `WouldBlock`.
    pub fn drain(
        &mut self,
        connections: &ConnectionRegistry,
        stack: &dyn NativeStack,
    ) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();

        for (central, queue) in self.queues.iter_mut() {
            let record = connections.get(central);
            while let Some(next) = queue.front() {
                let subscribed = record
                    .map(|c| c.is_subscribed(&next.characteristic))
                    .unwrap_or(false);
                if record.is_none() || !subscribed {
                    let reason = if record.is_none() {
                        DeliveryFailure::Disconnected
                    } else {
                        DeliveryFailure::NotSubscribed
                    };
                    if let Some(dropped) = queue.pop_front() {
                        outcomes.push(dropped.fail(central, reason));
                    }
                    continue;
                }

                match stack.send_value(central, next.characteristic, &next.payload) {
                    SendOutcome::WouldBlock => break,
                    SendOutcome::Delivered => {
                        if let Some(sent) = queue.pop_front() {
                            trace!(
                                "Delivered {} to {} after {:?}",
                                sent.notification,
                                central,
                                sent.enqueued_at.elapsed()
                            );
                            outcomes.push(DeliveryOutcome::Delivered {
                                notification: sent.notification,
                                central: central.clone(),
                                characteristic: sent.characteristic,
                            });
                        }
                    }
                    SendOutcome::Failed(err) => {
                        if let Some(failed) = queue.pop_front() {
                            outcomes.push(failed.fail(central, DeliveryFailure::Native(err)));
                        }
                    }
                }
            }
        }

        self.queues.retain(|_, queue| !queue.is_empty());
        outcomes
    }

    /// Fail everything queued for a central
    pub fn purge_central(
        &mut self,
        central: &CentralId,
        reason: DeliveryFailure,
    ) -> Vec<DeliveryOutcome> {
        self.queues
            .remove(central)
            .map(|queue| {
                queue
                    .into_iter()
                    .map(|queued| queued.fail(central, reason.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fail a central's queued values for one characteristic
    pub fn purge_subscription(
        &mut self,
        central: &CentralId,
        characteristic: &Uuid,
    ) -> Vec<DeliveryOutcome> {
        self.purge_where(
            |id, queued| id == central && queued.characteristic == *characteristic,
            DeliveryFailure::NotSubscribed,
        )
    }

    /// Fail every queued value for the given characteristics
    pub fn purge_characteristics(
        &mut self,
        characteristics: &[Uuid],
        reason: DeliveryFailure,
    ) -> Vec<DeliveryOutcome> {
        self.purge_where(
            |_, queued| characteristics.contains(&queued.characteristic),
            reason,
        )
    }

    /// Fail everything queued
    pub fn purge_all(&mut self, reason: DeliveryFailure) -> Vec<DeliveryOutcome> {
        self.purge_where(|_, _| true, reason)
    }

    fn purge_where(
        &mut self,
        matches: impl Fn(&CentralId, &QueuedNotification) -> bool,
        reason: DeliveryFailure,
    ) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        for (central, queue) in self.queues.iter_mut() {
            let (purged, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(queue)
                .into_iter()
                .partition(|queued| matches(central, queued));
            *queue = kept;
            outcomes.extend(
                purged
                    .into_iter()
                    .map(|queued| queued.fail(central, reason.clone())),
            );
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        if !outcomes.is_empty() {
            debug!("Purged {} queued notifications ({})", outcomes.len(), reason);
        }
        outcomes
    }

    pub fn queue_depth(&self, central: &CentralId) -> usize {
        self.queues.get(central).map(VecDeque::len).unwrap_or(0)
    }

    /// Total queued values across all centrals
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

/// Snapshot the target set; an `Err` carries the final status for that central
fn resolve_targets(
    connections: &ConnectionRegistry,
    characteristic: &Uuid,
    target: &NotifyTarget,
) -> Vec<(CentralId, Result<Central, DeliveryStatus>)> {
    let gate = |central: Central| {
        let status = if central.is_subscribed(characteristic) {
            Ok(central.clone())
        } else {
            Err(DeliveryStatus::NotSubscribed)
        };
        (central.id, status)
    };

    match target {
        NotifyTarget::AllSubscribed => connections
            .subscribers(characteristic)
            .into_iter()
            .map(|central| (central.id.clone(), Ok(central)))
            .collect(),
        NotifyTarget::AllConnected => connections
            .connected_centrals()
            .into_iter()
            .map(gate)
            .collect(),
        NotifyTarget::Central(id) => match connections.get(id) {
            Some(central) if central.is_connected() => vec![gate(central.clone())],
            _ => vec![(id.clone(), Err(DeliveryStatus::Disconnected))],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::SubscriptionKind;
    use crate::native::simulated::SimulatedStack;

    fn characteristic() -> Uuid {
        Uuid::from_u128(0xC2)
    }

    fn registry(centrals: &[(&str, usize)]) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new(20);
        for (id, mtu) in centrals {
            registry.subscribe(
                (*id).into(),
                characteristic(),
                SubscriptionKind::Notify,
                true,
                Some(*mtu),
            );
        }
        registry
    }

    #[test]
    fn test_no_subscribers_is_empty_report() {
        let connections = registry(&[]);
        let stack = SimulatedStack::new();
        let mut engine = NotificationEngine::new(8);

        let report = engine.notify(
            &connections,
            &stack,
            characteristic(),
            b"hi",
            &NotifyTarget::AllSubscribed,
        );
        assert_eq!(report.target_count(), 0);
    }

    #[test]
    fn test_payload_checked_per_central() {
        let connections = registry(&[("a", 20), ("b", 512)]);
        let stack = SimulatedStack::new();
        let mut engine = NotificationEngine::new(8);

        let report = engine.notify(
            &connections,
            &stack,
            characteristic(),
            &[7; 30],
            &NotifyTarget::AllSubscribed,
        );

        assert_eq!(
            report.status_for(&"a".into()),
            Some(&DeliveryStatus::PayloadTooLarge { len: 30, max: 20 })
        );
        assert_eq!(report.status_for(&"b".into()), Some(&DeliveryStatus::Delivered));
        assert_eq!(stack.sent_values().len(), 1);
    }

    #[test]
    fn test_would_block_queues_then_drains_in_order() {
        let connections = registry(&[("a", 20)]);
        let stack = SimulatedStack::new();
        stack.push_send_outcome(SendOutcome::WouldBlock);
        let mut engine = NotificationEngine::new(8);

        let first = engine.notify(&connections, &stack, characteristic(), b"1", &NotifyTarget::AllSubscribed);
        let second = engine.notify(&connections, &stack, characteristic(), b"2", &NotifyTarget::AllSubscribed);
        assert_eq!(first.status_for(&"a".into()), Some(&DeliveryStatus::Queued));
        assert_eq!(second.status_for(&"a".into()), Some(&DeliveryStatus::Queued));
        assert_eq!(engine.pending(), 2);

        let outcomes = engine.drain(&connections, &stack);
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            &outcomes[0],
            DeliveryOutcome::Delivered { notification, .. } if *notification == first.notification
        ));
        let payloads: Vec<Vec<u8>> = stack.sent_values().into_iter().map(|sent| sent.value).collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_drain_stops_at_would_block() {
        let connections = registry(&[("a", 20)]);
        let stack = SimulatedStack::new();
        stack.push_send_outcome(SendOutcome::WouldBlock);
        let mut engine = NotificationEngine::new(8);
        engine.notify(&connections, &stack, characteristic(), b"1", &NotifyTarget::AllSubscribed);
        engine.notify(&connections, &stack, characteristic(), b"2", &NotifyTarget::AllSubscribed);

        stack.push_send_outcome(SendOutcome::Delivered);
        stack.push_send_outcome(SendOutcome::WouldBlock);
        let outcomes = engine.drain(&connections, &stack);

        assert_eq!(outcomes.len(), 1);
        assert_eq!(engine.queue_depth(&"a".into()), 1);
    }

    #[test]
    fn test_queue_bound() {
        let connections = registry(&[("a", 20)]);
        let stack = SimulatedStack::new();
        stack.push_send_outcome(SendOutcome::WouldBlock);
        let mut engine = NotificationEngine::new(1);

        engine.notify(&connections, &stack, characteristic(), b"1", &NotifyTarget::AllSubscribed);
        let report = engine.notify(&connections, &stack, characteristic(), b"2", &NotifyTarget::AllSubscribed);
        assert_eq!(
            report.status_for(&"a".into()),
            Some(&DeliveryStatus::WouldBlockExceeded { depth: 1 })
        );
    }

    #[test]
    fn test_all_connected_reports_unsubscribed() {
        let mut connections = registry(&[("a", 20)]);
        connections.connected("b".into(), Some(100));
        let stack = SimulatedStack::new();
        let mut engine = NotificationEngine::new(8);

        let report = engine.notify(&connections, &stack, characteristic(), b"x", &NotifyTarget::AllConnected);
        assert_eq!(report.status_for(&"a".into()), Some(&DeliveryStatus::Delivered));
        assert_eq!(report.status_for(&"b".into()), Some(&DeliveryStatus::NotSubscribed));

        let report = engine.notify(
            &connections,
            &stack,
            characteristic(),
            b"x",
            &NotifyTarget::Central("zz".into()),
        );
        assert_eq!(report.status_for(&"zz".into()), Some(&DeliveryStatus::Disconnected));
    }

    #[test]
    fn test_purge_central_fails_everything_queued() {
        let connections = registry(&[("a", 20)]);
        let stack = SimulatedStack::new();
        stack.push_send_outcome(SendOutcome::WouldBlock);
        let mut engine = NotificationEngine::new(8);
        engine.notify(&connections, &stack, characteristic(), b"1", &NotifyTarget::AllSubscribed);
        engine.notify(&connections, &stack, characteristic(), b"2", &NotifyTarget::AllSubscribed);

        let outcomes = engine.purge_central(&"a".into(), DeliveryFailure::Disconnected);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            DeliveryOutcome::Failed { reason: DeliveryFailure::Disconnected, .. }
        )));
        assert_eq!(engine.pending(), 0);
    }
}
