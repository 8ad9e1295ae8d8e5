//! Connection registry: connected centrals and their subscriptions
//!
//! Only the dispatch task mutates the registry. Callers get cloned snapshots.

use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use crate::central::{Central, CentralId, SubscriptionKind};

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Result of applying a subscription report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// The report created the central record
    pub new_central: bool,
    /// The subscription flag changed
    pub changed: bool,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    centrals: BTreeMap<CentralId, Central>,
    fallback_max_update_len: usize,
}

impl ConnectionRegistry {
    pub fn new(fallback_max_update_len: usize) -> Self {
        Self {
            centrals: BTreeMap::new(),
            fallback_max_update_len,
        }
    }

    /// Record a central the stack is still connecting
    pub fn connecting(&mut self, id: CentralId) {
        let fallback = self.fallback_max_update_len;
        self.centrals
            .entry(id.clone())
            .or_insert_with(|| Central::new(id, fallback));
    }

    /// Record a connected central; returns true if it was not connected before
    pub fn connected(&mut self, id: CentralId, max_update_len: Option<usize>) -> bool {
        let fallback = self.fallback_max_update_len;
        let central = self
            .centrals
            .entry(id.clone())
            .or_insert_with(|| Central::new(id, fallback));
        if let Some(len) = max_update_len {
            central.set_max_update_len(len);
        }
        let newly = !central.is_connected();
        central.mark_connected();
        newly
    }

    /// Apply a subscription report, creating the central on first sight
    pub fn subscribe(
        &mut self,
        id: CentralId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
        max_update_len: Option<usize>,
    ) -> SubscriptionUpdate {
        let new_central = !self
            .centrals
            .get(&id)
            .map(Central::is_connected)
            .unwrap_or(false);
        self.connected(id.clone(), max_update_len);

        let changed = match self.centrals.get_mut(&id) {
            Some(central) => central.set_subscription(characteristic, kind, enabled),
            None => false,
        };
        debug!(
            "Central {} {:?} on {}: {} (changed: {})",
            id, kind, characteristic, enabled, changed
        );
        SubscriptionUpdate {
            new_central,
            changed,
        }
    }

    /// Remove a central and its subscriptions in one step; a central that
    /// never finished connecting is forgotten and not returned
    pub fn remove(&mut self, id: &CentralId) -> Option<Central> {
        self.centrals.remove(id).filter(Central::is_connected).map(|mut central| {
            central.mark_disconnected();
            central
        })
    }

    /// Remove every central; returns the ones that had finished connecting
    pub fn remove_all(&mut self) -> Vec<Central> {
        std::mem::take(&mut self.centrals)
            .into_values()
            .filter(Central::is_connected)
            .map(|mut central| {
                central.mark_disconnected();
                central
            })
            .collect()
    }

    /// Forget subscriptions to characteristics that were un-published
    pub fn drop_characteristics(&mut self, characteristics: &[Uuid]) {
        for central in self.centrals.values_mut() {
            central.forget(characteristics);
        }
    }

    pub fn get(&self, id: &CentralId) -> Option<&Central> {
        self.centrals.get(id)
    }

    pub fn contains(&self, id: &CentralId) -> bool {
        self.centrals.contains_key(id)
    }

    /// Snapshot of every connected central
    pub fn connected_centrals(&self) -> Vec<Central> {
        self.centrals
            .values()
            .filter(|central| central.is_connected())
            .cloned()
            .collect()
    }

    /// Snapshot of centrals subscribed to a characteristic
    pub fn subscribers(&self, characteristic: &Uuid) -> Vec<Central> {
        self.centrals
            .values()
            .filter(|central| central.is_connected() && central.is_subscribed(characteristic))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.centrals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centrals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic() -> Uuid {
        Uuid::from_u128(0xC2)
    }

    #[test]
    fn test_subscription_creates_central_with_mtu() {
        let mut registry = ConnectionRegistry::new(20);
        let update = registry.subscribe(
            "a".into(),
            characteristic(),
            SubscriptionKind::Notify,
            true,
            Some(512),
        );

        assert!(update.new_central);
        assert!(update.changed);
        let central = registry.get(&"a".into()).unwrap();
        assert_eq!(central.max_update_len, 512);
        assert_eq!(registry.subscribers(&characteristic()).len(), 1);
    }

    #[test]
    fn test_fallback_mtu_used_when_unknown() {
        let mut registry = ConnectionRegistry::new(20);
        registry.subscribe(
            "a".into(),
            characteristic(),
            SubscriptionKind::Notify,
            true,
            None,
        );
        assert_eq!(registry.get(&"a".into()).unwrap().max_update_len, 20);
    }

    #[test]
    fn test_connecting_centrals_are_not_listed() {
        let mut registry = ConnectionRegistry::new(20);
        registry.connecting("a".into());
        assert!(registry.contains(&"a".into()));
        assert!(registry.connected_centrals().is_empty());

        assert!(registry.connected("a".into(), Some(100)));
        assert!(!registry.connected("a".into(), None));
        assert_eq!(registry.connected_centrals().len(), 1);

        registry.connecting("b".into());
        assert!(registry.remove(&"b".into()).is_none());
        assert!(!registry.contains(&"b".into()));
        assert_eq!(registry.remove_all().len(), 1);
    }

    #[test]
    fn test_remove_clears_subscribers() {
        let mut registry = ConnectionRegistry::new(20);
        registry.subscribe(
            "a".into(),
            characteristic(),
            SubscriptionKind::Indicate,
            true,
            None,
        );
        let removed = registry.remove(&"a".into()).unwrap();

        assert!(removed.subscriptions.is_empty());
        assert!(registry.subscribers(&characteristic()).is_empty());
        assert!(registry.remove(&"a".into()).is_none());
    }

    #[test]
    fn test_drop_characteristics() {
        let mut registry = ConnectionRegistry::new(20);
        registry.subscribe(
            "a".into(),
            characteristic(),
            SubscriptionKind::Notify,
            true,
            None,
        );
        registry.drop_characteristics(&[characteristic()]);
        assert!(registry.subscribers(&characteristic()).is_empty());
        assert_eq!(registry.connected_centrals().len(), 1);
    }
}
