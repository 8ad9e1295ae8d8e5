//! Remote central state

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gatt::Property;
use crate::protocol::MIN_MAX_UPDATE_LEN;

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Stack-assigned identifier, unique for the lifetime of one connection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CentralId(String);

impl CentralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CentralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CentralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ----------------------------------------------------------------------------
// Central State
// ----------------------------------------------------------------------------

/// Connection state of a central
///
/// Disconnected is terminal: the registry drops the entry rather than keeping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Which kind of value push a subscription refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Notify,
    Indicate,
}

impl SubscriptionKind {
    /// Property bit a characteristic must carry to accept this kind
    pub fn property(self) -> Property {
        match self {
            SubscriptionKind::Notify => Property::Notify,
            SubscriptionKind::Indicate => Property::Indicate,
        }
    }
}

/// Notify and indicate are enabled independently
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub notify: bool,
    pub indicate: bool,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.notify || self.indicate
    }

    /// Set one flag; returns true when the flag actually changed
    pub fn set(&mut self, kind: SubscriptionKind, enabled: bool) -> bool {
        let flag = match kind {
            SubscriptionKind::Notify => &mut self.notify,
            SubscriptionKind::Indicate => &mut self.indicate,
        };
        let changed = *flag != enabled;
        *flag = enabled;
        changed
    }
}

/// A remote device connected in the client role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Central {
    /// Stack identifier
    pub id: CentralId,
    /// Largest notification payload this connection carries
    pub max_update_len: usize,
    /// Connection state
    pub state: ConnectionState,
    /// When the central was first seen
    pub connected_at: SystemTime,
    /// Subscriptions keyed by characteristic UUID
    pub subscriptions: HashMap<Uuid, Subscription>,
}

impl Central {
    /// Create a central; lengths below the GATT minimum are raised to it
    pub fn new(id: CentralId, max_update_len: usize) -> Self {
        Self {
            id,
            max_update_len: max_update_len.max(MIN_MAX_UPDATE_LEN),
            state: ConnectionState::Connecting,
            connected_at: SystemTime::now(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.subscriptions.clear();
    }

    pub fn set_max_update_len(&mut self, len: usize) {
        self.max_update_len = len.max(MIN_MAX_UPDATE_LEN);
    }

    /// Update one subscription flag; returns true on change
    pub fn set_subscription(
        &mut self,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
    ) -> bool {
        let entry = self.subscriptions.entry(characteristic).or_default();
        let changed = entry.set(kind, enabled);
        if !entry.is_active() {
            self.subscriptions.remove(&characteristic);
        }
        changed
    }

    pub fn is_subscribed(&self, characteristic: &Uuid) -> bool {
        self.subscriptions
            .get(characteristic)
            .map(Subscription::is_active)
            .unwrap_or(false)
    }

    /// Drop subscriptions for characteristics that no longer exist
    pub fn forget(&mut self, characteristics: &[Uuid]) {
        self.subscriptions
            .retain(|uuid, _| !characteristics.contains(uuid));
    }
}
