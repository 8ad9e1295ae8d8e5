//! Adapter state monitor
//!
//! Holds the last power/authorization state reported by the native stack and
//! mirrors it into a `watch` channel so handles can read it without a round
//! trip through the dispatch task.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ----------------------------------------------------------------------------
// Adapter State
// ----------------------------------------------------------------------------

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "poweredOff",
            AdapterState::PoweredOn => "poweredOn",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state report from the stack; repeats are reported too
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterTransition {
    pub previous: AdapterState,
    pub current: AdapterState,
}

impl AdapterTransition {
    /// The stack re-sent the state we already had
    pub fn is_repeat(&self) -> bool {
        self.previous == self.current
    }

    /// The radio was usable and no longer is
    pub fn lost_power(&self) -> bool {
        self.previous.is_powered_on() && !self.current.is_powered_on()
    }
}

// ----------------------------------------------------------------------------
// Monitor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct AdapterMonitor {
    state: watch::Sender<AdapterState>,
    reports: u64,
}

impl AdapterMonitor {
    pub fn new(initial: AdapterState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state, reports: 0 }
    }

    pub fn current(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Receiver that always observes the latest state
    pub fn watch(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    /// Record a state report from the stack
    pub fn apply(&mut self, state: AdapterState) -> AdapterTransition {
        let previous = self.state.send_replace(state);
        self.reports += 1;
        AdapterTransition {
            previous,
            current: state,
        }
    }

    /// Succeeds only when the radio can be used
    pub fn ensure_powered(&self) -> Result<(), AdapterState> {
        let state = self.current();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(state)
        }
    }

    /// Number of reports received, repeats included
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_state_still_reported() {
        let mut monitor = AdapterMonitor::new(AdapterState::Unknown);
        let first = monitor.apply(AdapterState::PoweredOn);
        let second = monitor.apply(AdapterState::PoweredOn);

        assert!(!first.is_repeat());
        assert!(second.is_repeat());
        assert!(!second.lost_power());
        assert_eq!(monitor.reports(), 2);
    }

    #[test]
    fn test_power_loss_detection() {
        let mut monitor = AdapterMonitor::new(AdapterState::PoweredOn);
        assert!(monitor.ensure_powered().is_ok());

        let transition = monitor.apply(AdapterState::Resetting);
        assert!(transition.lost_power());
        assert_eq!(monitor.ensure_powered(), Err(AdapterState::Resetting));
    }

    #[test]
    fn test_watch_sees_latest_state() {
        let mut monitor = AdapterMonitor::new(AdapterState::PoweredOff);
        let receiver = monitor.watch();
        monitor.apply(AdapterState::PoweredOn);
        assert_eq!(*receiver.borrow(), AdapterState::PoweredOn);
    }
}
