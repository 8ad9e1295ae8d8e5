//! Advertising session lifecycle
//!
//! At most one session is not `Stopped` at any time. The controller only
//! tracks state; the manager performs the native calls it plans.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AdvertiseError;

// ----------------------------------------------------------------------------
// Session Types
// ----------------------------------------------------------------------------

/// Monotonic advertising session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adv-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Active,
    Stopped,
}

/// Snapshot of an advertising session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub service: Uuid,
    pub local_name: String,
    pub state: SessionState,
    /// Set once the stack confirms the session
    pub started_at: Option<SystemTime>,
}

/// Payload handed to the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingRequest {
    pub service: Uuid,
    pub local_name: String,
}

/// Native work needed to start a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    /// The new session, in `Starting`
    pub session: SessionInfo,
    /// Previously active session; stop it before starting the new one
    pub stop_first: Option<SessionInfo>,
}

impl StartPlan {
    pub fn request(&self) -> AdvertisingRequest {
        AdvertisingRequest {
            service: self.session.service,
            local_name: self.session.local_name.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AdvertisingController {
    current: Option<SessionInfo>,
    next_id: u64,
}

impl AdvertisingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session in `Starting`, retiring an active one first
    pub fn begin_start(
        &mut self,
        service: Uuid,
        local_name: String,
    ) -> Result<StartPlan, AdvertiseError> {
        let stop_first = match self.current.take() {
            Some(session) if session.state == SessionState::Starting => {
                let id = session.id;
                self.current = Some(session);
                return Err(AdvertiseError::Busy { session: id });
            }
            Some(mut session) if session.state == SessionState::Active => {
                session.state = SessionState::Stopped;
                debug!("Stopping advertising session {} before restart", session.id);
                Some(session)
            }
            _ => None,
        };

        self.next_id += 1;
        let session = SessionInfo {
            id: SessionId(self.next_id),
            service,
            local_name,
            state: SessionState::Starting,
            started_at: None,
        };
        self.current = Some(session.clone());
        Ok(StartPlan {
            session,
            stop_first,
        })
    }

    /// Apply the stack's answer to a start.
    ///
    /// Returns the updated session, or `None` if `id` is no longer the
    /// starting session.
    pub fn finish_start(&mut self, id: SessionId, succeeded: bool) -> Option<SessionInfo> {
        let session = self.current.as_mut()?;
        if session.id != id || session.state != SessionState::Starting {
            return None;
        }

        if succeeded {
            session.state = SessionState::Active;
            session.started_at = Some(SystemTime::now());
            info!(
                "Advertising session {} active for service {}",
                session.id, session.service
            );
            Some(session.clone())
        } else {
            let mut session = self.current.take()?;
            session.state = SessionState::Stopped;
            Some(session)
        }
    }

    /// Stop whatever session is open; `None` when there is nothing to stop
    pub fn stop(&mut self) -> Option<SessionInfo> {
        let mut session = self.current.take()?;
        session.state = SessionState::Stopped;
        info!("Advertising session {} stopped", session.id);
        Some(session)
    }

    /// The radio went away; same transition as an explicit stop
    pub fn power_lost(&mut self) -> Option<SessionInfo> {
        self.stop()
    }

    pub fn current(&self) -> Option<&SessionInfo> {
        self.current.as_ref()
    }

    /// Service advertised by the open session, if any
    pub fn advertised_service(&self) -> Option<Uuid> {
        self.current.as_ref().map(|session| session.service)
    }

    pub fn is_advertising(&self) -> bool {
        self.current
            .as_ref()
            .map(|session| session.state == SessionState::Active)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Uuid {
        Uuid::from_u128(0x51)
    }

    #[test]
    fn test_session_lifecycle() {
        let mut controller = AdvertisingController::new();
        let plan = controller.begin_start(service(), "demo".into()).unwrap();
        assert_eq!(plan.session.state, SessionState::Starting);
        assert!(plan.stop_first.is_none());
        assert!(!controller.is_advertising());

        let active = controller.finish_start(plan.session.id, true).unwrap();
        assert_eq!(active.state, SessionState::Active);
        assert!(active.started_at.is_some());
        assert!(controller.is_advertising());

        let stopped = controller.stop().unwrap();
        assert_eq!(stopped.state, SessionState::Stopped);
        assert!(controller.current().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut controller = AdvertisingController::new();
        assert!(controller.stop().is_none());
        assert!(controller.stop().is_none());
    }

    #[test]
    fn test_restart_stops_active_session_first() {
        let mut controller = AdvertisingController::new();
        let first = controller.begin_start(service(), "one".into()).unwrap();
        controller.finish_start(first.session.id, true);

        let second = controller.begin_start(service(), "two".into()).unwrap();
        let retired = second.stop_first.unwrap();
        assert_eq!(retired.id, first.session.id);
        assert_eq!(retired.state, SessionState::Stopped);
        assert!(second.session.id > first.session.id);
    }

    #[test]
    fn test_busy_while_starting() {
        let mut controller = AdvertisingController::new();
        let first = controller.begin_start(service(), "one".into()).unwrap();
        assert_eq!(
            controller.begin_start(service(), "two".into()),
            Err(AdvertiseError::Busy {
                session: first.session.id
            })
        );
        assert_eq!(controller.current().unwrap().id, first.session.id);
    }

    #[test]
    fn test_rejection_and_stale_completion() {
        let mut controller = AdvertisingController::new();
        let first = controller.begin_start(service(), "one".into()).unwrap();
        let rejected = controller.finish_start(first.session.id, false).unwrap();
        assert_eq!(rejected.state, SessionState::Stopped);
        assert!(controller.current().is_none());

        assert!(controller.finish_start(first.session.id, true).is_none());
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(7).to_string(), "adv-7");
    }
}
