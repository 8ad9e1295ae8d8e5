//! Deterministic in-memory stack
//!
//! Records every outbound call, answers with scripted outcomes and lets tests
//! inject the callbacks a real radio would produce.

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::advertising::AdvertisingRequest;
use crate::central::{CentralId, SubscriptionKind};
use crate::dispatch::{AttResponse, RequestId};
use crate::error::NativeError;
use crate::gatt::ServiceDefinition;

use super::{NativeEvent, NativeEventSender, NativeStack, SendOutcome};

// ----------------------------------------------------------------------------
// Recorded Calls
// ----------------------------------------------------------------------------

/// An outbound call the manager made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    PublishService(Uuid),
    UnpublishService(Uuid),
    StartAdvertising(AdvertisingRequest),
    StopAdvertising,
    SendValue {
        central: CentralId,
        characteristic: Uuid,
        value: Vec<u8>,
        outcome: SendOutcome,
    },
    Respond {
        request: RequestId,
        response: AttResponse,
    },
}

/// A value the stack accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentValue {
    pub central: CentralId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    power: AdapterState,
    events: Option<NativeEventSender>,
    calls: Vec<StackCall>,
    sent: Vec<SentValue>,
    send_outcomes: VecDeque<SendOutcome>,
    publish_rejections: VecDeque<NativeError>,
    advertising_rejections: VecDeque<NativeError>,
    published: BTreeSet<Uuid>,
    advertising: Option<AdvertisingRequest>,
    next_request: u64,
}

// ----------------------------------------------------------------------------
// Simulated Stack
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimulatedStack {
    state: Mutex<SimState>,
    paused: watch::Sender<bool>,
    recorded: Notify,
}

impl Default for SimulatedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStack {
    /// A powered-on stack that accepts everything
    pub fn new() -> Self {
        Self::with_power(AdapterState::PoweredOn)
    }

    pub fn with_power(power: AdapterState) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(SimState {
                power,
                events: None,
                calls: Vec::new(),
                sent: Vec::new(),
                send_outcomes: VecDeque::new(),
                publish_rejections: VecDeque::new(),
                advertising_rejections: VecDeque::new(),
                published: BTreeSet::new(),
                advertising: None,
                next_request: 0,
            }),
            paused,
            recorded: Notify::new(),
        }
    }

    fn record(&self, call: StackCall) {
        trace!("Simulated stack call: {:?}", call);
        self.state.lock().calls.push(call);
        self.recorded.notify_waiters();
    }

    fn emit(&self, event: NativeEvent) {
        if let Some(events) = self.events() {
            events.send(event);
        }
    }

    fn events(&self) -> Option<NativeEventSender> {
        let events = self.state.lock().events.clone();
        if events.is_none() {
            debug!("Simulated stack not attached; dropping callback");
        }
        events
    }

    async fn confirmation_gate(&self) {
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Outcome for the next `send_value`; unscripted sends are delivered
    pub fn push_send_outcome(&self, outcome: SendOutcome) {
        self.state.lock().send_outcomes.push_back(outcome);
    }

    /// Reject the next publish with the given error
    pub fn reject_next_publish(&self, error: NativeError) {
        self.state.lock().publish_rejections.push_back(error);
    }

    pub fn reject_next_advertising(&self, error: NativeError) {
        self.state.lock().advertising_rejections.push_back(error);
    }

    /// Hold publish and advertising confirmations until resumed
    pub fn pause_confirmations(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_confirmations(&self) {
        self.paused.send_replace(false);
    }

    // ------------------------------------------------------------------------
    // Callback Injection
    // ------------------------------------------------------------------------

    /// Change the radio state; losing power drops services and advertising
    pub fn set_power(&self, power: AdapterState) {
        {
            let mut state = self.state.lock();
            state.power = power;
            if !power.is_powered_on() {
                state.published.clear();
                state.advertising = None;
            }
        }
        if let Some(events) = self.events() {
            events.state_changed(power);
        }
    }

    /// Report a link that is still being set up
    pub fn connecting(&self, central: impl Into<CentralId>) {
        if let Some(events) = self.events() {
            events.central_connecting(central.into());
        }
    }

    pub fn connect(&self, central: impl Into<CentralId>, max_update_len: usize) {
        if let Some(events) = self.events() {
            events.central_connected(central.into(), Some(max_update_len));
        }
    }

    /// Enable notifications, reporting the connection's max update length
    pub fn subscribe(&self, central: impl Into<CentralId>, characteristic: Uuid, max_update_len: usize) {
        self.subscribe_with(
            central,
            characteristic,
            SubscriptionKind::Notify,
            true,
            Some(max_update_len),
        );
    }

    pub fn subscribe_with(
        &self,
        central: impl Into<CentralId>,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
        max_update_len: Option<usize>,
    ) {
        self.emit(NativeEvent::CentralSubscribed {
            central: central.into(),
            characteristic,
            kind,
            enabled,
            max_update_len,
        });
    }

    pub fn unsubscribe(&self, central: impl Into<CentralId>, characteristic: Uuid) {
        self.subscribe_with(central, characteristic, SubscriptionKind::Notify, false, None);
    }

    pub fn disconnect(&self, central: impl Into<CentralId>) {
        if let Some(events) = self.events() {
            events.central_disconnected(central.into());
        }
    }

    fn next_request(&self) -> RequestId {
        let mut state = self.state.lock();
        state.next_request += 1;
        RequestId(state.next_request)
    }

    /// Deliver a write from a central
    pub fn write(
        &self,
        central: impl Into<CentralId>,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
        respond_expected: bool,
    ) -> RequestId {
        let request = self.next_request();
        self.emit(NativeEvent::WriteRequest {
            request,
            central: central.into(),
            characteristic,
            value: value.into(),
            respond_expected,
        });
        request
    }

    pub fn read(&self, central: impl Into<CentralId>, characteristic: Uuid, offset: usize) -> RequestId {
        let request = self.next_request();
        self.emit(NativeEvent::ReadRequest {
            request,
            central: central.into(),
            characteristic,
            offset,
        });
        request
    }

    pub fn ready_to_send_more(&self) {
        if let Some(events) = self.events() {
            events.ready_to_send_more();
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<StackCall> {
        self.state.lock().calls.clone()
    }

    /// Values the stack accepted, in order
    pub fn sent_values(&self) -> Vec<SentValue> {
        self.state.lock().sent.clone()
    }

    pub fn responses(&self) -> Vec<(RequestId, AttResponse)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StackCall::Respond { request, response } => Some((request, response)),
                _ => None,
            })
            .collect()
    }

    pub fn response_for(&self, request: RequestId) -> Option<AttResponse> {
        self.responses()
            .into_iter()
            .find(|(id, _)| *id == request)
            .map(|(_, response)| response)
    }

    pub fn published_services(&self) -> Vec<Uuid> {
        self.state.lock().published.iter().copied().collect()
    }

    pub fn advertising(&self) -> Option<AdvertisingRequest> {
        self.state.lock().advertising.clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising.is_some()
    }

    /// Wait until a recorded call matches
    pub async fn until_call(&self, matches: impl Fn(&StackCall) -> bool) -> StackCall {
        loop {
            let recorded = self.recorded.notified();
            let found = self.state.lock().calls.iter().find(|call| matches(call)).cloned();
            if let Some(call) = found {
                return call;
            }
            recorded.await;
        }
    }

    /// Wait until at least `count` recorded calls match
    pub async fn until_calls(&self, count: usize, matches: impl Fn(&StackCall) -> bool) -> Vec<StackCall> {
        loop {
            let recorded = self.recorded.notified();
            let found: Vec<StackCall> = self
                .state
                .lock()
                .calls
                .iter()
                .filter(|call| matches(call))
                .cloned()
                .collect();
            if found.len() >= count {
                return found;
            }
            recorded.await;
        }
    }

    /// Wait until the manager answered a request
    pub async fn until_response(&self, request: RequestId) -> AttResponse {
        match self
            .until_call(|call| matches!(call, StackCall::Respond { request: id, .. } if *id == request))
            .await
        {
            StackCall::Respond { response, .. } => response,
            _ => AttResponse::Error(crate::dispatch::AttError::UnlikelyError),
        }
    }
}

#[async_trait]
impl NativeStack for SimulatedStack {
    fn attach(&self, events: NativeEventSender) {
        self.state.lock().events = Some(events);
    }

    fn power_state(&self) -> AdapterState {
        self.state.lock().power
    }

    async fn publish_service(&self, service: &ServiceDefinition) -> Result<(), NativeError> {
        self.record(StackCall::PublishService(service.uuid));
        self.confirmation_gate().await;

        let mut state = self.state.lock();
        if let Some(error) = state.publish_rejections.pop_front() {
            return Err(error);
        }
        if !state.power.is_powered_on() {
            return Err(NativeError::new("adapter is not powered on"));
        }
        state.published.insert(service.uuid);
        Ok(())
    }

    async fn unpublish_service(&self, service: Uuid) -> Result<(), NativeError> {
        self.record(StackCall::UnpublishService(service));
        self.state.lock().published.remove(&service);
        Ok(())
    }

    async fn start_advertising(&self, request: &AdvertisingRequest) -> Result<(), NativeError> {
        self.record(StackCall::StartAdvertising(request.clone()));
        self.confirmation_gate().await;

        let mut state = self.state.lock();
        if let Some(error) = state.advertising_rejections.pop_front() {
            return Err(error);
        }
        if !state.power.is_powered_on() {
            return Err(NativeError::new("adapter is not powered on"));
        }
        if state.advertising.is_some() {
            return Err(NativeError::with_code(9, "advertising already in progress"));
        }
        state.advertising = Some(request.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), NativeError> {
        self.record(StackCall::StopAdvertising);
        self.state.lock().advertising = None;
        Ok(())
    }

    fn send_value(&self, central: &CentralId, characteristic: Uuid, value: &[u8]) -> SendOutcome {
        let outcome = {
            let mut state = self.state.lock();
            let outcome = state
                .send_outcomes
                .pop_front()
                .unwrap_or(SendOutcome::Delivered);
            if outcome == SendOutcome::Delivered {
                state.sent.push(SentValue {
                    central: central.clone(),
                    characteristic,
                    value: value.to_vec(),
                });
            }
            outcome
        };
        self.record(StackCall::SendValue {
            central: central.clone(),
            characteristic,
            value: value.to_vec(),
            outcome: outcome.clone(),
        });
        outcome
    }

    fn respond(&self, request: RequestId, response: AttResponse) {
        self.record(StackCall::Respond { request, response });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_send_outcomes() {
        let stack = SimulatedStack::new();
        let central: CentralId = "a".into();
        stack.push_send_outcome(SendOutcome::WouldBlock);

        assert_eq!(stack.send_value(&central, Uuid::nil(), b"1"), SendOutcome::WouldBlock);
        assert_eq!(stack.send_value(&central, Uuid::nil(), b"2"), SendOutcome::Delivered);
        assert_eq!(stack.sent_values().len(), 1);
        assert_eq!(stack.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejection_and_power_loss() {
        let stack = SimulatedStack::new();
        let service = ServiceDefinition::new(Uuid::from_u128(1));
        stack.reject_next_publish(NativeError::with_code(3, "out of resources"));

        assert!(stack.publish_service(&service).await.is_err());
        stack.publish_service(&service).await.unwrap();
        assert_eq!(stack.published_services(), vec![service.uuid]);

        stack.set_power(AdapterState::PoweredOff);
        assert!(stack.published_services().is_empty());
        assert!(stack.publish_service(&service).await.is_err());
    }

    #[tokio::test]
    async fn test_overlapping_advertising_rejected() {
        let stack = SimulatedStack::new();
        let request = AdvertisingRequest {
            service: Uuid::from_u128(1),
            local_name: "demo".into(),
        };
        stack.start_advertising(&request).await.unwrap();
        assert!(stack.start_advertising(&request).await.is_err());

        stack.stop_advertising().await.unwrap();
        stack.start_advertising(&request).await.unwrap();
        assert!(stack.is_advertising());
    }
}
