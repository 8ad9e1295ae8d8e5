//! Peripheral manager
//!
//! [`PeripheralBuilder`] spawns one dispatch task that owns every registry.
//! Caller commands, native callbacks and completions of native calls all
//! arrive on a single ordered queue, so state changes happen in arrival
//! order. Calls that need the stack to confirm are spawned and their results
//! come back to the queue as completions; each caller future is resolved
//! exactly once through its own `oneshot`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterMonitor, AdapterState};
use crate::advertising::{AdvertisingController, SessionId, SessionInfo, SessionState};
use crate::central::{Central, CentralId, SubscriptionKind};
use crate::config::PeripheralConfig;
use crate::connection::ConnectionRegistry;
use crate::dispatch::WriteDispatcher;
use crate::error::{
    AdvertiseError, DefinitionError, DeliveryFailure, NativeError, NotifyError, PeripheralError,
    PeripheralResult, PublishError,
};
use crate::events::{EventBus, EventFilter, EventSubscription, ListenerId, PeripheralEvent};
use crate::fanout::{DeliveryOutcome, DeliveryReport, NotificationEngine, NotifyTarget};
use crate::gatt::{Characteristic, ServiceDefinition};
use crate::native::{NativeEvent, NativeEventSender, NativeStack};
use crate::protocol::MAX_ATTRIBUTE_LEN;
use crate::registry::{PublishPlan, ServiceHandle, ServiceRegistry, ServiceSummary};

type Reply<T> = oneshot::Sender<T>;

// ----------------------------------------------------------------------------
// Queue Items
// ----------------------------------------------------------------------------

/// Everything the dispatch task consumes, in arrival order
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Native(NativeEvent),
    Completion(Completion),
}

#[derive(Debug)]
pub(crate) enum Command {
    Define {
        definition: ServiceDefinition,
        reply: Reply<Result<ServiceHandle, DefinitionError>>,
    },
    AddCharacteristic {
        service: Uuid,
        characteristic: Characteristic,
        reply: Reply<Result<(), DefinitionError>>,
    },
    Publish {
        service: Uuid,
        reply: Reply<Result<ServiceHandle, PublishError>>,
    },
    Unpublish {
        service: Uuid,
        reply: Reply<Result<(), PublishError>>,
    },
    SetValue {
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply<Result<(), DefinitionError>>,
    },
    StartAdvertising {
        service: Uuid,
        local_name: String,
        reply: Reply<Result<SessionInfo, AdvertiseError>>,
    },
    StopAdvertising {
        reply: Reply<Result<(), AdvertiseError>>,
    },
    Notify {
        characteristic: Uuid,
        payload: Vec<u8>,
        target: NotifyTarget,
        reply: Reply<Result<DeliveryReport, NotifyError>>,
    },
    Connected {
        reply: Reply<Vec<Central>>,
    },
    Subscribers {
        characteristic: Uuid,
        reply: Reply<Vec<Central>>,
    },
    Info {
        reply: Reply<PeripheralInfo>,
    },
    Subscribe {
        id: ListenerId,
        filter: EventFilter,
        sender: mpsc::UnboundedSender<PeripheralEvent>,
    },
    Unsubscribe(ListenerId),
    Shutdown {
        reply: Reply<()>,
    },
}

/// Result of a spawned native call
#[derive(Debug)]
pub(crate) enum Completion {
    Published {
        service: Uuid,
        attempt: u64,
        result: Result<(), NativeError>,
    },
    PublishTimedOut {
        service: Uuid,
        attempt: u64,
    },
    Unpublished {
        service: Uuid,
        result: Result<(), NativeError>,
        reply: Reply<Result<(), PublishError>>,
    },
    AdvertisingStarted {
        session: SessionId,
        result: Result<(), NativeError>,
    },
    AdvertisingTimedOut {
        session: SessionId,
    },
    AdvertisingStopped {
        result: Result<(), NativeError>,
        reply: Option<Reply<Result<(), AdvertiseError>>>,
    },
}

// ----------------------------------------------------------------------------
// Introspection
// ----------------------------------------------------------------------------

/// Snapshot of the whole peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub adapter_state: AdapterState,
    pub advertising: Option<SessionInfo>,
    pub services: Vec<ServiceSummary>,
    pub centrals: Vec<Central>,
    pub pending_notifications: usize,
    /// Writes accepted and handed to a listener or dropped
    pub accepted_writes: u64,
    /// Reads and writes refused by validation
    pub rejected_requests: u64,
    /// Accepted writes no listener was registered for
    pub dropped_writes: u64,
}

impl PeripheralInfo {
    pub fn is_advertising(&self) -> bool {
        self.advertising
            .as_ref()
            .map(|session| session.state == SessionState::Active)
            .unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Configures and starts a peripheral manager on top of a native stack
pub struct PeripheralBuilder {
    stack: Arc<dyn NativeStack>,
    config: PeripheralConfig,
}

impl PeripheralBuilder {
    pub fn new(stack: Arc<dyn NativeStack>) -> Self {
        Self {
            stack,
            config: PeripheralConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PeripheralConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the dispatch task; must be called inside a Tokio runtime
    pub fn start(self) -> PeripheralHandle {
        let (inputs, receiver) = mpsc::unbounded_channel();
        self.stack.attach(NativeEventSender::new(&inputs));

        let monitor = AdapterMonitor::new(self.stack.power_state());
        let state = monitor.watch();
        info!("Starting peripheral manager (adapter {})", monitor.current());

        let task = PeripheralTask {
            stack: self.stack,
            inputs: inputs.downgrade(),
            monitor,
            services: ServiceRegistry::new(),
            connections: ConnectionRegistry::new(self.config.fallback_max_update_len()),
            advertising: AdvertisingController::new(),
            dispatcher: WriteDispatcher::new(),
            fanout: NotificationEngine::new(self.config.max_queue_depth),
            bus: EventBus::new(),
            publish_waiters: HashMap::new(),
            pending_start: None,
            config: self.config,
        };
        let join = tokio::spawn(task.run(receiver));

        PeripheralHandle {
            inputs,
            state,
            next_listener: Arc::new(AtomicU64::new(0)),
            task: Arc::new(Mutex::new(Some(join))),
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable caller handle to a running peripheral manager
#[derive(Clone)]
pub struct PeripheralHandle {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<AdapterState>,
    next_listener: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PeripheralHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.inputs.send(Input::Command(command(reply))).ok()?;
        response.await.ok()
    }

    /// Last adapter state reported by the stack, without a round trip
    pub fn adapter_state(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Watch adapter state changes
    pub fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.state.clone()
    }

    pub async fn define(&self, definition: ServiceDefinition) -> Result<ServiceHandle, DefinitionError> {
        self.request(|reply| Command::Define { definition, reply })
            .await
            .unwrap_or(Err(DefinitionError::Shutdown))
    }

    /// Add a characteristic to a defined, unpublished service
    pub async fn add_characteristic(
        &self,
        service: Uuid,
        characteristic: Characteristic,
    ) -> Result<(), DefinitionError> {
        self.request(|reply| Command::AddCharacteristic {
            service,
            characteristic,
            reply,
        })
        .await
        .unwrap_or(Err(DefinitionError::Shutdown))
    }

    /// Publish a service; publishing it again returns the same handle
    pub async fn publish(&self, service: Uuid) -> Result<ServiceHandle, PublishError> {
        self.request(|reply| Command::Publish { service, reply })
            .await
            .unwrap_or(Err(PublishError::Shutdown))
    }

    pub async fn unpublish(&self, service: Uuid) -> Result<(), PublishError> {
        self.request(|reply| Command::Unpublish { service, reply })
            .await
            .unwrap_or(Err(PublishError::Shutdown))
    }

    /// Replace a characteristic's cached value
    pub async fn set_value(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), DefinitionError> {
        self.request(|reply| Command::SetValue {
            characteristic,
            value,
            reply,
        })
        .await
        .unwrap_or(Err(DefinitionError::Shutdown))
    }

    pub async fn start_advertising(
        &self,
        service: Uuid,
        local_name: impl Into<String>,
    ) -> Result<SessionInfo, AdvertiseError> {
        let local_name = local_name.into();
        self.request(|reply| Command::StartAdvertising {
            service,
            local_name,
            reply,
        })
        .await
        .unwrap_or(Err(AdvertiseError::Shutdown))
    }

    /// Stop advertising; succeeds when nothing is being advertised
    pub async fn stop_advertising(&self) -> Result<(), AdvertiseError> {
        self.request(|reply| Command::StopAdvertising { reply })
            .await
            .unwrap_or(Err(AdvertiseError::Shutdown))
    }

    pub async fn notify(
        &self,
        characteristic: Uuid,
        payload: Vec<u8>,
        target: NotifyTarget,
    ) -> Result<DeliveryReport, NotifyError> {
        self.request(|reply| Command::Notify {
            characteristic,
            payload,
            target,
            reply,
        })
        .await
        .unwrap_or(Err(NotifyError::Shutdown))
    }

    pub async fn connected(&self) -> PeripheralResult<Vec<Central>> {
        self.request(|reply| Command::Connected { reply })
            .await
            .ok_or(PeripheralError::Shutdown)
    }

    pub async fn subscribers(&self, characteristic: Uuid) -> PeripheralResult<Vec<Central>> {
        self.request(|reply| Command::Subscribers {
            characteristic,
            reply,
        })
        .await
        .ok_or(PeripheralError::Shutdown)
    }

    pub async fn info(&self) -> PeripheralResult<PeripheralInfo> {
        self.request(|reply| Command::Info { reply })
            .await
            .ok_or(PeripheralError::Shutdown)
    }

    /// Register a listener; it sees events queued after this call
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, events) = mpsc::unbounded_channel();
        let _ = self
            .inputs
            .send(Input::Command(Command::Subscribe { id, filter, sender }));
        EventSubscription::new(id, events, &self.inputs)
    }

    /// Stop advertising, fail queued notifications and end the dispatch task
    pub async fn shutdown(&self) -> PeripheralResult<()> {
        if self.request(|reply| Command::Shutdown { reply }).await.is_none() {
            debug!("Peripheral manager already stopped");
        }
        let join = self.task.lock().take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                warn!("Peripheral task ended abnormally: {}", err);
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Dispatch Task
// ----------------------------------------------------------------------------

struct PeripheralTask {
    stack: Arc<dyn NativeStack>,
    /// Completion path; weak so the queue closes with the last handle
    inputs: mpsc::WeakUnboundedSender<Input>,
    config: PeripheralConfig,
    monitor: AdapterMonitor,
    services: ServiceRegistry,
    connections: ConnectionRegistry,
    advertising: AdvertisingController,
    dispatcher: WriteDispatcher,
    fanout: NotificationEngine,
    bus: EventBus,
    publish_waiters: HashMap<Uuid, Vec<Reply<Result<ServiceHandle, PublishError>>>>,
    pending_start: Option<(SessionId, Reply<Result<SessionInfo, AdvertiseError>>)>,
}

impl PeripheralTask {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Input>) {
        loop {
            let Some(input) = receiver.recv().await else {
                debug!("Every peripheral handle dropped");
                self.shutdown().await;
                break;
            };
            match input {
                Input::Command(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Input::Command(command) => self.handle_command(command),
                Input::Native(event) => self.handle_native(event),
                Input::Completion(completion) => self.handle_completion(completion),
            }
        }
        info!("Peripheral manager stopped");
    }

    fn complete(&self, work: impl std::future::Future<Output = Completion> + Send + 'static) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let completion = work.await;
            match inputs.upgrade() {
                Some(inputs) => {
                    let _ = inputs.send(Input::Completion(completion));
                }
                None => debug!("Peripheral manager gone; dropping {:?}", completion),
            }
        });
    }

    fn publish_outcomes(&mut self, outcomes: Vec<DeliveryOutcome>) -> usize {
        let count = outcomes.len();
        self.bus
            .publish_all(outcomes.into_iter().map(PeripheralEvent::from));
        count
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Define { definition, reply } => {
                let _ = reply.send(self.services.define(definition));
            }
            Command::AddCharacteristic {
                service,
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.services.add_characteristic(service, characteristic));
            }
            Command::Publish { service, reply } => self.publish(service, reply),
            Command::Unpublish { service, reply } => self.unpublish(service, reply),
            Command::SetValue {
                characteristic,
                value,
                reply,
            } => {
                let _ = reply.send(self.services.set_value(characteristic, value));
            }
            Command::StartAdvertising {
                service,
                local_name,
                reply,
            } => self.start_advertising(service, local_name, reply),
            Command::StopAdvertising { reply } => self.stop_advertising(reply),
            Command::Notify {
                characteristic,
                payload,
                target,
                reply,
            } => {
                let _ = reply.send(self.notify(characteristic, payload, target));
            }
            Command::Connected { reply } => {
                let _ = reply.send(self.connections.connected_centrals());
            }
            Command::Subscribers {
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.connections.subscribers(&characteristic));
            }
            Command::Info { reply } => {
                let _ = reply.send(self.info());
            }
            Command::Subscribe { id, filter, sender } => self.bus.register(id, filter, sender),
            Command::Unsubscribe(id) => self.bus.unregister(id),
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn publish(&mut self, service: Uuid, reply: Reply<Result<ServiceHandle, PublishError>>) {
        if let Err(state) = self.monitor.ensure_powered() {
            let _ = reply.send(Err(PublishError::AdapterNotReady { state }));
            return;
        }

        match self.services.begin_publish(service) {
            Err(err) => {
                let _ = reply.send(Err(err));
            }
            Ok(PublishPlan::Published(handle)) => {
                let _ = reply.send(Ok(handle));
            }
            Ok(PublishPlan::InFlight) => {
                self.publish_waiters.entry(service).or_default().push(reply);
            }
            Ok(PublishPlan::Submit {
                attempt,
                definition,
            }) => {
                debug!("Submitting service {} (attempt {})", service, attempt);
                self.publish_waiters.entry(service).or_default().push(reply);
                let stack = self.stack.clone();
                let timeout = self.config.publish_timeout;
                self.complete(async move {
                    match tokio::time::timeout(timeout, stack.publish_service(&definition)).await {
                        Ok(result) => Completion::Published {
                            service,
                            attempt,
                            result,
                        },
                        Err(_) => Completion::PublishTimedOut { service, attempt },
                    }
                });
            }
        }
    }

    fn resolve_publish(&mut self, service: Uuid, result: Result<ServiceHandle, PublishError>) {
        for waiter in self.publish_waiters.remove(&service).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    fn unpublish(&mut self, service: Uuid, reply: Reply<Result<(), PublishError>>) {
        if self.advertising.advertised_service() == Some(service) {
            let _ = reply.send(Err(PublishError::Advertised { service }));
            return;
        }

        let characteristics = match self.services.unpublish(service) {
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
            Ok(None) => {
                let _ = reply.send(Ok(()));
                return;
            }
            Ok(Some(characteristics)) => characteristics,
        };

        self.connections.drop_characteristics(&characteristics);
        let outcomes = self
            .fanout
            .purge_characteristics(&characteristics, DeliveryFailure::Unpublished);
        self.publish_outcomes(outcomes);

        let stack = self.stack.clone();
        self.complete(async move {
            let result = stack.unpublish_service(service).await;
            Completion::Unpublished {
                service,
                result,
                reply,
            }
        });
    }

    fn start_advertising(
        &mut self,
        service: Uuid,
        local_name: String,
        reply: Reply<Result<SessionInfo, AdvertiseError>>,
    ) {
        if let Err(state) = self.monitor.ensure_powered() {
            let _ = reply.send(Err(AdvertiseError::AdapterNotReady { state }));
            return;
        }
        if !self.services.is_published(&service) {
            let _ = reply.send(Err(AdvertiseError::ServiceNotPublished { service }));
            return;
        }

        let plan = match self.advertising.begin_start(service, local_name) {
            Ok(plan) => plan,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let restart = plan.stop_first.is_some();
        if let Some(retired) = plan.stop_first.clone() {
            self.bus
                .publish(PeripheralEvent::AdvertisingStateChanged(retired));
        }
        self.bus
            .publish(PeripheralEvent::AdvertisingStateChanged(plan.session.clone()));

        let session = plan.session.id;
        let request = plan.request();
        self.pending_start = Some((session, reply));

        let stack = self.stack.clone();
        let timeout = self.config.advertising_timeout;
        self.complete(async move {
            if restart {
                if let Err(err) = stack.stop_advertising().await {
                    warn!("Failed to stop previous advertising session: {}", err);
                }
            }
            match tokio::time::timeout(timeout, stack.start_advertising(&request)).await {
                Ok(result) => Completion::AdvertisingStarted { session, result },
                Err(_) => Completion::AdvertisingTimedOut { session },
            }
        });
    }

    fn take_pending_start(
        &mut self,
        session: SessionId,
    ) -> Option<Reply<Result<SessionInfo, AdvertiseError>>> {
        match self.pending_start.take() {
            Some((id, reply)) if id == session => Some(reply),
            other => {
                self.pending_start = other;
                None
            }
        }
    }

    fn stop_advertising(&mut self, reply: Reply<Result<(), AdvertiseError>>) {
        let Some(session) = self.advertising.stop() else {
            let _ = reply.send(Ok(()));
            return;
        };

        if let Some(pending) = self.take_pending_start(session.id) {
            let _ = pending.send(Err(AdvertiseError::Cancelled {
                session: session.id,
            }));
        }
        self.bus
            .publish(PeripheralEvent::AdvertisingStateChanged(session));

        if self.config.purge_on_advertising_stop {
            let outcomes = self.fanout.purge_all(DeliveryFailure::Cancelled);
            self.publish_outcomes(outcomes);
        }

        let stack = self.stack.clone();
        self.complete(async move {
            Completion::AdvertisingStopped {
                result: stack.stop_advertising().await,
                reply: Some(reply),
            }
        });
    }

    fn notify(
        &mut self,
        characteristic: Uuid,
        payload: Vec<u8>,
        target: NotifyTarget,
    ) -> Result<DeliveryReport, NotifyError> {
        if let Err(state) = self.monitor.ensure_powered() {
            return Err(NotifyError::AdapterNotReady { state });
        }
        if payload.len() > MAX_ATTRIBUTE_LEN {
            return Err(NotifyError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_ATTRIBUTE_LEN,
            });
        }

        let target_ref = self
            .services
            .lookup(&characteristic)
            .ok_or(NotifyError::UnknownCharacteristic { characteristic })?;
        if !target_ref.published {
            return Err(NotifyError::NotPublished { characteristic });
        }
        if !target_ref.characteristic.properties.can_push() {
            return Err(NotifyError::NotNotifiable { characteristic });
        }

        if let Err(err) = self.services.set_value(characteristic, payload.clone()) {
            warn!("Failed to cache notified value for {}: {}", characteristic, err);
        }
        Ok(self.fanout.notify(
            &self.connections,
            self.stack.as_ref(),
            characteristic,
            &payload,
            &target,
        ))
    }

    fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            adapter_state: self.monitor.current(),
            advertising: self.advertising.current().cloned(),
            services: self.services.summaries(),
            centrals: self.connections.connected_centrals(),
            pending_notifications: self.fanout.pending(),
            accepted_writes: self.dispatcher.accepted(),
            rejected_requests: self.dispatcher.rejected(),
            dropped_writes: self.bus.dropped_writes(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down peripheral manager");
        if let Some(session) = self.advertising.stop() {
            if let Some(pending) = self.take_pending_start(session.id) {
                let _ = pending.send(Err(AdvertiseError::Shutdown));
            }
            self.bus
                .publish(PeripheralEvent::AdvertisingStateChanged(session));
            if let Err(err) = self.stack.stop_advertising().await {
                warn!("Failed to stop advertising during shutdown: {}", err);
            }
        }

        let outcomes = self.fanout.purge_all(DeliveryFailure::Cancelled);
        self.publish_outcomes(outcomes);

        let services: Vec<Uuid> = self.publish_waiters.keys().copied().collect();
        for service in services {
            self.resolve_publish(service, Err(PublishError::Shutdown));
        }
        self.bus.close();
    }

    // ------------------------------------------------------------------------
    // Native Events
    // ------------------------------------------------------------------------

    fn handle_native(&mut self, event: NativeEvent) {
        match event {
            NativeEvent::StateChanged(state) => self.adapter_changed(state),
            NativeEvent::CentralConnecting { central } => {
                debug!("Central {} connecting", central);
                self.connections.connecting(central);
            }
            NativeEvent::CentralConnected {
                central,
                max_update_len,
            } => {
                if self.connections.connected(central.clone(), max_update_len) {
                    self.central_connected(central);
                }
            }
            NativeEvent::CentralSubscribed {
                central,
                characteristic,
                kind,
                enabled,
                max_update_len,
            } => self.subscription_changed(central, characteristic, kind, enabled, max_update_len),
            NativeEvent::CentralDisconnected { central } => self.central_disconnected(central),
            NativeEvent::WriteRequest {
                request,
                central,
                characteristic,
                value,
                respond_expected,
            } => {
                if let Ok(write) = self.dispatcher.handle_write(
                    &mut self.services,
                    self.stack.as_ref(),
                    request,
                    central,
                    characteristic,
                    value,
                    respond_expected,
                ) {
                    self.bus.publish(PeripheralEvent::WriteRequest(write));
                }
            }
            NativeEvent::ReadRequest {
                request,
                central,
                characteristic,
                offset,
            } => {
                let _ = self.dispatcher.handle_read(
                    &self.services,
                    self.stack.as_ref(),
                    request,
                    &central,
                    characteristic,
                    offset,
                );
            }
            NativeEvent::ReadyToSendMore => {
                let outcomes = self.fanout.drain(&self.connections, self.stack.as_ref());
                self.publish_outcomes(outcomes);
            }
        }
    }

    fn adapter_changed(&mut self, state: AdapterState) {
        let transition = self.monitor.apply(state);
        if transition.is_repeat() {
            debug!("Adapter state repeated: {}", state);
        } else {
            info!("Adapter state {} -> {}", transition.previous, transition.current);
        }
        self.bus.publish(PeripheralEvent::AdapterStateChanged {
            previous: transition.previous,
            current: transition.current,
        });

        if !state.is_powered_on() {
            self.radio_lost(state);
        }
    }

    /// Tear down everything that depended on the radio
    fn radio_lost(&mut self, state: AdapterState) {
        if let Some(session) = self.advertising.power_lost() {
            if let Some(pending) = self.take_pending_start(session.id) {
                let _ = pending.send(Err(AdvertiseError::AdapterNotReady { state }));
            }
            self.bus
                .publish(PeripheralEvent::AdvertisingStateChanged(session));
        }

        let reset = self.services.reset_published();
        for service in reset.interrupted {
            self.resolve_publish(service, Err(PublishError::AdapterNotReady { state }));
        }
        if !reset.reverted.is_empty() {
            warn!(
                "{} published services lost with the adapter",
                reset.reverted.len()
            );
        }

        let outcomes = self.fanout.purge_all(DeliveryFailure::AdapterNotReady);
        self.publish_outcomes(outcomes);

        for central in self.connections.remove_all() {
            self.bus.publish(PeripheralEvent::CentralDisconnected {
                central: central.id,
                purged: 0,
            });
        }
    }

    fn central_connected(&mut self, central: CentralId) {
        let max_update_len = self
            .connections
            .get(&central)
            .map(|c| c.max_update_len)
            .unwrap_or_else(|| self.config.fallback_max_update_len());
        info!("Central {} connected (max update {})", central, max_update_len);
        self.bus.publish(PeripheralEvent::CentralConnected {
            central,
            max_update_len,
        });
    }

    fn subscription_changed(
        &mut self,
        central: CentralId,
        characteristic: Uuid,
        kind: SubscriptionKind,
        enabled: bool,
        max_update_len: Option<usize>,
    ) {
        let pushable = self
            .services
            .lookup(&characteristic)
            .map(|target| {
                target.published && target.characteristic.properties.contains(kind.property())
            })
            .unwrap_or(false);
        if !pushable {
            warn!(
                "Ignoring {:?} subscription from {} to {}: characteristic is unpublished or lacks {:?}",
                kind, central, characteristic, kind.property()
            );
            if self.connections.connected(central.clone(), max_update_len) {
                self.central_connected(central);
            }
            return;
        }

        let update = self.connections.subscribe(
            central.clone(),
            characteristic,
            kind,
            enabled,
            max_update_len,
        );
        if update.new_central {
            self.central_connected(central.clone());
        }

        let still_subscribed = self
            .connections
            .get(&central)
            .map(|c| c.is_subscribed(&characteristic))
            .unwrap_or(false);
        if !still_subscribed {
            let outcomes = self.fanout.purge_subscription(&central, &characteristic);
            self.publish_outcomes(outcomes);
        }

        if update.changed {
            self.bus.publish(PeripheralEvent::SubscriptionChanged {
                central,
                characteristic,
                kind,
                enabled,
            });
        }
    }

    fn central_disconnected(&mut self, central: CentralId) {
        let known = self.connections.remove(&central).is_some();
        let outcomes = self
            .fanout
            .purge_central(&central, DeliveryFailure::Disconnected);
        let purged = self.publish_outcomes(outcomes);

        if known {
            info!("Central {} disconnected ({} notifications failed)", central, purged);
            self.bus
                .publish(PeripheralEvent::CentralDisconnected { central, purged });
        } else {
            debug!("Disconnect for unknown central {}", central);
        }
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Published {
                service,
                attempt,
                result,
            } => {
                let succeeded = result.is_ok();
                let Some(handle) = self.services.finish_publish(service, attempt, succeeded) else {
                    debug!("Ignoring stale publish result for {}", service);
                    return;
                };
                match result {
                    Ok(()) => {
                        info!("Published service {}", handle);
                        self.resolve_publish(service, Ok(handle));
                    }
                    Err(source) => {
                        warn!("Native stack rejected service {}: {}", service, source);
                        self.resolve_publish(service, Err(PublishError::Rejected { service, source }));
                    }
                }
            }
            Completion::PublishTimedOut { service, attempt } => {
                if self.services.finish_publish(service, attempt, false).is_some() {
                    let after_ms = duration_ms(self.config.publish_timeout);
                    warn!("Publishing {} timed out after {}ms", service, after_ms);
                    self.resolve_publish(service, Err(PublishError::Timeout { service, after_ms }));
                }
            }
            Completion::Unpublished {
                service,
                result,
                reply,
            } => {
                let result = result.map_err(|source| {
                    warn!("Native stack failed to remove service {}: {}", service, source);
                    PublishError::Rejected { service, source }
                });
                let _ = reply.send(result);
            }
            Completion::AdvertisingStarted { session, result } => {
                self.advertising_started(session, result)
            }
            Completion::AdvertisingTimedOut { session } => {
                if let Some(stopped) = self.advertising.finish_start(session, false) {
                    let after_ms = duration_ms(self.config.advertising_timeout);
                    warn!("Advertising session {} timed out after {}ms", session, after_ms);
                    if let Some(pending) = self.take_pending_start(session) {
                        let _ = pending.send(Err(AdvertiseError::Timeout { session, after_ms }));
                    }
                    self.bus
                        .publish(PeripheralEvent::AdvertisingStateChanged(stopped));
                }
            }
            Completion::AdvertisingStopped { result, reply } => {
                let result = result.map_err(|err| {
                    warn!("Native stack failed to stop advertising: {}", err);
                    AdvertiseError::StopFailed(err)
                });
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn advertising_started(&mut self, session: SessionId, result: Result<(), NativeError>) {
        let Some(info) = self.advertising.finish_start(session, result.is_ok()) else {
            // The session was stopped while the stack was starting it
            if result.is_ok() && self.advertising.current().is_none() {
                debug!("Stopping stale advertising session {}", session);
                let stack = self.stack.clone();
                self.complete(async move {
                    Completion::AdvertisingStopped {
                        result: stack.stop_advertising().await,
                        reply: None,
                    }
                });
            }
            return;
        };

        let pending = self.take_pending_start(session);
        let response = match result {
            Ok(()) => Ok(info.clone()),
            Err(source) => {
                warn!("Native stack rejected advertising session {}: {}", session, source);
                Err(AdvertiseError::Rejected { session, source })
            }
        };
        if let Some(pending) = pending {
            let _ = pending.send(response);
        }
        self.bus.publish(PeripheralEvent::AdvertisingStateChanged(info));
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
