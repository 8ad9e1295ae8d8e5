//! BlueZ stack using bluer
//!
//! Each published service is registered as its own GATT application. Writes
//! and reads are parked until the manager answers them. Notification sessions
//! feed a bounded channel; a full channel is reported as `WouldBlock` and the
//! next drained value raises `ReadyToSendMore`.
//!
//! BlueZ does not tell a notify session which device opened it, so every
//! session is reported as its own central.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic as GattCharacteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Descriptor as GattDescriptor, DescriptorRead, ReqError,
    Service as GattService,
};
use bluer::gatt::WriteOp;
use bluer::{AdapterEvent, AdapterProperty};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterState;
use crate::advertising::AdvertisingRequest;
use crate::central::{CentralId, SubscriptionKind};
use crate::dispatch::{AttError, AttResponse, RequestId};
use crate::error::NativeError;
use crate::gatt::{Characteristic, Property, ServiceDefinition};
use crate::protocol::{CLIENT_CONFIGURATION_UUID, MIN_MAX_UPDATE_LEN};

use super::{NativeEvent, NativeEventSender, NativeStack, SendOutcome};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Settings for the BlueZ backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluezConfig {
    /// Adapter to use, e.g. `hci0`; the default adapter when unset
    pub adapter_name: Option<String>,
    /// Values buffered per notify session before sends report `WouldBlock`
    pub notify_queue_len: usize,
    /// Max update length reported for notify sessions
    pub notify_max_update_len: usize,
    /// Power the adapter on at connect time
    pub power_on: bool,
}

impl Default for BluezConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            notify_queue_len: 4,
            notify_max_update_len: MIN_MAX_UPDATE_LEN,
            power_on: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct NotifySession {
    characteristic: Uuid,
    values: mpsc::Sender<Vec<u8>>,
    blocked: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Option<NativeEventSender>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<AttResponse>>>,
    sessions: Mutex<HashMap<CentralId, NotifySession>>,
    next_request: AtomicU64,
    next_session: AtomicU64,
}

impl Shared {
    fn emit(&self, event: NativeEvent) {
        match self.events() {
            Some(events) => {
                events.send(event);
            }
            None => debug!("BlueZ stack not attached; dropping {:?}", event),
        }
    }

    fn events(&self) -> Option<NativeEventSender> {
        self.events.lock().clone()
    }

    /// Park a request until the manager answers it
    fn park(&self) -> (RequestId, oneshot::Receiver<AttResponse>) {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request, tx);
        (request, rx)
    }
}

fn req_error(error: AttError) -> ReqError {
    match error {
        AttError::ReadNotPermitted | AttError::WriteNotPermitted => ReqError::NotPermitted,
        AttError::InvalidOffset => ReqError::InvalidOffset,
        AttError::InvalidAttributeValueLength => ReqError::InvalidValueLength,
        AttError::AttributeNotFound | AttError::UnlikelyError => ReqError::Failed,
    }
}

fn native_error(context: &str, err: bluer::Error) -> NativeError {
    NativeError::new(format!("{}: {}", context, err))
}

// ----------------------------------------------------------------------------
// Stack
// ----------------------------------------------------------------------------

pub struct BluezStack {
    adapter: bluer::Adapter,
    config: BluezConfig,
    initial_power: AdapterState,
    shared: Arc<Shared>,
    applications: Mutex<HashMap<Uuid, ApplicationHandle>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    // Keeps the D-Bus connection alive
    _session: bluer::Session,
}

impl BluezStack {
    /// Open a BlueZ session and pick the adapter
    pub async fn connect(config: BluezConfig) -> Result<Self, NativeError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| native_error("BlueZ session", e))?;
        let adapter = match &config.adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| native_error("BLE adapter", e))?;

        let mut powered = adapter.is_powered().await.unwrap_or(false);
        if !powered && config.power_on {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| native_error("Failed to power on adapter", e))?;
            powered = true;
        }

        info!("Using BlueZ adapter {} (powered: {})", adapter.name(), powered);
        Ok(Self {
            adapter,
            config,
            initial_power: if powered {
                AdapterState::PoweredOn
            } else {
                AdapterState::PoweredOff
            },
            shared: Arc::new(Shared::default()),
            applications: Mutex::new(HashMap::new()),
            advertisement: Mutex::new(None),
            _session: session,
        })
    }

    fn characteristic(&self, definition: &Characteristic) -> GattCharacteristic {
        let uuid = definition.uuid;
        let properties = &definition.properties;

        let read = properties.contains(Property::Read).then(|| {
            let shared = self.shared.clone();
            CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let shared = shared.clone();
                    Box::pin(async move {
                        let (request, response) = shared.park();
                        shared.emit(NativeEvent::ReadRequest {
                            request,
                            central: CentralId::new(req.device_address.to_string()),
                            characteristic: uuid,
                            offset: req.offset as usize,
                        });
                        match response.await {
                            Ok(AttResponse::Value(value)) => Ok(value),
                            Ok(AttResponse::Error(err)) => Err(req_error(err)),
                            _ => Err(ReqError::Failed),
                        }
                    })
                }),
                ..Default::default()
            }
        });

        let write = properties.is_writable().then(|| {
            let shared = self.shared.clone();
            CharacteristicWrite {
                write: properties.contains(Property::Write),
                write_without_response: properties.contains(Property::WriteWithoutResponse),
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                    let shared = shared.clone();
                    Box::pin(async move {
                        let central = CentralId::new(req.device_address.to_string());
                        if req.op_type == WriteOp::Command {
                            let request =
                                RequestId(shared.next_request.fetch_add(1, Ordering::Relaxed) + 1);
                            shared.emit(NativeEvent::WriteRequest {
                                request,
                                central,
                                characteristic: uuid,
                                value,
                                respond_expected: false,
                            });
                            return Ok(());
                        }

                        let (request, response) = shared.park();
                        shared.emit(NativeEvent::WriteRequest {
                            request,
                            central,
                            characteristic: uuid,
                            value,
                            respond_expected: true,
                        });
                        match response.await {
                            Ok(AttResponse::Written) => Ok(()),
                            Ok(AttResponse::Error(err)) => Err(req_error(err)),
                            _ => Err(ReqError::Failed),
                        }
                    })
                })),
                ..Default::default()
            }
        });

        let notify = properties.can_push().then(|| {
            let shared = self.shared.clone();
            let queue_len = self.config.notify_queue_len.max(1);
            let max_update_len = self.config.notify_max_update_len;
            CharacteristicNotify {
                notify: properties.contains(Property::Notify),
                indicate: properties.contains(Property::Indicate),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let shared = shared.clone();
                    Box::pin(run_notify_session(
                        shared,
                        notifier,
                        uuid,
                        queue_len,
                        max_update_len,
                    ))
                })),
                ..Default::default()
            }
        });

        // BlueZ owns the CCCD
        let descriptors = definition
            .descriptors
            .iter()
            .filter(|descriptor| descriptor.uuid != CLIENT_CONFIGURATION_UUID)
            .map(|descriptor| {
                let value = descriptor.value.clone();
                GattDescriptor {
                    uuid: descriptor.uuid,
                    read: Some(DescriptorRead {
                        read: true,
                        fun: Box::new(move |_req| {
                            let value = value.clone();
                            Box::pin(async move { Ok(value) })
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect();

        GattCharacteristic {
            uuid,
            read,
            write,
            notify,
            descriptors,
            ..Default::default()
        }
    }
}

async fn run_notify_session(
    shared: Arc<Shared>,
    mut notifier: CharacteristicNotifier,
    characteristic: Uuid,
    queue_len: usize,
    max_update_len: usize,
) {
    let session = shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let central = CentralId::new(format!("bluez-notify-{}", session));
    let kind = if notifier.confirming() {
        SubscriptionKind::Indicate
    } else {
        SubscriptionKind::Notify
    };
    let (values, mut queued) = mpsc::channel(queue_len);
    let blocked = Arc::new(AtomicBool::new(false));

    shared.sessions.lock().insert(
        central.clone(),
        NotifySession {
            characteristic,
            values,
            blocked: blocked.clone(),
        },
    );
    shared.emit(NativeEvent::CentralSubscribed {
        central: central.clone(),
        characteristic,
        kind,
        enabled: true,
        max_update_len: Some(max_update_len),
    });

    loop {
        let next = tokio::select! {
            value = queued.recv() => value,
            _ = notifier.stopped() => None,
        };
        let Some(value) = next else { break };
        if let Err(err) = notifier.notify(value).await {
            warn!("Notify session {} on {} ended: {}", central, characteristic, err);
            break;
        }
        if blocked.swap(false, Ordering::AcqRel) {
            if let Some(events) = shared.events() {
                events.ready_to_send_more();
            }
        }
    }

    shared.sessions.lock().remove(&central);
    if let Some(events) = shared.events() {
        events.central_disconnected(central);
    }
}

#[async_trait]
impl NativeStack for BluezStack {
    fn attach(&self, events: NativeEventSender) {
        *self.shared.events.lock() = Some(events.clone());

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            let stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Cannot watch adapter {}: {}", adapter.name(), err);
                    return;
                }
            };
            let mut stream = Box::pin(stream);
            while let Some(event) = stream.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = if powered {
                        AdapterState::PoweredOn
                    } else {
                        AdapterState::PoweredOff
                    };
                    if !events.state_changed(state) {
                        break;
                    }
                }
            }
        });
    }

    fn power_state(&self) -> AdapterState {
        self.initial_power
    }

    async fn publish_service(&self, service: &ServiceDefinition) -> Result<(), NativeError> {
        let application = Application {
            services: vec![GattService {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|characteristic| self.characteristic(characteristic))
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| native_error("Failed to register GATT service", e))?;
        self.applications.lock().insert(service.uuid, handle);
        info!("Registered GATT service {}", service.uuid);
        Ok(())
    }

    async fn unpublish_service(&self, service: Uuid) -> Result<(), NativeError> {
        // Dropping the handle unregisters the application
        if self.applications.lock().remove(&service).is_some() {
            info!("Unregistered GATT service {}", service);
        }
        Ok(())
    }

    async fn start_advertising(&self, request: &AdvertisingRequest) -> Result<(), NativeError> {
        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [request.service].into_iter().collect(),
            local_name: Some(request.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };
        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| native_error("Failed to start advertising", e))?;
        *self.advertisement.lock() = Some(handle);
        info!("Started BLE advertising as '{}'", request.local_name);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), NativeError> {
        if let Some(handle) = self.advertisement.lock().take() {
            drop(handle);
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    fn send_value(&self, central: &CentralId, characteristic: Uuid, value: &[u8]) -> SendOutcome {
        let sessions = self.shared.sessions.lock();
        let Some(session) = sessions.get(central) else {
            return SendOutcome::Failed(NativeError::new(format!("no notify session for {}", central)));
        };
        if session.characteristic != characteristic {
            return SendOutcome::Failed(NativeError::new(format!(
                "{} is subscribed to {}, not {}",
                central, session.characteristic, characteristic
            )));
        }
        match session.values.try_send(value.to_vec()) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                session.blocked.store(true, Ordering::Release);
                SendOutcome::WouldBlock
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                SendOutcome::Failed(NativeError::new(format!("notify session {} closed", central)))
            }
        }
    }

    fn respond(&self, request: RequestId, response: AttResponse) {
        match self.shared.pending.lock().remove(&request) {
            Some(pending) => {
                let _ = pending.send(response);
            }
            None => debug!("No parked request {}", request),
        }
    }
}
