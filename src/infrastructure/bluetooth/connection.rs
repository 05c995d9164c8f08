//! BLE Connection Module
//!
//! Owns the adapter and peripheral state of the single managed micro:bit and
//! drives the scan -> connect -> discover protocol. Every operation parks a
//! one-shot completion in its in-flight slot; transport events resolve it.

use crate::domain::models::{
    AdapterState, Notification, NotificationStream, Peripheral, PeripheralId, PeripheralState,
    ServiceId,
};
use crate::domain::settings::Settings;
use crate::error::{Error, Result, TransportError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Characteristic, Transport, TransportEvent};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Advertised name prefix identifying the board
    pub device_name_prefix: String,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: "BBC micro:bit".to_string(),
        }
    }
}

impl From<&Settings> for CentralConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            device_name_prefix: settings.device_name_prefix.clone(),
        }
    }
}

type Completion<T> = oneshot::Sender<Result<T>>;

/// One slot per operation kind. Each holds at most one completion.
#[derive(Default)]
pub(super) struct InFlight {
    pub(super) connect: Option<Completion<Peripheral>>,
    pub(super) disconnect: Option<Completion<()>>,
    pub(super) read: Option<(Uuid, Completion<Vec<u8>>)>,
    pub(super) write: Option<(Uuid, Completion<()>)>,
    pub(super) notify: Option<(Uuid, Completion<()>)>,
}

/// Park a completion. A second operation of the same kind can only be
/// started by bypassing the state checks, which is a bug.
pub(super) fn occupy<T>(slot: &mut Option<T>, value: T, kind: &str) {
    assert!(slot.is_none(), "{} operation already in flight", kind);
    *slot = Some(value);
}

pub(super) fn complete<T>(slot: Option<Completion<T>>, result: Result<T>) {
    if let Some(tx) = slot {
        let _ = tx.send(result);
    }
}

pub(super) struct Inner {
    pub(super) initialized: bool,
    pub(super) adapter: AdapterState,
    pub(super) state: PeripheralState,
    pub(super) peripheral: Option<Peripheral>,
    pub(super) characteristics: HashMap<Uuid, Characteristic>,
    pub(super) available_services: BTreeSet<ServiceId>,
    outstanding_discoveries: usize,
    pub(super) in_flight: InFlight,
    pub(super) subscribers: HashMap<NotificationStream, mpsc::UnboundedSender<Notification>>,
}

/// Transport requests collected under the lock and issued after it is
/// released, so a transport may answer from inside the call.
enum Request {
    StopScan,
    Connect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid),
}

/// The connection state machine for one micro:bit.
pub struct Central {
    pub(super) transport: Arc<dyn Transport>,
    config: CentralConfig,
    pub(super) inner: Mutex<Inner>,
    adapter_tx: watch::Sender<AdapterState>,
    state_tx: watch::Sender<PeripheralState>,
    services_tx: watch::Sender<Vec<ServiceId>>,
}

impl Central {
    /// Create a new state machine around a transport
    pub fn new(transport: Arc<dyn Transport>, config: CentralConfig) -> Arc<Self> {
        let (adapter_tx, _) = watch::channel(AdapterState::Unknown);
        let (state_tx, _) = watch::channel(PeripheralState::Idle);
        let (services_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            transport,
            config,
            inner: Mutex::new(Inner {
                initialized: false,
                adapter: AdapterState::Unknown,
                state: PeripheralState::Idle,
                peripheral: None,
                characteristics: HashMap::new(),
                available_services: BTreeSet::new(),
                outstanding_discoveries: 0,
                in_flight: InFlight::default(),
                subscribers: HashMap::new(),
            }),
            adapter_tx,
            state_tx,
            services_tx,
        })
    }

    /// Feed transport events from a channel into the state machine.
    pub fn listen(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let central = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                central.handle_event(event);
            }
            debug!("Transport event channel closed");
        })
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn set_state(&self, inner: &mut Inner, state: PeripheralState) {
        if inner.state != state {
            debug!("Peripheral state {:?} -> {:?}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Start monitoring the radio. Returns the adapter state feed; a second
    /// call fails.
    pub fn initialize(&self) -> Result<watch::Receiver<AdapterState>> {
        {
            let mut inner = self.lock();
            if inner.initialized {
                return Err(Error::AlreadyInitialized);
            }
            inner.initialized = true;
        }
        info!("Initializing bluetooth central");
        self.transport.initialize();
        Ok(self.adapter_tx.subscribe())
    }

    /// Last adapter state reported by the transport
    pub fn adapter_state(&self) -> AdapterState {
        self.lock().adapter
    }

    /// Current peripheral lifecycle state
    pub fn peripheral_state(&self) -> PeripheralState {
        self.lock().state
    }

    /// Subscribe to peripheral state transitions
    pub fn state_changes(&self) -> watch::Receiver<PeripheralState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to adapter state changes
    pub fn adapter_changes(&self) -> watch::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    /// Subscribe to the available services, republished on connect and disconnect
    pub fn service_changes(&self) -> watch::Receiver<Vec<ServiceId>> {
        self.services_tx.subscribe()
    }

    /// Profile services found on the connected board
    pub fn available_services(&self) -> Vec<ServiceId> {
        self.lock().available_services.iter().copied().collect()
    }

    /// The board being connected to or connected, if any
    pub fn peripheral(&self) -> Option<Peripheral> {
        self.lock().peripheral.clone()
    }

    /// Whether discovery found this characteristic
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.lock().characteristics.contains_key(uuid)
    }

    /// Scan for, connect to and discover the micro:bit.
    pub async fn connect(&self) -> Result<Peripheral> {
        let rx = {
            let mut inner = self.lock();
            inner.adapter.ensure_powered_on()?;
            if !inner.state.can_connect() {
                return Err(Error::Busy);
            }
            let (tx, rx) = oneshot::channel();
            occupy(&mut inner.in_flight.connect, tx, "connect");
            self.set_state(&mut inner, PeripheralState::Scanning);
            rx
        };

        info!(
            "Scanning for peripherals named {:?}...",
            self.config.device_name_prefix
        );
        self.transport.start_scan();
        await_completion(rx).await
    }

    /// Abort a connection attempt that is still scanning.
    pub fn cancel_connect(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != PeripheralState::Scanning {
                return false;
            }
            self.set_state(&mut inner, PeripheralState::Idle);
            complete(inner.in_flight.connect.take(), Err(Error::CanceledToConnect));
        }
        info!("Connection attempt canceled");
        self.transport.stop_scan();
        true
    }

    /// Disconnect from the connected board
    pub async fn disconnect(&self) -> Result<()> {
        let (peripheral, rx) = {
            let mut inner = self.lock();
            inner.adapter.ensure_powered_on()?;
            if inner.state != PeripheralState::Connected {
                return Err(Error::NotConnected);
            }
            let peripheral = inner.peripheral.clone().ok_or(Error::NotConnected)?;
            let (tx, rx) = oneshot::channel();
            occupy(&mut inner.in_flight.disconnect, tx, "disconnect");
            self.set_state(&mut inner, PeripheralState::Disconnecting);
            (peripheral, rx)
        };

        info!("Disconnecting from {}", peripheral.name);
        self.transport.disconnect(&peripheral.id);
        await_completion(rx).await
    }

    /// Apply one transport event. Events about a peripheral other than the
    /// current one are ignored.
    pub fn handle_event(&self, event: TransportEvent) {
        let requests = {
            let mut inner = self.lock();
            match event {
                TransportEvent::AdapterStateChanged(state) => {
                    self.on_adapter_state(&mut inner, state);
                    Vec::new()
                }
                TransportEvent::PeripheralDiscovered {
                    peripheral,
                    name,
                    rssi,
                } => self.on_discovered(&mut inner, peripheral, name, rssi),
                TransportEvent::PeripheralConnected { peripheral } => {
                    self.on_connected(&mut inner, peripheral)
                }
                TransportEvent::PeripheralConnectFailed { peripheral, error } => {
                    if is_current(&inner, &peripheral)
                        && inner.state == PeripheralState::Connecting
                    {
                        warn!("Connection to {} failed: {}", peripheral, error);
                        inner.peripheral = None;
                        self.set_state(&mut inner, PeripheralState::Idle);
                        complete(inner.in_flight.connect.take(), Err(Error::Transport(error)));
                    }
                    Vec::new()
                }
                TransportEvent::PeripheralDisconnected { peripheral, error } => {
                    if is_current(&inner, &peripheral) {
                        let reason = error.map(Error::Transport).unwrap_or(Error::NotConnected);
                        self.tear_down(&mut inner, reason);
                    }
                    Vec::new()
                }
                TransportEvent::ServicesDiscovered {
                    peripheral,
                    services,
                } => self.on_services(&mut inner, peripheral, services),
                TransportEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics,
                    error,
                } => {
                    self.on_characteristics(&mut inner, peripheral, service, characteristics, error);
                    Vec::new()
                }
                TransportEvent::CharacteristicValue {
                    characteristic,
                    value,
                } => {
                    self.on_value(&mut inner, characteristic, value);
                    Vec::new()
                }
                TransportEvent::CharacteristicWritten {
                    characteristic,
                    result,
                } => {
                    self.on_written(&mut inner, characteristic, result);
                    Vec::new()
                }
                TransportEvent::NotificationStateChanged {
                    characteristic,
                    result,
                } => {
                    self.on_notify_state(&mut inner, characteristic, result);
                    Vec::new()
                }
            }
        };

        for request in requests {
            self.dispatch(request);
        }
    }

    fn dispatch(&self, request: Request) {
        match request {
            Request::StopScan => self.transport.stop_scan(),
            Request::Connect(peripheral) => self.transport.connect(&peripheral),
            Request::DiscoverServices(peripheral) => self
                .transport
                .discover_services(&peripheral, &protocol::service_uuids()),
            Request::DiscoverCharacteristics(peripheral, service) => {
                self.transport.discover_characteristics(
                    &peripheral,
                    &service,
                    protocol::characteristic_uuids(&service),
                )
            }
        }
    }

    fn on_adapter_state(&self, inner: &mut Inner, state: AdapterState) {
        if inner.adapter == state {
            return;
        }
        info!("Adapter state {:?} -> {:?}", inner.adapter, state);
        inner.adapter = state;
        self.adapter_tx.send_replace(state);

        if let Err(error) = state.ensure_powered_on() {
            match inner.state {
                PeripheralState::Idle | PeripheralState::Disconnected => {}
                PeripheralState::Scanning => {
                    self.set_state(inner, PeripheralState::Idle);
                    complete(inner.in_flight.connect.take(), Err(error));
                }
                _ => self.tear_down(inner, error),
            }
        }
    }

    fn on_discovered(
        &self,
        inner: &mut Inner,
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: i16,
    ) -> Vec<Request> {
        if inner.state != PeripheralState::Scanning {
            return Vec::new();
        }
        let Some(name) = name.filter(|n| n.starts_with(&self.config.device_name_prefix)) else {
            return Vec::new();
        };

        info!("Found {} ({}) at {} dBm", name, peripheral, rssi);
        inner.peripheral = Some(Peripheral {
            id: peripheral.clone(),
            name,
        });
        self.set_state(inner, PeripheralState::Connecting);
        vec![Request::StopScan, Request::Connect(peripheral)]
    }

    fn on_connected(&self, inner: &mut Inner, peripheral: PeripheralId) -> Vec<Request> {
        if !is_current(inner, &peripheral) || inner.state != PeripheralState::Connecting {
            return Vec::new();
        }
        info!("Linked to {}, discovering services", peripheral);
        self.set_state(inner, PeripheralState::Discovering);
        vec![Request::DiscoverServices(peripheral)]
    }

    fn on_services(
        &self,
        inner: &mut Inner,
        peripheral: PeripheralId,
        services: std::result::Result<Vec<Uuid>, TransportError>,
    ) -> Vec<Request> {
        if !is_current(inner, &peripheral) || inner.state != PeripheralState::Discovering {
            return Vec::new();
        }

        let mut requests = Vec::new();
        match services {
            Ok(services) => {
                for service in services {
                    let Some(id) = protocol::service_id(&service) else {
                        continue;
                    };
                    inner.available_services.insert(id);
                    if !protocol::characteristic_uuids(&service).is_empty() {
                        inner.outstanding_discoveries += 1;
                        requests.push(Request::DiscoverCharacteristics(
                            peripheral.clone(),
                            service,
                        ));
                    }
                }
            }
            Err(error) => warn!("Service discovery failed: {}", error),
        }
        self.publish_services(inner);

        if inner.outstanding_discoveries == 0 {
            self.finish_connect(inner);
        }
        requests
    }

    fn on_characteristics(
        &self,
        inner: &mut Inner,
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<TransportError>,
    ) {
        if !is_current(inner, &peripheral) || inner.state != PeripheralState::Discovering {
            return;
        }
        if let Some(error) = error {
            warn!("Characteristic discovery for {} failed: {}", service, error);
        }
        for uuid in characteristics {
            inner
                .characteristics
                .insert(uuid, Characteristic { service, uuid });
        }

        inner.outstanding_discoveries = inner.outstanding_discoveries.saturating_sub(1);
        if inner.outstanding_discoveries == 0 {
            self.finish_connect(inner);
        }
    }

    fn finish_connect(&self, inner: &mut Inner) {
        self.set_state(inner, PeripheralState::Connected);
        info!(
            "Connected with {} services, {} characteristics",
            inner.available_services.len(),
            inner.characteristics.len()
        );
        if let Some(peripheral) = inner.peripheral.clone() {
            complete(inner.in_flight.connect.take(), Ok(peripheral));
        }
    }

    /// The link is gone: drop cached connection data and resolve every
    /// parked completion.
    fn tear_down(&self, inner: &mut Inner, reason: Error) {
        if let Some(peripheral) = inner.peripheral.take() {
            info!("Disconnected from {}", peripheral.name);
        }
        inner.characteristics.clear();
        inner.available_services.clear();
        inner.outstanding_discoveries = 0;
        self.publish_services(inner);
        self.set_state(inner, PeripheralState::Disconnected);

        let in_flight = std::mem::take(&mut inner.in_flight);
        complete(in_flight.disconnect, Ok(()));
        complete(in_flight.connect, Err(reason.clone()));
        complete(in_flight.read.map(|(_, tx)| tx), Err(reason.clone()));
        complete(in_flight.write.map(|(_, tx)| tx), Err(reason.clone()));
        complete(in_flight.notify.map(|(_, tx)| tx), Err(reason));
    }

    fn publish_services(&self, inner: &Inner) {
        self.services_tx
            .send_replace(inner.available_services.iter().copied().collect());
    }
}

fn is_current(inner: &Inner, peripheral: &PeripheralId) -> bool {
    inner
        .peripheral
        .as_ref()
        .is_some_and(|current| current.id == *peripheral)
}

/// Await a parked completion. A dropped sender means the central went away.
pub(super) async fn await_completion<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.unwrap_or(Err(Error::NotConnected))
}
