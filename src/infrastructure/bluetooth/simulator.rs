//! Simulated micro:bit
//!
//! An in-process [`Transport`] that behaves like a micro:bit running the
//! standard BLE profile. Requests are answered asynchronously after a fixed
//! latency; every request is recorded for inspection.

use crate::domain::models::{AdapterState, PeripheralId};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    Characteristic, Transport, TransportEvent, TransportRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Configuration for the simulated board
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Advertised name
    pub name: String,
    /// Services the board exposes
    pub services: Vec<Uuid>,
    /// Delay before every answer
    pub latency: Duration,
    /// Adapter state reported on `initialize`
    pub adapter: AdapterState,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            name: "BBC micro:bit [sim]".to_string(),
            services: protocol::service_uuids(),
            latency: Duration::from_millis(5),
            adapter: AdapterState::PoweredOn,
        }
    }
}

#[derive(Default)]
struct Board {
    values: HashMap<Uuid, Vec<u8>>,
    notifying: HashSet<Uuid>,
    failing: HashSet<Uuid>,
    connected: bool,
    requests: Vec<TransportRequest>,
    in_flight: usize,
    max_in_flight: usize,
}

pub struct SimulatedMicrobit {
    config: SimulatorConfig,
    id: PeripheralId,
    events: mpsc::UnboundedSender<TransportEvent>,
    board: Arc<Mutex<Board>>,
}

impl SimulatedMicrobit {
    /// Create the board and the event feed to hand to `Central::listen`.
    pub fn new(config: SimulatorConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let board = Board {
            values: default_values(),
            ..Default::default()
        };
        let simulator = Arc::new(Self {
            config,
            id: PeripheralId("sim-microbit".to_string()),
            events,
            board: Arc::new(Mutex::new(board)),
        });
        (simulator, rx)
    }

    /// Identifier the board advertises under
    pub fn peripheral_id(&self) -> &PeripheralId {
        &self.id
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        lock(&self.board)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.board().requests.clone()
    }

    /// Only the writes, in arrival order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.board()
            .requests
            .iter()
            .filter_map(|request| match request {
                TransportRequest::Write(uuid, value) => Some((*uuid, value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Highest number of read/write/notify requests ever outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.board().max_in_flight
    }

    pub fn value(&self, uuid: &Uuid) -> Option<Vec<u8>> {
        self.board().values.get(uuid).cloned()
    }

    /// Replace a stored characteristic value
    pub fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        self.board().values.insert(uuid, value);
    }

    pub fn is_notifying(&self, uuid: &Uuid) -> bool {
        self.board().notifying.contains(uuid)
    }

    /// Make every subsequent operation on `uuid` fail.
    pub fn fail(&self, uuid: Uuid) {
        self.board().failing.insert(uuid);
    }

    /// Push a notification if the characteristic is subscribed. Returns
    /// whether it was sent.
    pub fn notify(&self, uuid: Uuid, value: Vec<u8>) -> bool {
        {
            let board = self.board();
            if !board.connected || !board.notifying.contains(&uuid) {
                return false;
            }
        }
        self.emit(TransportEvent::CharacteristicValue {
            characteristic: uuid,
            value: Ok(value),
        });
        true
    }

    /// Drop the link without being asked to.
    pub fn drop_link(&self) {
        {
            let mut board = self.board();
            board.connected = false;
            board.notifying.clear();
        }
        self.emit(TransportEvent::PeripheralDisconnected {
            peripheral: self.id.clone(),
            error: Some(TransportError::new("connection lost")),
        });
    }

    /// Report a new adapter state, as if the radio changed
    pub fn set_adapter_state(&self, state: AdapterState) {
        self.emit(TransportEvent::AdapterStateChanged(state));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, request: TransportRequest) {
        trace!("Simulator received {:?}", request);
        self.board().requests.push(request);
    }

    /// Answer after the configured latency.
    fn respond_later(&self, event: TransportEvent) {
        let events = self.events.clone();
        let latency = self.config.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = events.send(event);
        });
    }

    /// Answer a GATT operation after the configured latency, tracking how
    /// many are outstanding.
    fn respond_gatt(&self, answer: impl FnOnce(&mut Board) -> TransportEvent + Send + 'static) {
        {
            let mut board = self.board();
            board.in_flight += 1;
            board.max_in_flight = board.max_in_flight.max(board.in_flight);
        }
        let board = Arc::clone(&self.board);
        let events = self.events.clone();
        let latency = self.config.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let event = {
                let mut board = lock(&board);
                board.in_flight -= 1;
                answer(&mut board)
            };
            let _ = events.send(event);
        });
    }
}

impl Transport for SimulatedMicrobit {
    fn initialize(&self) {
        self.record(TransportRequest::Initialize);
        self.respond_later(TransportEvent::AdapterStateChanged(self.config.adapter));
    }

    fn start_scan(&self) {
        self.record(TransportRequest::StartScan);
        self.respond_later(TransportEvent::PeripheralDiscovered {
            peripheral: PeripheralId("sim-speaker".to_string()),
            name: Some("LE-Speaker".to_string()),
            rssi: -71,
        });
        self.respond_later(TransportEvent::PeripheralDiscovered {
            peripheral: self.id.clone(),
            name: Some(self.config.name.clone()),
            rssi: -58,
        });
    }

    fn stop_scan(&self) {
        self.record(TransportRequest::StopScan);
    }

    fn connect(&self, peripheral: &PeripheralId) {
        self.record(TransportRequest::Connect(peripheral.clone()));
        if *peripheral != self.id {
            self.respond_later(TransportEvent::PeripheralConnectFailed {
                peripheral: peripheral.clone(),
                error: TransportError::new("unknown peripheral"),
            });
            return;
        }
        self.board().connected = true;
        self.respond_later(TransportEvent::PeripheralConnected {
            peripheral: peripheral.clone(),
        });
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        self.record(TransportRequest::Disconnect(peripheral.clone()));
        {
            let mut board = self.board();
            board.connected = false;
            board.notifying.clear();
        }
        self.respond_later(TransportEvent::PeripheralDisconnected {
            peripheral: peripheral.clone(),
            error: None,
        });
    }

    fn discover_services(&self, peripheral: &PeripheralId, services: &[Uuid]) {
        self.record(TransportRequest::DiscoverServices(services.to_vec()));
        let found = self
            .config
            .services
            .iter()
            .filter(|service| services.contains(service))
            .copied()
            .collect();
        self.respond_later(TransportEvent::ServicesDiscovered {
            peripheral: peripheral.clone(),
            services: Ok(found),
        });
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &Uuid,
        characteristics: &[Uuid],
    ) {
        self.record(TransportRequest::DiscoverCharacteristics(
            *service,
            characteristics.to_vec(),
        ));
        let available = protocol::characteristic_uuids(service);
        let found = characteristics
            .iter()
            .filter(|uuid| available.contains(uuid))
            .copied()
            .collect();
        self.respond_later(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service: *service,
            characteristics: found,
            error: None,
        });
    }

    fn read(&self, _peripheral: &PeripheralId, characteristic: &Characteristic) {
        let uuid = characteristic.uuid;
        self.record(TransportRequest::Read(uuid));
        self.respond_gatt(move |board| {
            let value = if board.failing.contains(&uuid) {
                Err(TransportError::new("read failed"))
            } else {
                board
                    .values
                    .get(&uuid)
                    .cloned()
                    .ok_or_else(|| TransportError::new("read not permitted"))
            };
            TransportEvent::CharacteristicValue {
                characteristic: uuid,
                value,
            }
        });
    }

    fn write(&self, _peripheral: &PeripheralId, characteristic: &Characteristic, value: &[u8]) {
        let uuid = characteristic.uuid;
        let value = value.to_vec();
        self.record(TransportRequest::Write(uuid, value.clone()));
        self.respond_gatt(move |board| {
            let result = if board.failing.contains(&uuid) {
                Err(TransportError::new("write rejected"))
            } else {
                debug!("Simulator stored {} bytes in {}", value.len(), uuid);
                board.values.insert(uuid, value);
                Ok(())
            };
            TransportEvent::CharacteristicWritten {
                characteristic: uuid,
                result,
            }
        });
    }

    fn set_notify(&self, _peripheral: &PeripheralId, characteristic: &Characteristic, enabled: bool) {
        let uuid = characteristic.uuid;
        self.record(TransportRequest::SetNotify(uuid, enabled));
        self.respond_gatt(move |board| {
            let result = if board.failing.contains(&uuid) {
                Err(TransportError::new("notify not permitted"))
            } else {
                if enabled {
                    board.notifying.insert(uuid);
                } else {
                    board.notifying.remove(&uuid);
                }
                Ok(enabled)
            };
            TransportEvent::NotificationStateChanged {
                characteristic: uuid,
                result,
            }
        });
    }
}

fn lock(board: &Mutex<Board>) -> MutexGuard<'_, Board> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

fn default_values() -> HashMap<Uuid, Vec<u8>> {
    let vector = |x: i16, y: i16, z: i16| {
        [x, y, z]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>()
    };
    HashMap::from([
        (protocol::MODEL_NUMBER, b"BBC micro:bit V2.0".to_vec()),
        (protocol::SERIAL_NUMBER, b"9904360".to_vec()),
        (protocol::FIRMWARE_REVISION, b"2.1.1".to_vec()),
        (protocol::HARDWARE_REVISION, b"nRF52833".to_vec()),
        (protocol::MANUFACTURER_NAME, b"Micro:bit Educational Foundation".to_vec()),
        (protocol::TEMPERATURE_DATA, vec![21]),
        (protocol::TEMPERATURE_PERIOD, protocol::encode_u16(1000)),
        (protocol::BUTTON_A_STATE, vec![0]),
        (protocol::BUTTON_B_STATE, vec![0]),
        (protocol::PIN_DATA, Vec::new()),
        (protocol::PIN_AD_CONFIGURATION, vec![0; 4]),
        (protocol::PIN_IO_CONFIGURATION, vec![0; 4]),
        (protocol::LED_MATRIX_STATE, vec![0; protocol::LED_ROWS]),
        (protocol::SCROLLING_DELAY, protocol::encode_u16(120)),
        (protocol::MAGNETOMETER_DATA, vector(0, 0, 0)),
        (protocol::MAGNETOMETER_PERIOD, protocol::encode_u16(20)),
        (protocol::MAGNETOMETER_BEARING, protocol::encode_u16(0)),
        (protocol::ACCELEROMETER_DATA, vector(0, 0, -1024)),
        (protocol::ACCELEROMETER_PERIOD, protocol::encode_u16(20)),
    ])
}
