//! BLE Transport Seam
//!
//! The radio stack is an external collaborator. It receives requests through
//! [`Transport`] and reports every outcome, solicited or not, as a
//! [`TransportEvent`] handed to [`Central::handle_event`].
//!
//! [`Central::handle_event`]: super::connection::Central::handle_event

use crate::domain::models::{AdapterState, PeripheralId};
use crate::error::TransportError;
use uuid::Uuid;

/// A characteristic discovered on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Requests issued to the radio stack. None of them block; completions are
/// delivered as events.
pub trait Transport: Send + Sync {
    /// Begin reporting adapter state changes.
    fn initialize(&self);

    /// Start an unfiltered scan. The micro:bit does not advertise its
    /// services, so matching happens on the advertised name.
    fn start_scan(&self);
    fn stop_scan(&self);

    fn connect(&self, peripheral: &PeripheralId);
    fn disconnect(&self, peripheral: &PeripheralId);

    fn discover_services(&self, peripheral: &PeripheralId, services: &[Uuid]);
    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &Uuid,
        characteristics: &[Uuid],
    );

    fn read(&self, peripheral: &PeripheralId, characteristic: &Characteristic);
    fn write(&self, peripheral: &PeripheralId, characteristic: &Characteristic, value: &[u8]);
    fn set_notify(&self, peripheral: &PeripheralId, characteristic: &Characteristic, enabled: bool);
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),

    PeripheralDiscovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: i16,
    },

    PeripheralConnected {
        peripheral: PeripheralId,
    },

    PeripheralConnectFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },

    PeripheralDisconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },

    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Result<Vec<Uuid>, TransportError>,
    },

    /// Characteristics found so far are reported even when discovery failed.
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<TransportError>,
    },

    /// Completes a pending read or carries a notification.
    CharacteristicValue {
        characteristic: Uuid,
        value: Result<Vec<u8>, TransportError>,
    },

    CharacteristicWritten {
        characteristic: Uuid,
        result: Result<(), TransportError>,
    },

    NotificationStateChanged {
        characteristic: Uuid,
        result: Result<bool, TransportError>,
    },
}

/// A request as seen by a transport, for logging and inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    Initialize,
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics(Uuid, Vec<Uuid>),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    SetNotify(Uuid, bool),
}
