//! Shared fixtures for the bluetooth unit tests.

use crate::domain::models::{PeripheralId, PeripheralState};
use crate::infrastructure::bluetooth::connection::Central;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    Characteristic, Transport, TransportEvent, TransportRequest,
};
use std::sync::Mutex;
use uuid::Uuid;

/// Records requests and never answers; tests drive the events by hand.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportRequest>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<TransportRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: TransportRequest) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for RecordingTransport {
    fn initialize(&self) {
        self.record(TransportRequest::Initialize);
    }

    fn start_scan(&self) {
        self.record(TransportRequest::StartScan);
    }

    fn stop_scan(&self) {
        self.record(TransportRequest::StopScan);
    }

    fn connect(&self, peripheral: &PeripheralId) {
        self.record(TransportRequest::Connect(peripheral.clone()));
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        self.record(TransportRequest::Disconnect(peripheral.clone()));
    }

    fn discover_services(&self, _peripheral: &PeripheralId, services: &[Uuid]) {
        self.record(TransportRequest::DiscoverServices(services.to_vec()));
    }

    fn discover_characteristics(
        &self,
        _peripheral: &PeripheralId,
        service: &Uuid,
        characteristics: &[Uuid],
    ) {
        self.record(TransportRequest::DiscoverCharacteristics(
            *service,
            characteristics.to_vec(),
        ));
    }

    fn read(&self, _peripheral: &PeripheralId, characteristic: &Characteristic) {
        self.record(TransportRequest::Read(characteristic.uuid));
    }

    fn write(&self, _peripheral: &PeripheralId, characteristic: &Characteristic, value: &[u8]) {
        self.record(TransportRequest::Write(characteristic.uuid, value.to_vec()));
    }

    fn set_notify(
        &self,
        _peripheral: &PeripheralId,
        characteristic: &Characteristic,
        enabled: bool,
    ) {
        self.record(TransportRequest::SetNotify(characteristic.uuid, enabled));
    }
}

pub fn peripheral_id() -> PeripheralId {
    PeripheralId("D4:1A:33:7C:09:E2".to_string())
}

/// Run a full connection where the board exposes `services` and every
/// registered characteristic of them.
pub async fn connect_with(central: &std::sync::Arc<Central>, services: &[Uuid]) {
    let task = tokio::spawn({
        let central = central.clone();
        async move { central.connect().await }
    });
    central
        .state_changes()
        .wait_for(|s| *s == PeripheralState::Scanning)
        .await
        .unwrap();

    central.handle_event(TransportEvent::PeripheralDiscovered {
        peripheral: peripheral_id(),
        name: Some("BBC micro:bit [tezep]".to_string()),
        rssi: -55,
    });
    central.handle_event(TransportEvent::PeripheralConnected {
        peripheral: peripheral_id(),
    });
    central.handle_event(TransportEvent::ServicesDiscovered {
        peripheral: peripheral_id(),
        services: Ok(services.to_vec()),
    });
    for service in services {
        central.handle_event(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral_id(),
            service: *service,
            characteristics: protocol::characteristic_uuids(service).to_vec(),
            error: None,
        });
    }

    task.await.unwrap().unwrap();
    assert_eq!(central.peripheral_state(), PeripheralState::Connected);
}
