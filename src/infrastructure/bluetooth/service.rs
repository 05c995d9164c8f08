//! Micro:bit Service Module
//!
//! Public entry point for applications. Commands are fire-and-forget; the
//! effects show up in the observable [`MicrobitState`].

use crate::domain::models::{
    AdapterState, Command, MicrobitState, Notification, NotificationStream, PeripheralState,
    PinConfiguration, PinOutput, PwmOutput, Sensor, INPUT_PIN_COUNT,
};
use crate::domain::settings::Settings;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::{
    connection::{Central, CentralConfig},
    executor::{CommandExecutor, ExecutorHandle},
    protocol::LED_ROWS,
    transport::{Transport, TransportEvent},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `start` waits for the transport to report the adapter.
const ADAPTER_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Main service coordinating the micro:bit connection
pub struct MicrobitService {
    central: Arc<Central>,
    executor: ExecutorHandle,
    state_tx: Arc<watch::Sender<MicrobitState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MicrobitService {
    /// Wire a transport and its event feed to a new state machine, start
    /// the command executor and begin monitoring the adapter.
    ///
    /// Returns once the transport has reported the adapter, so commands
    /// queued right away see its real state. Fails `UnknownAdapterState`
    /// when no report arrives in time.
    pub async fn start(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        settings: &Settings,
    ) -> Result<Self> {
        let central = Central::new(transport, CentralConfig::from(settings));
        let listener = central.listen(events);
        let mut adapter = match central.initialize() {
            Ok(adapter) => adapter,
            Err(e) => {
                listener.abort();
                return Err(e);
            }
        };

        let powered = match tokio::time::timeout(
            ADAPTER_REPORT_TIMEOUT,
            adapter.wait_for(|state| *state != AdapterState::Unknown),
        )
        .await
        {
            Ok(Ok(state)) => *state == AdapterState::PoweredOn,
            _ => {
                warn!("Adapter state was never reported");
                listener.abort();
                return Err(Error::UnknownAdapterState);
            }
        };
        let mut tasks = vec![listener];

        let executor =
            CommandExecutor::new(central.clone(), settings.enable_notifications_on_connect)
                .start();

        let (state_tx, _) = watch::channel(MicrobitState {
            adapter_enabled: powered,
            ..Default::default()
        });
        let state_tx = Arc::new(state_tx);

        tasks.push(forward(adapter, state_tx.clone(), |state, adapter| {
            state.adapter_enabled = *adapter == AdapterState::PoweredOn;
        }));
        tasks.push(forward(
            central.state_changes(),
            state_tx.clone(),
            |state, peripheral: &PeripheralState| {
                state.connected = peripheral.is_linked();
            },
        ));
        tasks.push(forward(
            central.service_changes(),
            state_tx.clone(),
            |state, services| {
                state.available_services = services.clone();
            },
        ));

        for stream in NotificationStream::ALL {
            if let Some(mut rx) = central.subscribe(stream) {
                let state_tx = state_tx.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(notification) = rx.recv().await {
                        state_tx.send_modify(|state| apply(state, notification));
                    }
                }));
            }
        }

        info!("Micro:bit service started");
        Ok(Self {
            central,
            executor,
            state_tx,
            tasks,
        })
    }

    /// Latest observed state.
    pub fn state(&self) -> MicrobitState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to state updates
    pub fn state_changes(&self) -> watch::Receiver<MicrobitState> {
        self.state_tx.subscribe()
    }

    /// The underlying state machine, for one-shot reads the command queue
    /// does not cover.
    pub fn central(&self) -> &Arc<Central> {
        &self.central
    }

    /// Queue an arbitrary command
    pub fn enqueue(&self, command: Command) {
        self.executor.enqueue(command);
    }

    /// Scan for and connect to the board
    pub fn connect(&self) {
        self.enqueue(Command::Connect);
    }

    /// Disconnect from the board
    pub fn disconnect(&self) {
        self.enqueue(Command::Disconnect);
    }

    /// Set the accelerometer sampling period in milliseconds
    pub fn set_accelerometer_period(&self, period_ms: u16) {
        self.enqueue(Command::SetPeriod {
            sensor: Sensor::Accelerometer,
            period_ms,
        });
    }

    /// Set the magnetometer sampling period in milliseconds
    pub fn set_magnetometer_period(&self, period_ms: u16) {
        self.enqueue(Command::SetPeriod {
            sensor: Sensor::Magnetometer,
            period_ms,
        });
    }

    /// One byte per row, bit 4 is the leftmost column.
    pub fn display_matrix(&self, rows: [u8; LED_ROWS]) {
        self.enqueue(Command::DisplayMatrix(rows));
    }

    /// Scroll text on the display
    pub fn display_text(&self, text: impl Into<String>) {
        self.enqueue(Command::DisplayText(text.into()));
    }

    /// Set the text scroll delay in milliseconds
    pub fn set_scroll_delay(&self, delay_ms: u16) {
        self.enqueue(Command::SetScrollDelay(delay_ms));
    }

    /// Pins not listed become outputs.
    pub fn configure_input_pins(&self, pins: Vec<u8>) {
        self.enqueue(Command::ConfigurePins(PinConfiguration::Input(pins)));
    }

    /// Pins not listed become digital.
    pub fn configure_analog_pins(&self, pins: Vec<u8>) {
        self.enqueue(Command::ConfigurePins(PinConfiguration::Analog(pins)));
    }

    /// Set digital output pins
    pub fn output_digital(&self, values: Vec<(u8, bool)>) {
        self.enqueue(Command::Output(PinOutput::Digital(values)));
    }

    /// Drive PWM outputs
    pub fn output_pwm(&self, channels: Vec<PwmOutput>) {
        self.enqueue(Command::Output(PinOutput::Pwm(channels)));
    }

    /// Pause the queue while connected.
    pub fn wait(&self, ms: u64) {
        self.enqueue(Command::Wait(ms));
    }

    /// Stop the executor and every forwarding task. Queued commands are
    /// discarded and a connect still scanning is canceled.
    pub async fn shutdown(&mut self) {
        self.executor.stop().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Micro:bit service stopped");
    }
}

impl Drop for MicrobitService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Mirror a watch channel into the published state.
fn forward<T>(
    mut rx: watch::Receiver<T>,
    state_tx: Arc<watch::Sender<MicrobitState>>,
    update: impl Fn(&mut MicrobitState, &T) + Send + 'static,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            {
                let value = rx.borrow_and_update();
                state_tx.send_modify(|state| update(state, &*value));
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

fn apply(state: &mut MicrobitState, notification: Notification) {
    match notification {
        Notification::ButtonA(button) => state.button_a = button,
        Notification::ButtonB(button) => state.button_b = button,
        Notification::Accelerometer(vector) => state.accelerometer = vector.scaled(),
        Notification::Magnetometer(vector) => state.magnetometer = vector.scaled(),
        Notification::PinData(values) => {
            for value in values {
                match state.input_pins.get_mut(value.pin as usize) {
                    Some(slot) => *slot = value.value,
                    None => debug!(
                        "Ignoring pin {} (only {} are mirrored)",
                        value.pin, INPUT_PIN_COUNT
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ButtonState, PinValue, ServiceId, Vector3};
    use crate::infrastructure::bluetooth::protocol;
    use crate::infrastructure::bluetooth::simulator::{SimulatedMicrobit, SimulatorConfig};
    use crate::infrastructure::bluetooth::transport::TransportRequest;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_with(config: SimulatorConfig) -> (Arc<SimulatedMicrobit>, MicrobitService) {
        let (sim, events) = SimulatedMicrobit::new(SimulatorConfig {
            latency: Duration::from_millis(1),
            ..config
        });
        let service = MicrobitService::start(sim.clone(), events, &Settings::default())
            .await
            .unwrap();
        (sim, service)
    }

    async fn start() -> (Arc<SimulatedMicrobit>, MicrobitService) {
        start_with(SimulatorConfig::default()).await
    }

    async fn observe(service: &MicrobitService, f: impl FnMut(&MicrobitState) -> bool) {
        let mut rx = service.state_changes();
        timeout(Duration::from_secs(2), rx.wait_for(f))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn raw_vector(x: i16, y: i16, z: i16) -> Vec<u8> {
        [x, y, z].iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_apply_pin_data_ignores_out_of_range_pins() {
        let mut state = MicrobitState::default();
        apply(
            &mut state,
            Notification::PinData(vec![
                PinValue { pin: 0, value: 200 },
                PinValue { pin: 19, value: 7 },
                PinValue { pin: 25, value: 9 },
            ]),
        );
        assert_eq!(state.input_pins[0], 200);
        assert_eq!(state.input_pins[19], 7);
        assert_eq!(state.input_pins.iter().filter(|v| **v != 0).count(), 2);
    }

    #[test]
    fn test_apply_scales_vectors() {
        let mut state = MicrobitState::default();
        apply(
            &mut state,
            Notification::Magnetometer(Vector3 {
                x: -250,
                y: 0,
                z: 2000,
            }),
        );
        assert_eq!(state.magnetometer, [-0.25, 0.0, 2.0]);
    }

    #[tokio::test]
    async fn test_state_follows_connection() {
        let (_sim, service) = start().await;
        observe(&service, |s| s.adapter_enabled).await;

        service.connect();
        observe(&service, |s| s.connected && s.available_services.len() == 7).await;
        assert!(service
            .state()
            .available_services
            .contains(&ServiceId::Accelerometer));

        service.disconnect();
        observe(&service, |s| !s.connected && s.available_services.is_empty()).await;
    }

    #[tokio::test]
    async fn test_notifications_update_state() {
        let (sim, service) = start().await;
        service.connect();
        until(|| sim.is_notifying(&protocol::PIN_DATA)).await;

        assert!(sim.notify(protocol::ACCELEROMETER_DATA, raw_vector(1000, -500, 0)));
        observe(&service, |s| s.accelerometer == [1.0, -0.5, 0.0]).await;

        assert!(sim.notify(protocol::BUTTON_A_STATE, vec![2]));
        observe(&service, |s| s.button_a == ButtonState::LongPressed).await;

        assert!(sim.notify(protocol::PIN_DATA, vec![3, 17]));
        observe(&service, |s| s.input_pins[3] == 17).await;

        // Odd length, discarded
        assert!(sim.notify(protocol::PIN_DATA, vec![3, 99, 4]));
        assert!(sim.notify(protocol::BUTTON_B_STATE, vec![1]));
        observe(&service, |s| s.button_b == ButtonState::Pressed).await;
        assert_eq!(service.state().input_pins[3], 17);
        assert_eq!(service.state().input_pins[4], 0);
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_clears_connection() {
        let (sim, service) = start().await;
        service.connect();
        observe(&service, |s| s.connected).await;

        sim.drop_link();
        observe(&service, |s| !s.connected && s.available_services.is_empty()).await;

        service.connect();
        observe(&service, |s| s.connected).await;
    }

    #[tokio::test]
    async fn test_shutdown_discards_commands() {
        let (sim, mut service) = start().await;
        observe(&service, |s| s.adapter_enabled).await;

        service.shutdown().await;
        service.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!sim.requests().contains(&TransportRequest::StartScan));
        assert!(!service.state().connected);
    }

    #[tokio::test]
    async fn test_connect_immediately_after_start() {
        let (sim, service) = start().await;
        assert!(service.state().adapter_enabled);

        service.connect();
        service.display_text("now");
        until(|| sim.writes().len() == 1).await;

        assert_eq!(sim.writes(), vec![(protocol::LED_TEXT, b"now".to_vec())]);
        assert!(service.state().connected);
    }

    #[tokio::test]
    async fn test_start_reports_powered_off_adapter() {
        let (sim, service) = start_with(SimulatorConfig {
            adapter: AdapterState::PoweredOff,
            ..Default::default()
        })
        .await;
        assert!(!service.state().adapter_enabled);

        service.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sim.requests().contains(&TransportRequest::StartScan));
    }

    #[tokio::test]
    async fn test_shutdown_while_scanning_releases_connect() {
        let (sim, mut service) = start_with(SimulatorConfig {
            name: "LE-Lamp".to_string(),
            ..Default::default()
        })
        .await;

        service.connect();
        let mut state = service.central().state_changes();
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == PeripheralState::Scanning),
        )
        .await
        .expect("never scanned")
        .unwrap();

        service.shutdown().await;

        let central = service.central().clone();
        assert_eq!(central.peripheral_state(), PeripheralState::Idle);
        assert_eq!(sim.requests().last(), Some(&TransportRequest::StopScan));
        assert!(
            timeout(Duration::from_millis(30), central.connect())
                .await
                .is_err(),
            "a fresh connect should scan, not fail Busy"
        );
        assert!(central.cancel_connect());
    }
}
