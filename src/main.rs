use anyhow::Context;
use microbit_ble::domain::models::PwmOutput;
use microbit_ble::domain::settings::SettingsService;
use microbit_ble::infrastructure::bluetooth::{
    protocol, MicrobitService, SimulatedMicrobit, SimulatorConfig,
};
use microbit_ble::infrastructure::logging;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting micro:bit BLE demo");

    let (board, events) = SimulatedMicrobit::new(SimulatorConfig::default());
    let mut service = MicrobitService::start(board.clone(), events, &settings).await?;
    if !service.state().adapter_enabled {
        anyhow::bail!("bluetooth adapter is not powered on");
    }
    let mut state = service.state_changes();

    service.connect();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.connected))
        .await
        .context("timed out waiting for the micro:bit")??;

    if let Some(period) = settings.accelerometer_period_ms {
        service.set_accelerometer_period(period);
    }
    if let Some(period) = settings.magnetometer_period_ms {
        service.set_magnetometer_period(period);
    }

    service.display_matrix([0b01010, 0b11111, 0b11111, 0b01110, 0b00100]);
    service.wait(500);
    service.set_scroll_delay(100);
    service.display_text("Hello, micro:bit");
    service.configure_input_pins(vec![0, 1, 2]);
    service.configure_analog_pins(vec![1]);
    service.output_digital(vec![(8, true), (12, false)]);
    service.output_pwm(vec![PwmOutput {
        pin: 16,
        value: 512,
        period_us: 20_000,
    }]);
    service.wait(200);

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Tilt the simulated board
    let tilt = [120i16, -980, 40]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    board.notify(protocol::ACCELEROMETER_DATA, tilt);
    tokio::time::sleep(Duration::from_millis(900)).await;

    // One-shot reads bypass the queue, so only issue them once it is idle
    let central = service.central();
    match central.read_model_number().await {
        Ok(model) => info!("Model: {}", model),
        Err(e) => warn!("Could not read model number: {}", e),
    }
    match central.read_temperature().await {
        Ok(celsius) => info!("Temperature: {} °C", celsius),
        Err(e) => warn!("Could not read temperature: {}", e),
    }

    println!("{:#?}", service.state());

    service.disconnect();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| !s.connected))
        .await
        .context("timed out waiting for the disconnect")??;

    service.shutdown().await;
    info!("Demo finished");
    Ok(())
}
