//! GATT Operation Gateway
//!
//! Typed single-shot reads, writes and notification toggles on top of the
//! connection state machine, plus decoding of unsolicited value updates
//! into notification streams.

use crate::domain::models::{
    ButtonState, Notification, NotificationStream, PeripheralId, PeripheralState,
    PinConfiguration, PinOutput, PinValue, Sensor, Vector3,
};
use crate::error::{Error, Result, TransportError};
use crate::infrastructure::bluetooth::connection::{
    await_completion, complete, occupy, Central, Inner,
};
use crate::infrastructure::bluetooth::protocol::{self, LED_ROWS};
use crate::infrastructure::bluetooth::transport::Characteristic;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

impl Central {
    /// Preconditions shared by every gateway operation, checked in order:
    /// radio powered, link idle, characteristic discovered.
    fn target(&self, inner: &Inner, uuid: &Uuid) -> Result<(PeripheralId, Characteristic)> {
        inner.adapter.ensure_powered_on()?;
        if inner.state != PeripheralState::Connected {
            return Err(Error::Busy);
        }
        let characteristic = inner
            .characteristics
            .get(uuid)
            .cloned()
            .ok_or(Error::NotSupported(*uuid))?;
        let peripheral = inner
            .peripheral
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or(Error::NotConnected)?;
        Ok((peripheral, characteristic))
    }

    /// Read the raw value of a characteristic.
    pub async fn read_value(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic, rx) = {
            let mut inner = self.lock();
            let (peripheral, characteristic) = self.target(&inner, &uuid)?;
            let (tx, rx) = oneshot::channel();
            occupy(&mut inner.in_flight.read, (uuid, tx), "read");
            self.set_state(&mut inner, PeripheralState::Reading);
            (peripheral, characteristic, rx)
        };
        self.transport.read(&peripheral, &characteristic);
        await_completion(rx).await
    }

    /// Write a raw value and wait for the acknowledgement.
    pub async fn write_value(&self, uuid: Uuid, value: &[u8]) -> Result<()> {
        let (peripheral, characteristic, rx) = {
            let mut inner = self.lock();
            let (peripheral, characteristic) = self.target(&inner, &uuid)?;
            let (tx, rx) = oneshot::channel();
            occupy(&mut inner.in_flight.write, (uuid, tx), "write");
            self.set_state(&mut inner, PeripheralState::Writing);
            (peripheral, characteristic, rx)
        };
        trace!("Writing {:02X?} to {}", value, uuid);
        self.transport.write(&peripheral, &characteristic, value);
        await_completion(rx).await
    }

    /// Enable or disable notifications on a characteristic.
    pub async fn set_notify(&self, uuid: Uuid, enabled: bool) -> Result<()> {
        let (peripheral, characteristic, rx) = {
            let mut inner = self.lock();
            let (peripheral, characteristic) = self.target(&inner, &uuid)?;
            let (tx, rx) = oneshot::channel();
            occupy(&mut inner.in_flight.notify, (uuid, tx), "notify");
            self.set_state(&mut inner, PeripheralState::Setting);
            (peripheral, characteristic, rx)
        };
        debug!("Setting notifications on {} to {}", uuid, enabled);
        self.transport.set_notify(&peripheral, &characteristic, enabled);
        await_completion(rx).await
    }

    /// Read a UTF-8 string, replacing invalid sequences
    pub async fn read_string(&self, uuid: Uuid) -> Result<String> {
        let bytes = self.read_value(uuid).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a single byte
    pub async fn read_u8(&self, uuid: Uuid) -> Result<u8> {
        match self.read_value(uuid).await?.as_slice() {
            [value] => Ok(*value),
            other => Err(malformed(1, other)),
        }
    }

    /// Read a little-endian 16-bit value
    pub async fn read_u16(&self, uuid: Uuid) -> Result<u16> {
        let bytes = self.read_value(uuid).await?;
        protocol::decode_u16(&bytes).ok_or_else(|| malformed(2, &bytes))
    }

    /// Read three little-endian signed 16-bit values
    pub async fn read_vector(&self, uuid: Uuid) -> Result<Vector3> {
        let bytes = self.read_value(uuid).await?;
        protocol::decode_vector(&bytes).ok_or_else(|| malformed(6, &bytes))
    }

    // Device information

    /// Model number string from the device information service
    pub async fn read_model_number(&self) -> Result<String> {
        self.read_string(protocol::MODEL_NUMBER).await
    }

    /// Serial number string
    pub async fn read_serial_number(&self) -> Result<String> {
        self.read_string(protocol::SERIAL_NUMBER).await
    }

    /// Firmware revision string
    pub async fn read_firmware_revision(&self) -> Result<String> {
        self.read_string(protocol::FIRMWARE_REVISION).await
    }

    /// Hardware revision string
    pub async fn read_hardware_revision(&self) -> Result<String> {
        self.read_string(protocol::HARDWARE_REVISION).await
    }

    /// Manufacturer name string
    pub async fn read_manufacturer_name(&self) -> Result<String> {
        self.read_string(protocol::MANUFACTURER_NAME).await
    }

    // Sensors

    /// Die temperature in degrees Celsius.
    pub async fn read_temperature(&self) -> Result<i8> {
        let raw = self.read_u8(protocol::TEMPERATURE_DATA).await?;
        Ok(i8::from_le_bytes([raw]))
    }

    /// Raw accelerometer sample in milli-g
    pub async fn read_accelerometer(&self) -> Result<Vector3> {
        self.read_vector(protocol::ACCELEROMETER_DATA).await
    }

    /// Raw magnetometer sample
    pub async fn read_magnetometer(&self) -> Result<Vector3> {
        self.read_vector(protocol::MAGNETOMETER_DATA).await
    }

    /// Compass bearing in degrees from north.
    pub async fn read_magnetometer_bearing(&self) -> Result<u16> {
        self.read_u16(protocol::MAGNETOMETER_BEARING).await
    }

    /// Ask the board to start its compass calibration routine
    pub async fn calibrate_magnetometer(&self) -> Result<()> {
        self.write_value(protocol::MAGNETOMETER_CALIBRATION, &[1]).await
    }

    /// One-shot read of a button stream's characteristic.
    pub async fn read_button(&self, stream: NotificationStream) -> Result<ButtonState> {
        let bytes = self.read_value(stream.characteristic()).await?;
        protocol::decode_button(&bytes).ok_or_else(|| malformed(1, &bytes))
    }

    /// Sampling period in milliseconds.
    pub async fn set_period(&self, sensor: Sensor, period_ms: u16) -> Result<()> {
        self.write_value(period_characteristic(sensor), &protocol::encode_u16(period_ms))
            .await
    }

    /// Current sampling period in milliseconds
    pub async fn read_period(&self, sensor: Sensor) -> Result<u16> {
        self.read_u16(period_characteristic(sensor)).await
    }

    // LED

    /// Set the LED matrix, one byte per row, bit 4 leftmost
    pub async fn write_led_matrix(&self, rows: &[u8; LED_ROWS]) -> Result<()> {
        self.write_value(protocol::LED_MATRIX_STATE, &protocol::encode_led_matrix(rows))
            .await
    }

    /// Read back the LED matrix rows
    pub async fn read_led_matrix(&self) -> Result<[u8; LED_ROWS]> {
        let bytes = self.read_value(protocol::LED_MATRIX_STATE).await?;
        protocol::decode_led_matrix(&bytes).ok_or_else(|| malformed(LED_ROWS, &bytes))
    }

    /// Scroll text across the display (ASCII only, at most 20 characters)
    pub async fn write_led_text(&self, text: &str) -> Result<()> {
        self.write_value(protocol::LED_TEXT, &protocol::encode_led_text(text))
            .await
    }

    /// Delay between scroll steps in milliseconds
    pub async fn write_scroll_delay(&self, delay_ms: u16) -> Result<()> {
        self.write_value(protocol::SCROLLING_DELAY, &protocol::encode_u16(delay_ms))
            .await
    }

    /// Read the scroll delay in milliseconds
    pub async fn read_scroll_delay(&self) -> Result<u16> {
        self.read_u16(protocol::SCROLLING_DELAY).await
    }

    // IO pins

    /// Write the input or analog pin mask; unlisted pins get the default role
    pub async fn configure_pins(&self, configuration: &PinConfiguration) -> Result<()> {
        let (uuid, pins) = match configuration {
            PinConfiguration::Input(pins) => (protocol::PIN_IO_CONFIGURATION, pins),
            PinConfiguration::Analog(pins) => (protocol::PIN_AD_CONFIGURATION, pins),
        };
        self.write_value(uuid, &protocol::encode_pin_mask(pins))
            .await
    }

    /// Pins currently configured as inputs.
    pub async fn read_input_pins(&self) -> Result<Vec<u8>> {
        self.read_pin_mask(protocol::PIN_IO_CONFIGURATION).await
    }

    /// Pins currently configured as analog.
    pub async fn read_analog_pins(&self) -> Result<Vec<u8>> {
        self.read_pin_mask(protocol::PIN_AD_CONFIGURATION).await
    }

    async fn read_pin_mask(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let bytes = self.read_value(uuid).await?;
        let mask = protocol::decode_pin_mask(&bytes).ok_or_else(|| malformed(4, &bytes))?;
        Ok(protocol::pins_in_mask(mask))
    }

    /// Current (pin, value) pairs. An odd-length payload is reported against
    /// the even length it was cut short of.
    pub async fn read_pin_data(&self) -> Result<Vec<PinValue>> {
        let bytes = self.read_value(protocol::PIN_DATA).await?;
        protocol::decode_pin_data(&bytes).ok_or_else(|| malformed(bytes.len() & !1, &bytes))
    }

    /// Drive digital or PWM outputs
    pub async fn output(&self, output: &PinOutput) -> Result<()> {
        match output {
            PinOutput::Digital(values) => {
                self.write_value(protocol::PIN_DATA, &protocol::encode_digital_output(values))
                    .await
            }
            PinOutput::Pwm(channels) => {
                self.write_value(protocol::PWM_CONTROL, &protocol::encode_pwm_output(channels))
                    .await
            }
        }
    }

    /// Open the delivery channel for a notification stream. Returns `None`
    /// while a previous subscriber is still alive.
    pub fn subscribe(
        &self,
        stream: NotificationStream,
    ) -> Option<mpsc::UnboundedReceiver<Notification>> {
        let mut inner = self.lock();
        if inner
            .subscribers
            .get(&stream)
            .is_some_and(|tx| !tx.is_closed())
        {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.insert(stream, tx);
        Some(rx)
    }

    pub(super) fn on_value(
        &self,
        inner: &mut Inner,
        uuid: Uuid,
        value: std::result::Result<Vec<u8>, TransportError>,
    ) {
        let solicited = inner
            .in_flight
            .read
            .as_ref()
            .is_some_and(|(pending, _)| *pending == uuid);
        if solicited {
            if inner.state == PeripheralState::Reading {
                self.set_state(inner, PeripheralState::Connected);
            }
            let slot = inner.in_flight.read.take().map(|(_, tx)| tx);
            complete(slot, value.map_err(Error::OperationFailed));
            return;
        }

        let bytes = match value {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!("Value update for {} failed: {}", uuid, error);
                return;
            }
        };
        let Some(stream) = NotificationStream::from_characteristic(&uuid) else {
            debug!("Ignoring value update for {}", uuid);
            return;
        };
        let Some(notification) = protocol::decode_notification(stream, &bytes) else {
            debug!(
                "Discarding malformed {:?} payload ({} bytes)",
                stream,
                bytes.len()
            );
            return;
        };

        if let Some(tx) = inner.subscribers.get(&stream) {
            if tx.send(notification).is_err() {
                inner.subscribers.remove(&stream);
            }
        }
    }

    pub(super) fn on_written(
        &self,
        inner: &mut Inner,
        uuid: Uuid,
        result: std::result::Result<(), TransportError>,
    ) {
        if !inner
            .in_flight
            .write
            .as_ref()
            .is_some_and(|(pending, _)| *pending == uuid)
        {
            return;
        }
        if inner.state == PeripheralState::Writing {
            self.set_state(inner, PeripheralState::Connected);
        }
        let slot = inner.in_flight.write.take().map(|(_, tx)| tx);
        complete(slot, result.map_err(Error::OperationFailed));
    }

    pub(super) fn on_notify_state(
        &self,
        inner: &mut Inner,
        uuid: Uuid,
        result: std::result::Result<bool, TransportError>,
    ) {
        if !inner
            .in_flight
            .notify
            .as_ref()
            .is_some_and(|(pending, _)| *pending == uuid)
        {
            return;
        }
        if inner.state == PeripheralState::Setting {
            self.set_state(inner, PeripheralState::Connected);
        }
        let slot = inner.in_flight.notify.take().map(|(_, tx)| tx);
        complete(slot, result.map(|_| ()).map_err(Error::OperationFailed));
    }
}

fn period_characteristic(sensor: Sensor) -> Uuid {
    match sensor {
        Sensor::Accelerometer => protocol::ACCELEROMETER_PERIOD,
        Sensor::Magnetometer => protocol::MAGNETOMETER_PERIOD,
        Sensor::Temperature => protocol::TEMPERATURE_PERIOD,
    }
}

fn malformed(expected: usize, bytes: &[u8]) -> Error {
    Error::MalformedValue {
        expected,
        actual: bytes.len(),
    }
}
