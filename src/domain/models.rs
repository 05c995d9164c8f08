use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle of the single managed peripheral.
///
/// `Discovering`, `Reading`, `Writing` and `Setting` are busy sub-states of a
/// live link; only one of them is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Connected,
    Reading,
    Writing,
    Setting,
    Disconnecting,
    Disconnected,
}

impl PeripheralState {
    /// States from which a new connection attempt may start.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// Discovery finished and the link is up, possibly with a GATT
    /// operation in progress.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Reading | Self::Writing | Self::Setting
        )
    }
}

/// Availability of the local BLE radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    PoweredOff,
    PoweredOn,
    Resetting,
    Unauthorized,
    Unsupported,
    Unknown,
}

impl AdapterState {
    /// Succeeds only when the radio is usable, otherwise maps the state to
    /// the error reported to callers.
    pub fn ensure_powered_on(self) -> Result<()> {
        match self {
            Self::PoweredOn => Ok(()),
            Self::PoweredOff => Err(Error::PoweredOff),
            Self::Unauthorized => Err(Error::Unauthorized),
            Self::Resetting | Self::Unsupported => Err(Error::Unavailable),
            Self::Unknown => Err(Error::UnknownAdapterState),
        }
    }
}

/// Transport-assigned identity of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: PeripheralId,
    pub name: String,
}

/// Services of the micro:bit profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceId {
    DeviceInformation,
    Temperature,
    Button,
    IoPin,
    Led,
    Magnetometer,
    Accelerometer,
}

/// Button A/B state as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonState {
    #[default]
    Released,
    Pressed,
    LongPressed,
}

impl ButtonState {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Released),
            1 => Some(Self::Pressed),
            2 => Some(Self::LongPressed),
            _ => None,
        }
    }
}

/// Raw accelerometer (milli-g) or magnetometer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vector3 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Vector3 {
    /// Physical units: raw values divided by 1000.
    pub fn scaled(&self) -> [f64; 3] {
        [
            f64::from(self.x) / 1000.0,
            f64::from(self.y) / 1000.0,
            f64::from(self.z) / 1000.0,
        ]
    }
}

/// One `(pin, value)` pair of the IO pin data characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinValue {
    pub pin: u8,
    pub value: u8,
}

/// One PWM channel setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmOutput {
    pub pin: u8,
    /// Duty value in `0..=1024`.
    pub value: u16,
    /// Period in microseconds.
    pub period_us: u32,
}

/// Sensors whose sampling period can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Accelerometer,
    Magnetometer,
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinConfiguration {
    /// Pins to configure as inputs; all others become outputs.
    Input(Vec<u8>),
    /// Pins to configure as analog; all others become digital.
    Analog(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutput {
    Digital(Vec<(u8, bool)>),
    Pwm(Vec<PwmOutput>),
}

/// One queued intent for the command executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    SetPeriod { sensor: Sensor, period_ms: u16 },
    DisplayMatrix([u8; 5]),
    DisplayText(String),
    SetScrollDelay(u16),
    ConfigurePins(PinConfiguration),
    Output(PinOutput),
    Wait(u64),
}

/// Notification streams that can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationStream {
    ButtonA,
    ButtonB,
    Accelerometer,
    Magnetometer,
    PinData,
}

impl NotificationStream {
    pub const ALL: [NotificationStream; 5] = [
        Self::ButtonA,
        Self::ButtonB,
        Self::Accelerometer,
        Self::Magnetometer,
        Self::PinData,
    ];
}

/// A decoded notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ButtonA(ButtonState),
    ButtonB(ButtonState),
    Accelerometer(Vector3),
    Magnetometer(Vector3),
    PinData(Vec<PinValue>),
}

/// Number of edge-connector pins mirrored by the service state.
pub const INPUT_PIN_COUNT: usize = 20;

/// Observable snapshot published by the service facade.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MicrobitState {
    pub adapter_enabled: bool,
    pub connected: bool,
    pub available_services: Vec<ServiceId>,
    pub button_a: ButtonState,
    pub button_b: ButtonState,
    /// In g.
    pub accelerometer: [f64; 3],
    pub magnetometer: [f64; 3],
    pub input_pins: [u8; INPUT_PIN_COUNT],
}
