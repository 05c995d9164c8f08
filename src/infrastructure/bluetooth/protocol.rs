//! micro:bit GATT Profile
//!
//! Service and characteristic UUIDs exposed by the micro:bit firmware, the
//! set of characteristics discovered per service, and the byte layouts of
//! every characteristic value. All multi-byte fields are little-endian.

use crate::domain::models::{
    ButtonState, Notification, NotificationStream, PinValue, PwmOutput, ServiceId, Vector3,
};
use tracing::trace;
use uuid::Uuid;

/// Device Information Service (Bluetooth SIG)
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const SERIAL_NUMBER: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
pub const FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const HARDWARE_REVISION: Uuid = Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb);
pub const MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// Temperature Service
pub const TEMPERATURE_SERVICE: Uuid = Uuid::from_u128(0xe95d6100_251d_470a_a062_fa1922dfa9a8);
/// Signed 8-bit, degrees Celsius
pub const TEMPERATURE_DATA: Uuid = Uuid::from_u128(0xe95d9250_251d_470a_a062_fa1922dfa9a8);
pub const TEMPERATURE_PERIOD: Uuid = Uuid::from_u128(0xe95d1b25_251d_470a_a062_fa1922dfa9a8);

/// Button Service
pub const BUTTON_SERVICE: Uuid = Uuid::from_u128(0xe95d9882_251d_470a_a062_fa1922dfa9a8);
pub const BUTTON_A_STATE: Uuid = Uuid::from_u128(0xe95dda90_251d_470a_a062_fa1922dfa9a8);
pub const BUTTON_B_STATE: Uuid = Uuid::from_u128(0xe95dda91_251d_470a_a062_fa1922dfa9a8);

/// IO Pin Service
pub const IO_PIN_SERVICE: Uuid = Uuid::from_u128(0xe95d127b_251d_470a_a062_fa1922dfa9a8);
pub const PIN_DATA: Uuid = Uuid::from_u128(0xe95d8d00_251d_470a_a062_fa1922dfa9a8);
/// Analog/digital mask, bit set = analog
pub const PIN_AD_CONFIGURATION: Uuid = Uuid::from_u128(0xe95d5899_251d_470a_a062_fa1922dfa9a8);
/// Input/output mask, bit set = input
pub const PIN_IO_CONFIGURATION: Uuid = Uuid::from_u128(0xe95db9fe_251d_470a_a062_fa1922dfa9a8);
pub const PWM_CONTROL: Uuid = Uuid::from_u128(0xe95dd822_251d_470a_a062_fa1922dfa9a8);

/// LED Service
pub const LED_SERVICE: Uuid = Uuid::from_u128(0xe95dd91d_251d_470a_a062_fa1922dfa9a8);
pub const LED_MATRIX_STATE: Uuid = Uuid::from_u128(0xe95d7b77_251d_470a_a062_fa1922dfa9a8);
pub const LED_TEXT: Uuid = Uuid::from_u128(0xe95d93ee_251d_470a_a062_fa1922dfa9a8);
pub const SCROLLING_DELAY: Uuid = Uuid::from_u128(0xe95d0d2d_251d_470a_a062_fa1922dfa9a8);

/// Magnetometer Service
pub const MAGNETOMETER_SERVICE: Uuid = Uuid::from_u128(0xe95df2d8_251d_470a_a062_fa1922dfa9a8);
pub const MAGNETOMETER_DATA: Uuid = Uuid::from_u128(0xe95dfb11_251d_470a_a062_fa1922dfa9a8);
pub const MAGNETOMETER_PERIOD: Uuid = Uuid::from_u128(0xe95d386c_251d_470a_a062_fa1922dfa9a8);
pub const MAGNETOMETER_BEARING: Uuid = Uuid::from_u128(0xe95d9715_251d_470a_a062_fa1922dfa9a8);
pub const MAGNETOMETER_CALIBRATION: Uuid =
    Uuid::from_u128(0xe95db358_251d_470a_a062_fa1922dfa9a8);

/// Accelerometer Service
pub const ACCELEROMETER_SERVICE: Uuid = Uuid::from_u128(0xe95d0753_251d_470a_a062_fa1922dfa9a8);
pub const ACCELEROMETER_DATA: Uuid = Uuid::from_u128(0xe95dca4b_251d_470a_a062_fa1922dfa9a8);
pub const ACCELEROMETER_PERIOD: Uuid = Uuid::from_u128(0xe95dfb24_251d_470a_a062_fa1922dfa9a8);

/// Maximum number of characters the LED text characteristic accepts
pub const LED_TEXT_MAX_LEN: usize = 20;

/// Number of rows (and bytes) in the LED matrix state
pub const LED_ROWS: usize = 5;

/// Highest duty value accepted by the PWM control characteristic
pub const PWM_MAX_VALUE: u16 = 1024;

/// Pins addressable through the configuration masks
pub const PIN_COUNT: u8 = 20;

/// Known services and the characteristics to discover for each, in
/// discovery order.
pub const PROFILE: &[(ServiceId, Uuid, &[Uuid])] = &[
    (
        ServiceId::DeviceInformation,
        DEVICE_INFORMATION_SERVICE,
        &[
            MODEL_NUMBER,
            SERIAL_NUMBER,
            FIRMWARE_REVISION,
            HARDWARE_REVISION,
            MANUFACTURER_NAME,
        ],
    ),
    (
        ServiceId::Temperature,
        TEMPERATURE_SERVICE,
        &[TEMPERATURE_DATA, TEMPERATURE_PERIOD],
    ),
    (
        ServiceId::Button,
        BUTTON_SERVICE,
        &[BUTTON_A_STATE, BUTTON_B_STATE],
    ),
    (
        ServiceId::IoPin,
        IO_PIN_SERVICE,
        &[
            PIN_DATA,
            PIN_AD_CONFIGURATION,
            PIN_IO_CONFIGURATION,
            PWM_CONTROL,
        ],
    ),
    (
        ServiceId::Led,
        LED_SERVICE,
        &[LED_MATRIX_STATE, LED_TEXT, SCROLLING_DELAY],
    ),
    (
        ServiceId::Magnetometer,
        MAGNETOMETER_SERVICE,
        &[
            MAGNETOMETER_DATA,
            MAGNETOMETER_PERIOD,
            MAGNETOMETER_BEARING,
            MAGNETOMETER_CALIBRATION,
        ],
    ),
    (
        ServiceId::Accelerometer,
        ACCELEROMETER_SERVICE,
        &[ACCELEROMETER_DATA, ACCELEROMETER_PERIOD],
    ),
];

/// Every service UUID of the profile, used as the service discovery filter.
pub fn service_uuids() -> Vec<Uuid> {
    PROFILE.iter().map(|(_, uuid, _)| *uuid).collect()
}

pub fn service_id(service: &Uuid) -> Option<ServiceId> {
    PROFILE
        .iter()
        .find(|(_, uuid, _)| uuid == service)
        .map(|(id, _, _)| *id)
}

pub fn service_uuid(id: ServiceId) -> Uuid {
    PROFILE
        .iter()
        .find(|(service, _, _)| *service == id)
        .map(|(_, uuid, _)| *uuid)
        .unwrap_or(Uuid::nil())
}

/// Characteristics to discover for a service; empty for unknown services.
pub fn characteristic_uuids(service: &Uuid) -> &'static [Uuid] {
    PROFILE
        .iter()
        .find(|(_, uuid, _)| uuid == service)
        .map(|(_, _, chars)| *chars)
        .unwrap_or(&[])
}

impl NotificationStream {
    pub fn characteristic(self) -> Uuid {
        match self {
            Self::ButtonA => BUTTON_A_STATE,
            Self::ButtonB => BUTTON_B_STATE,
            Self::Accelerometer => ACCELEROMETER_DATA,
            Self::Magnetometer => MAGNETOMETER_DATA,
            Self::PinData => PIN_DATA,
        }
    }

    pub fn service(self) -> ServiceId {
        match self {
            Self::ButtonA | Self::ButtonB => ServiceId::Button,
            Self::Accelerometer => ServiceId::Accelerometer,
            Self::Magnetometer => ServiceId::Magnetometer,
            Self::PinData => ServiceId::IoPin,
        }
    }

    pub fn from_characteristic(uuid: &Uuid) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stream| stream.characteristic() == *uuid)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// LED matrix state: one byte per row, bit 4 is the leftmost column.
pub fn encode_led_matrix(rows: &[u8; LED_ROWS]) -> Vec<u8> {
    rows.iter().map(|row| row & 0x1f).collect()
}

/// Keep ASCII characters only and cut to the firmware's text limit.
pub fn encode_led_text(text: &str) -> Vec<u8> {
    text.chars()
        .filter(char::is_ascii)
        .take(LED_TEXT_MAX_LEN)
        .map(|c| c as u8)
        .collect()
}

/// Periods and the scrolling delay are plain `u16` milliseconds.
pub fn encode_u16(value: u16) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Build the 32-bit pin mask used by both configuration characteristics.
/// Pins outside `0..20` are ignored.
pub fn encode_pin_mask(pins: &[u8]) -> Vec<u8> {
    let mask = pins
        .iter()
        .filter(|pin| **pin < PIN_COUNT)
        .fold(0u32, |mask, pin| mask | (1u32 << *pin));
    mask.to_le_bytes().to_vec()
}

/// Digital output as `(pin, 0|1)` pairs.
pub fn encode_digital_output(outputs: &[(u8, bool)]) -> Vec<u8> {
    outputs
        .iter()
        .flat_map(|(pin, value)| [*pin, u8::from(*value)])
        .collect()
}

/// PWM control records: `pin:u8, value:u16, period:u32`.
pub fn encode_pwm_output(outputs: &[PwmOutput]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(outputs.len() * 7);
    for output in outputs {
        bytes.push(output.pin);
        bytes.extend_from_slice(&output.value.min(PWM_MAX_VALUE).to_le_bytes());
        bytes.extend_from_slice(&output.period_us.to_le_bytes());
    }
    bytes
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode_u16(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [lo, hi] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

pub fn decode_pin_mask(bytes: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Pin numbers whose bit is set in a configuration mask.
pub fn pins_in_mask(mask: u32) -> Vec<u8> {
    (0..PIN_COUNT).filter(|pin| mask & (1u32 << pin) != 0).collect()
}

pub fn decode_led_matrix(bytes: &[u8]) -> Option<[u8; LED_ROWS]> {
    let rows: [u8; LED_ROWS] = bytes.try_into().ok()?;
    Some(rows.map(|row| row & 0x1f))
}

pub fn decode_button(bytes: &[u8]) -> Option<ButtonState> {
    match bytes {
        [value] => ButtonState::from_byte(*value),
        _ => None,
    }
}

pub fn decode_vector(bytes: &[u8]) -> Option<Vector3> {
    if bytes.len() != 6 {
        return None;
    }
    Some(Vector3 {
        x: i16::from_le_bytes([bytes[0], bytes[1]]),
        y: i16::from_le_bytes([bytes[2], bytes[3]]),
        z: i16::from_le_bytes([bytes[4], bytes[5]]),
    })
}

/// Pin data is a sequence of `(pin, value)` pairs; odd lengths are invalid.
pub fn decode_pin_data(bytes: &[u8]) -> Option<Vec<PinValue>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| PinValue {
                pin: pair[0],
                value: pair[1],
            })
            .collect(),
    )
}

/// Decode an unsolicited value update. Malformed payloads yield `None`.
pub fn decode_notification(stream: NotificationStream, bytes: &[u8]) -> Option<Notification> {
    trace!("{:?} payload: {:02X?}", stream, bytes);
    match stream {
        NotificationStream::ButtonA => decode_button(bytes).map(Notification::ButtonA),
        NotificationStream::ButtonB => decode_button(bytes).map(Notification::ButtonB),
        NotificationStream::Accelerometer => decode_vector(bytes).map(Notification::Accelerometer),
        NotificationStream::Magnetometer => decode_vector(bytes).map(Notification::Magnetometer),
        NotificationStream::PinData => decode_pin_data(bytes).map(Notification::PinData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lookup() {
        assert_eq!(service_id(&LED_SERVICE), Some(ServiceId::Led));
        assert_eq!(service_uuid(ServiceId::Button), BUTTON_SERVICE);
        assert_eq!(service_id(&Uuid::nil()), None);
        assert_eq!(characteristic_uuids(&BUTTON_SERVICE).len(), 2);
        assert!(characteristic_uuids(&Uuid::nil()).is_empty());
        assert_eq!(service_uuids().len(), 7);
    }

    #[test]
    fn test_uuid_text_form() {
        assert_eq!(
            ACCELEROMETER_DATA.to_string(),
            "e95dca4b-251d-470a-a062-fa1922dfa9a8"
        );
    }

    #[test]
    fn test_stream_mapping() {
        assert_eq!(
            NotificationStream::from_characteristic(&PIN_DATA),
            Some(NotificationStream::PinData)
        );
        assert_eq!(NotificationStream::from_characteristic(&LED_TEXT), None);
        assert_eq!(NotificationStream::ButtonB.service(), ServiceId::Button);
    }

    #[test]
    fn test_input_pin_mask() {
        let bytes = encode_pin_mask(&[0, 1, 2, 19]);
        assert_eq!(bytes, vec![0x07, 0x00, 0x08, 0x00]);
        let mask = decode_pin_mask(&bytes).unwrap();
        assert_eq!(mask, 0x0008_0007);
        assert_eq!(pins_in_mask(mask), vec![0, 1, 2, 19]);
    }

    #[test]
    fn test_pin_mask_ignores_out_of_range_pins() {
        assert_eq!(encode_pin_mask(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_pin_mask(&[20, 31, 200]), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_pwm_encoding() {
        let bytes = encode_pwm_output(&[PwmOutput {
            pin: 0,
            value: 512,
            period_us: 20000,
        }]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x02, 0x20, 0x4e, 0x00, 0x00]);
    }

    #[test]
    fn test_pwm_value_is_clamped() {
        let bytes = encode_pwm_output(&[PwmOutput {
            pin: 1,
            value: 5000,
            period_us: 1,
        }]);
        assert_eq!(&bytes[1..3], &[0x00, 0x04]);
    }

    #[test]
    fn test_digital_output_encoding() {
        assert_eq!(
            encode_digital_output(&[(0, true), (8, false)]),
            vec![0, 1, 8, 0]
        );
    }

    #[test]
    fn test_led_text_truncation() {
        let bytes = encode_led_text("Hello, World!!!!!!!!!!");
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes, b"Hello, World!!!!!!!!".to_vec());
    }

    #[test]
    fn test_led_text_drops_non_ascii() {
        assert_eq!(encode_led_text("héllo ✓"), b"hllo ".to_vec());
    }

    #[test]
    fn test_led_matrix_masks_columns() {
        let bytes = encode_led_matrix(&[0xff, 0x10, 0x01, 0x00, 0x1f]);
        assert_eq!(bytes, vec![0x1f, 0x10, 0x01, 0x00, 0x1f]);
        assert_eq!(decode_led_matrix(&bytes), Some([0x1f, 0x10, 0x01, 0x00, 0x1f]));
        assert_eq!(decode_led_matrix(&bytes[..4]), None);
    }

    #[test]
    fn test_scroll_delay_encoding() {
        assert_eq!(encode_u16(150), vec![0x96, 0x00]);
        assert_eq!(decode_u16(&[0x96, 0x00]), Some(150));
        assert_eq!(decode_u16(&[0x96]), None);
    }

    #[test]
    fn test_accelerometer_notification() {
        let mut bytes = Vec::new();
        for v in [1000i16, -500, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let notification = decode_notification(NotificationStream::Accelerometer, &bytes);
        let Some(Notification::Accelerometer(vector)) = notification else {
            panic!("expected accelerometer notification");
        };
        assert_eq!(vector.scaled(), [1.0, -0.5, 0.0]);
    }

    #[test]
    fn test_malformed_notifications_are_discarded() {
        assert_eq!(decode_notification(NotificationStream::PinData, &[1, 2, 3]), None);
        assert_eq!(decode_notification(NotificationStream::ButtonA, &[7]), None);
        assert_eq!(decode_notification(NotificationStream::ButtonA, &[1, 0]), None);
        assert_eq!(
            decode_notification(NotificationStream::Magnetometer, &[0; 4]),
            None
        );
    }

    #[test]
    fn test_pin_data_notification() {
        assert_eq!(
            decode_notification(NotificationStream::PinData, &[0, 255, 3, 1]),
            Some(Notification::PinData(vec![
                PinValue { pin: 0, value: 255 },
                PinValue { pin: 3, value: 1 },
            ]))
        );
        assert_eq!(
            decode_notification(NotificationStream::PinData, &[]),
            Some(Notification::PinData(vec![]))
        );
    }
}
