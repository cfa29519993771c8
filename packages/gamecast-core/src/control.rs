//! Control protocol: the compact binary input-event stream sent by clients.
//!
//! Every message starts with `{ version: u8, type: u8, timestamp: u32 BE }`
//! followed by a fixed-size, type-specific body. A message whose length does
//! not match the expected length for its type is dropped (with a log) and
//! never partially applied. Multi-byte fields arrive big-endian.

use bytes::Buf;

use crate::error::ControlError;

/// Control message version.
pub const CONTROL_VERSION: u8 = 0;

/// Common prefix length: version, type, timestamp.
pub const CONTROL_BASE_LEN: usize = 6;

/// Control message type. Wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    Keyboard = 0,
    KeyboardVk = 1,
    AbsoluteMouseMove = 10,
    AbsoluteMouseButton = 11,
    AbsoluteMouseWheel = 12,
    RelativeMouseMove = 13,
    RelativeMouseButton = 14,
    RelativeMouseWheel = 15,
    GamepadAxis = 20,
    GamepadButton = 21,
    JoystickAxis = 30,
    JoystickButton = 32,
    JoystickHat = 33,
    Ping = 40,
    Pong = 41,
}

impl ControlType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Keyboard),
            1 => Some(Self::KeyboardVk),
            10 => Some(Self::AbsoluteMouseMove),
            11 => Some(Self::AbsoluteMouseButton),
            12 => Some(Self::AbsoluteMouseWheel),
            13 => Some(Self::RelativeMouseMove),
            14 => Some(Self::RelativeMouseButton),
            15 => Some(Self::RelativeMouseWheel),
            20 => Some(Self::GamepadAxis),
            21 => Some(Self::GamepadButton),
            30 => Some(Self::JoystickAxis),
            32 => Some(Self::JoystickButton),
            33 => Some(Self::JoystickHat),
            40 => Some(Self::Ping),
            41 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Expected total message length (base + body) for this type.
    pub const fn expected_len(self) -> usize {
        CONTROL_BASE_LEN
            + match self {
                Self::Keyboard | Self::KeyboardVk => 3, // key_code u16, state u8
                Self::AbsoluteMouseMove => 4,           // x u16, y u16
                Self::AbsoluteMouseButton => 6,         // button, state, x u16, y u16
                Self::AbsoluteMouseWheel => 4,          // x i16, y i16 (signed deltas)
                Self::RelativeMouseMove => 2,           // x i8, y i8
                Self::RelativeMouseButton => 2,         // button, state
                Self::RelativeMouseWheel => 2,          // x i8, y i8
                Self::GamepadAxis | Self::JoystickAxis => 4, // which, axis, value u16
                Self::GamepadButton | Self::JoystickButton => 3, // which, button, state
                Self::JoystickHat => 2,                 // which, hat
                Self::Ping | Self::Pong => 0,
            }
    }
}

/// Press/release state of a key or button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ButtonState {
    Released = 0,
    Pressed = 1,
}

impl ButtonState {
    fn from_u8(value: u8) -> Result<Self, ControlError> {
        match value {
            0 => Ok(Self::Released),
            1 => Ok(Self::Pressed),
            other => Err(ControlError::BadButtonState(other)),
        }
    }

    pub fn is_pressed(self) -> bool {
        matches!(self, Self::Pressed)
    }
}

/// A fully validated control event, host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Scan-code keyboard event (source scan code space).
    Keyboard { key_code: u16, state: ButtonState },
    /// Virtual-key keyboard event.
    KeyboardVk { key_code: u16, state: ButtonState },
    /// Absolute move, coordinates normalized to the logical range.
    AbsoluteMouseMove { x: u16, y: u16 },
    AbsoluteMouseButton {
        button: u8,
        state: ButtonState,
        x: u16,
        y: u16,
    },
    AbsoluteMouseWheel { x: i16, y: i16 },
    RelativeMouseMove { x: i8, y: i8 },
    RelativeMouseButton { button: u8, state: ButtonState },
    RelativeMouseWheel { x: i8, y: i8 },
    GamepadAxis { which: u8, axis: u8, value: u16 },
    GamepadButton {
        which: u8,
        button: u8,
        state: ButtonState,
    },
    JoystickHat { which: u8, hat: u8 },
    Ping,
    Pong,
}

/// Decoded message: header timestamp plus the typed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub timestamp: u32,
    pub event: ControlEvent,
}

/// Decodes and validates one control message.
///
/// The whole buffer must be exactly one message; a length mismatch for the
/// resolved type is an error so the caller can drop the message unapplied.
pub fn decode(mut buf: &[u8]) -> Result<ControlMessage, ControlError> {
    if buf.len() < CONTROL_BASE_LEN {
        return Err(ControlError::Truncated(buf.len()));
    }
    let _version = buf.get_u8();
    let raw_type = buf.get_u8();
    let timestamp = buf.get_u32();
    let control_type =
        ControlType::from_u8(raw_type).ok_or(ControlError::UnknownType(raw_type))?;

    let total = CONTROL_BASE_LEN + buf.remaining();
    let expected = control_type.expected_len();
    if total != expected {
        return Err(ControlError::LengthMismatch {
            control_type,
            expected,
            actual: total,
        });
    }

    let event = match control_type {
        ControlType::Keyboard => ControlEvent::Keyboard {
            key_code: buf.get_u16(),
            state: ButtonState::from_u8(buf.get_u8())?,
        },
        ControlType::KeyboardVk => ControlEvent::KeyboardVk {
            key_code: buf.get_u16(),
            state: ButtonState::from_u8(buf.get_u8())?,
        },
        ControlType::AbsoluteMouseMove => ControlEvent::AbsoluteMouseMove {
            x: buf.get_u16(),
            y: buf.get_u16(),
        },
        ControlType::AbsoluteMouseButton => ControlEvent::AbsoluteMouseButton {
            button: buf.get_u8(),
            state: ButtonState::from_u8(buf.get_u8())?,
            x: buf.get_u16(),
            y: buf.get_u16(),
        },
        ControlType::AbsoluteMouseWheel => ControlEvent::AbsoluteMouseWheel {
            x: buf.get_i16(),
            y: buf.get_i16(),
        },
        ControlType::RelativeMouseMove => ControlEvent::RelativeMouseMove {
            x: buf.get_i8(),
            y: buf.get_i8(),
        },
        ControlType::RelativeMouseButton => ControlEvent::RelativeMouseButton {
            button: buf.get_u8(),
            state: ButtonState::from_u8(buf.get_u8())?,
        },
        ControlType::RelativeMouseWheel => ControlEvent::RelativeMouseWheel {
            x: buf.get_i8(),
            y: buf.get_i8(),
        },
        ControlType::GamepadAxis | ControlType::JoystickAxis => ControlEvent::GamepadAxis {
            which: buf.get_u8(),
            axis: buf.get_u8(),
            value: buf.get_u16(),
        },
        ControlType::GamepadButton | ControlType::JoystickButton => ControlEvent::GamepadButton {
            which: buf.get_u8(),
            button: buf.get_u8(),
            state: ButtonState::from_u8(buf.get_u8())?,
        },
        ControlType::JoystickHat => ControlEvent::JoystickHat {
            which: buf.get_u8(),
            hat: buf.get_u8(),
        },
        ControlType::Ping => ControlEvent::Ping,
        ControlType::Pong => ControlEvent::Pong,
    };

    Ok(ControlMessage { timestamp, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn message(control_type: ControlType, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(CONTROL_VERSION);
        buf.put_u8(control_type as u8);
        buf.put_u32(42);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn keyboard_decodes_big_endian_key_code() {
        let buf = message(ControlType::Keyboard, &[0x00, 0x5B, 1]);
        let msg = decode(&buf).unwrap();
        assert_eq!(msg.timestamp, 42);
        assert_eq!(
            msg.event,
            ControlEvent::Keyboard {
                key_code: 0x5B,
                state: ButtonState::Pressed
            }
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        // GamepadAxis body is 4 bytes; send 3.
        let buf = message(ControlType::GamepadAxis, &[0, 1, 2]);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(
            err,
            ControlError::LengthMismatch {
                control_type: ControlType::GamepadAxis,
                expected: 10,
                actual: 9,
            }
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let buf = message(ControlType::Ping, &[]);
        let mut raw = buf.to_vec();
        raw[1] = 99;
        assert!(matches!(decode(&raw), Err(ControlError::UnknownType(99))));
    }

    #[test]
    fn gamepad_axis_value_is_big_endian() {
        let buf = message(ControlType::GamepadAxis, &[0, 1, 0x80, 0x00]);
        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg.event,
            ControlEvent::GamepadAxis {
                which: 0,
                axis: 1,
                value: 0x8000
            }
        );
    }

    #[test]
    fn relative_move_deltas_are_signed() {
        let buf = message(ControlType::RelativeMouseMove, &[0xFF, 0x05]);
        let msg = decode(&buf).unwrap();
        assert_eq!(msg.event, ControlEvent::RelativeMouseMove { x: -1, y: 5 });
    }

    #[test]
    fn joystick_aliases_map_to_gamepad_events() {
        let axis = message(ControlType::JoystickAxis, &[1, 0, 0x7F, 0xFF]);
        assert!(matches!(
            decode(&axis).unwrap().event,
            ControlEvent::GamepadAxis { which: 1, axis: 0, value: 0x7FFF }
        ));
        let button = message(ControlType::JoystickButton, &[1, 3, 0]);
        assert!(matches!(
            decode(&button).unwrap().event,
            ControlEvent::GamepadButton { which: 1, button: 3, state: ButtonState::Released }
        ));
    }
}
