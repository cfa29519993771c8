//! Persistent virtual gamepad state.
//!
//! Axis and button events mutate this struct; every event causes the full
//! state to be re-sent to the virtual device.

/// Button bit assignments of the virtual controller report.
pub mod buttons {
    pub const DPAD_UP: u16 = 0x0001;
    pub const DPAD_DOWN: u16 = 0x0002;
    pub const DPAD_LEFT: u16 = 0x0004;
    pub const DPAD_RIGHT: u16 = 0x0008;
    pub const START: u16 = 0x0010;
    pub const BACK: u16 = 0x0020;
    pub const LEFT_THUMB: u16 = 0x0040;
    pub const RIGHT_THUMB: u16 = 0x0080;
    pub const LEFT_SHOULDER: u16 = 0x0100;
    pub const RIGHT_SHOULDER: u16 = 0x0200;
    pub const GUIDE: u16 = 0x0400;
    pub const A: u16 = 0x1000;
    pub const B: u16 = 0x2000;
    pub const X: u16 = 0x4000;
    pub const Y: u16 = 0x8000;
}

/// Wire button index -> report bit.
pub const fn button_mask(button: u8) -> u16 {
    match button {
        0 => buttons::A,
        1 => buttons::B,
        2 => buttons::X,
        3 => buttons::Y,
        4 => buttons::BACK,
        5 => buttons::GUIDE,
        6 => buttons::START,
        7 => buttons::LEFT_THUMB,
        8 => buttons::RIGHT_THUMB,
        9 => buttons::LEFT_SHOULDER,
        10 => buttons::RIGHT_SHOULDER,
        11 => buttons::DPAD_UP,
        12 => buttons::DPAD_DOWN,
        13 => buttons::DPAD_LEFT,
        14 => buttons::DPAD_RIGHT,
        _ => 0,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PadState {
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub thumb_lx: i16,
    pub thumb_ly: i16,
    pub thumb_rx: i16,
    pub thumb_ry: i16,
}

impl PadState {
    /// Applies one axis sample. Axes map to (Lx, Ly, Rx, Ry, LT, RT); the
    /// Y axes are inverted and triggers downshift to the 8-bit range.
    pub fn apply_axis(&mut self, axis: u8, value: u16) {
        match axis {
            0 => self.thumb_lx = value as i16,
            1 => self.thumb_ly = 0xFFFFu16.wrapping_sub(value) as i16,
            2 => self.thumb_rx = value as i16,
            3 => self.thumb_ry = 0xFFFFu16.wrapping_sub(value) as i16,
            4 => self.left_trigger = (value >> 7) as u8,
            5 => self.right_trigger = (value >> 7) as u8,
            _ => {}
        }
    }

    pub fn apply_button(&mut self, button: u8, pressed: bool) {
        let mask = button_mask(button);
        if pressed {
            self.buttons |= mask;
        } else {
            self.buttons &= !mask;
        }
    }

    /// Hat values 1-8 walk clockwise from up; 0 releases the pad.
    pub fn apply_hat(&mut self, hat: u8) {
        use buttons::{DPAD_DOWN, DPAD_LEFT, DPAD_RIGHT, DPAD_UP};
        self.buttons &= !(DPAD_UP | DPAD_DOWN | DPAD_LEFT | DPAD_RIGHT);
        let bits = match hat {
            1 => DPAD_UP,
            2 => DPAD_UP | DPAD_RIGHT,
            3 => DPAD_RIGHT,
            4 => DPAD_DOWN | DPAD_RIGHT,
            5 => DPAD_DOWN,
            6 => DPAD_DOWN | DPAD_LEFT,
            7 => DPAD_LEFT,
            8 => DPAD_UP | DPAD_LEFT,
            _ => 0,
        };
        self.buttons |= bits;
    }
}
