//! Windows replay sinks: OS synthetic input and window-message injection.

use windows_sys::Win32::Foundation::{LPARAM, WPARAM};
use windows_sys::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS,
    KEYEVENTF_EXTENDEDKEY, KEYEVENTF_KEYUP, KEYEVENTF_SCANCODE, MOUSEEVENTF_ABSOLUTE,
    MOUSEEVENTF_HWHEEL, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN,
    MOUSEEVENTF_MIDDLEUP, MOUSEEVENTF_MOVE, MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP,
    MOUSEEVENTF_WHEEL, MOUSEEVENTF_XDOWN, MOUSEEVENTF_XUP, MOUSEINPUT, XBUTTON1, XBUTTON2,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    GetForegroundWindow, PostMessageW, WHEEL_DELTA, WM_LBUTTONDOWN, WM_LBUTTONUP, WM_MOUSEMOVE,
    WM_MOUSEWHEEL, WM_RBUTTONDOWN, WM_RBUTTONUP,
};

use crate::replay::{KeyboardSink, MouseSink, ScanCode, LOGICAL_MAX};

/// Normalized absolute range of synthetic input.
const ABSOLUTE_MAX: i32 = 65_535;

fn scale_absolute(value: u16) -> i32 {
    value as i32 * ABSOLUTE_MAX / LOGICAL_MAX as i32
}

fn send_keyboard(scan: u16, flags: KEYBD_EVENT_FLAGS) {
    let mut input = INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: 0,
                wScan: scan,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    };
    unsafe {
        SendInput(1, &mut input, std::mem::size_of::<INPUT>() as i32);
    }
}

fn send_mouse(mi: MOUSEINPUT) {
    let mut input = INPUT {
        r#type: INPUT_MOUSE,
        Anonymous: INPUT_0 { mi },
    };
    unsafe {
        SendInput(1, &mut input, std::mem::size_of::<INPUT>() as i32);
    }
}

fn mouse_input(dx: i32, dy: i32, data: i32, flags: u32) -> MOUSEINPUT {
    MOUSEINPUT {
        dx,
        dy,
        mouseData: data,
        dwFlags: flags,
        time: 0,
        dwExtraInfo: 0,
    }
}

/// Keyboard via `SendInput` scan-code events.
pub struct SendInputKeyboard;

impl SendInputKeyboard {
    pub fn new() -> Self {
        Self
    }
}

impl KeyboardSink for SendInputKeyboard {
    fn key(&mut self, scan: ScanCode, pressed: bool) {
        let mut flags: KEYBD_EVENT_FLAGS = KEYEVENTF_SCANCODE;
        if scan.extended {
            flags |= KEYEVENTF_EXTENDEDKEY;
        }
        if !pressed {
            flags |= KEYEVENTF_KEYUP;
        }
        send_keyboard(scan.code as u16, flags);
    }
}

/// Mouse via `SendInput`, absolute and relative.
pub struct SendInputMouse;

impl SendInputMouse {
    pub fn new() -> Self {
        Self
    }

    fn button_flags(button: u8, pressed: bool) -> (u32, i32) {
        match button {
            1 => (
                if pressed {
                    MOUSEEVENTF_LEFTDOWN
                } else {
                    MOUSEEVENTF_LEFTUP
                },
                0,
            ),
            2 => (
                if pressed {
                    MOUSEEVENTF_MIDDLEDOWN
                } else {
                    MOUSEEVENTF_MIDDLEUP
                },
                0,
            ),
            3 => (
                if pressed {
                    MOUSEEVENTF_RIGHTDOWN
                } else {
                    MOUSEEVENTF_RIGHTUP
                },
                0,
            ),
            4 => (
                if pressed { MOUSEEVENTF_XDOWN } else { MOUSEEVENTF_XUP },
                XBUTTON1 as i32,
            ),
            _ => (
                if pressed { MOUSEEVENTF_XDOWN } else { MOUSEEVENTF_XUP },
                XBUTTON2 as i32,
            ),
        }
    }
}

impl MouseSink for SendInputMouse {
    fn move_absolute(&mut self, x: u16, y: u16) {
        send_mouse(mouse_input(
            scale_absolute(x),
            scale_absolute(y),
            0,
            MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE,
        ));
    }

    fn button_absolute(&mut self, button: u8, pressed: bool, x: u16, y: u16) {
        let (flags, data) = Self::button_flags(button, pressed);
        send_mouse(mouse_input(
            scale_absolute(x),
            scale_absolute(y),
            data,
            flags | MOUSEEVENTF_ABSOLUTE,
        ));
    }

    fn move_relative(&mut self, dx: i8, dy: i8) {
        send_mouse(mouse_input(dx as i32, dy as i32, 0, MOUSEEVENTF_MOVE));
    }

    fn button_relative(&mut self, button: u8, pressed: bool) {
        let (flags, data) = Self::button_flags(button, pressed);
        send_mouse(mouse_input(0, 0, data, flags));
    }

    fn wheel(&mut self, dx: i16, dy: i16) {
        if dx != 0 {
            send_mouse(mouse_input(
                0,
                0,
                WHEEL_DELTA as i32 * dx as i32,
                MOUSEEVENTF_HWHEEL,
            ));
        }
        if dy != 0 {
            send_mouse(mouse_input(
                0,
                0,
                WHEEL_DELTA as i32 * dy as i32,
                MOUSEEVENTF_WHEEL,
            ));
        }
    }
}

/// Mouse injection by posting window messages at the foreground window.
/// Survives games that clip or hide the cursor but only understands the
/// basic button set.
pub struct WindowMessageMouse {
    hwnd: isize,
    last: (u16, u16),
}

impl WindowMessageMouse {
    pub fn new() -> Self {
        Self {
            hwnd: unsafe { GetForegroundWindow() as isize },
            last: (0, 0),
        }
    }

    fn post(&self, message: u32, wparam: WPARAM, x: u16, y: u16) {
        let lparam: LPARAM = ((y as isize) << 16 | x as isize) as LPARAM;
        unsafe {
            PostMessageW(self.hwnd as _, message, wparam, lparam);
        }
    }
}

impl MouseSink for WindowMessageMouse {
    fn move_absolute(&mut self, x: u16, y: u16) {
        self.last = (x, y);
        self.post(WM_MOUSEMOVE, 0, x, y);
    }

    fn button_absolute(&mut self, button: u8, pressed: bool, x: u16, y: u16) {
        self.last = (x, y);
        let message = match (button, pressed) {
            (1, true) => WM_LBUTTONDOWN,
            (1, false) => WM_LBUTTONUP,
            (3, true) => WM_RBUTTONDOWN,
            (3, false) => WM_RBUTTONUP,
            _ => return,
        };
        self.post(message, 0, x, y);
    }

    fn move_relative(&mut self, _dx: i8, _dy: i8) {
        // Window messages carry absolute client coordinates only.
    }

    fn button_relative(&mut self, button: u8, pressed: bool) {
        let (x, y) = self.last;
        self.button_absolute(button, pressed, x, y);
    }

    fn wheel(&mut self, _dx: i16, dy: i16) {
        let (x, y) = self.last;
        let wparam = ((WHEEL_DELTA as i32 * dy as i32) << 16) as WPARAM;
        self.post(WM_MOUSEWHEEL, wparam, x, y);
    }
}
