//! Input replay: routes validated control events to a backend per input
//! class and applies the disabled-keys policy.
//!
//! All replay is fire-and-forget: the router never confirms that the host
//! accepted a synthesized event.

mod gamepad;
mod scancode;
#[cfg(windows)]
mod windows;

pub use gamepad::PadState;
pub use scancode::{from_sdl, from_virtual_key, ScanCode};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{GamepadBackendKind, KeyboardBackendKind, MouseBackendKind, ReplayConfig};
use crate::control::ControlEvent;

/// Absolute mouse coordinates arrive normalized to `[0, LOGICAL_MAX]`.
pub const LOGICAL_MAX: u16 = 0x7FFF;

/// Sink for keyboard events in host scan-code space.
pub trait KeyboardSink: Send {
    fn key(&mut self, scan: ScanCode, pressed: bool);
}

/// Sink for mouse events (absolute and relative).
pub trait MouseSink: Send {
    fn move_absolute(&mut self, x: u16, y: u16);
    fn button_absolute(&mut self, button: u8, pressed: bool, x: u16, y: u16);
    fn move_relative(&mut self, dx: i8, dy: i8);
    fn button_relative(&mut self, button: u8, pressed: bool);
    fn wheel(&mut self, dx: i16, dy: i16);
}

/// Sink for the virtual game controller. Each event re-sends the full
/// state, so a lost report never leaves a stale axis behind.
pub trait PadSink: Send {
    fn set_state(&mut self, which: u8, state: &PadState);
}

/// What happened to one replayed event. Logged, and observable for tests;
/// callers otherwise ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Replayed,
    /// Scan code is in the disabled set.
    DroppedDisabled(u8),
    /// No mapping for the source key.
    DroppedUnmapped,
    /// The class has no backend.
    NoBackend,
    /// Keep-alive or otherwise non-replayable event.
    Ignored,
}

struct Backends {
    initialized: bool,
    keyboard: Option<Box<dyn KeyboardSink>>,
    mouse: Option<Box<dyn MouseSink>>,
    pad: Option<Box<dyn PadSink>>,
    pad_state: PadState,
}

pub struct ReplayRouter {
    config: ReplayConfig,
    disabled: [bool; 256],
    backends: Mutex<Backends>,
}

impl ReplayRouter {
    pub fn new(config: ReplayConfig) -> Arc<Self> {
        let mut disabled = [false; 256];
        for &scan in &config.disable_keys {
            disabled[scan as usize] = true;
        }
        Arc::new(Self {
            config,
            disabled,
            backends: Mutex::new(Backends {
                initialized: false,
                keyboard: None,
                mouse: None,
                pad: None,
                pad_state: PadState::default(),
            }),
        })
    }

    /// Router with every backend off; used where replay is not wired up.
    pub fn disabled() -> Arc<Self> {
        Self::new(ReplayConfig {
            keyboard: KeyboardBackendKind::None,
            mouse: MouseBackendKind::None,
            gamepad: GamepadBackendKind::None,
            disable_keys: Vec::new(),
        })
    }

    /// Builds the configured backends. Idempotent; called on each
    /// authorization.
    pub fn initialize(&self) {
        let mut backends = self.backends.lock();
        if backends.initialized {
            return;
        }
        backends.initialized = true;
        backends.keyboard = make_keyboard(self.config.keyboard);
        backends.mouse = make_mouse(self.config.mouse);
        backends.pad = make_pad(self.config.gamepad);
        log::info!(
            "[Replay] Backends: keyboard {}, mouse {}, gamepad {}",
            backends.keyboard.is_some(),
            backends.mouse.is_some(),
            backends.pad.is_some(),
        );
    }

    #[cfg(test)]
    fn install_for_tests(
        &self,
        keyboard: Option<Box<dyn KeyboardSink>>,
        mouse: Option<Box<dyn MouseSink>>,
        pad: Option<Box<dyn PadSink>>,
    ) {
        let mut backends = self.backends.lock();
        backends.initialized = true;
        backends.keyboard = keyboard;
        backends.mouse = mouse;
        backends.pad = pad;
    }

    /// Dispatches one validated control event.
    pub fn replay(&self, event: &ControlEvent) -> ReplayOutcome {
        let mut backends = self.backends.lock();
        match *event {
            ControlEvent::Keyboard { key_code, state } => {
                self.replay_key(&mut backends, from_sdl(key_code), state.is_pressed())
            }
            ControlEvent::KeyboardVk { key_code, state } => {
                self.replay_key(&mut backends, from_virtual_key(key_code), state.is_pressed())
            }
            ControlEvent::AbsoluteMouseMove { x, y } => match backends.mouse.as_mut() {
                Some(mouse) => {
                    mouse.move_absolute(x, y);
                    ReplayOutcome::Replayed
                }
                None => ReplayOutcome::NoBackend,
            },
            ControlEvent::AbsoluteMouseButton {
                button,
                state,
                x,
                y,
            } => match backends.mouse.as_mut() {
                Some(mouse) => {
                    mouse.button_absolute(button, state.is_pressed(), x, y);
                    ReplayOutcome::Replayed
                }
                None => ReplayOutcome::NoBackend,
            },
            ControlEvent::AbsoluteMouseWheel { x, y } => match backends.mouse.as_mut() {
                Some(mouse) => {
                    mouse.wheel(x, y);
                    ReplayOutcome::Replayed
                }
                None => ReplayOutcome::NoBackend,
            },
            ControlEvent::RelativeMouseMove { x, y } => match backends.mouse.as_mut() {
                Some(mouse) => {
                    mouse.move_relative(x, y);
                    ReplayOutcome::Replayed
                }
                None => ReplayOutcome::NoBackend,
            },
            ControlEvent::RelativeMouseButton { button, state } => {
                match backends.mouse.as_mut() {
                    Some(mouse) => {
                        mouse.button_relative(button, state.is_pressed());
                        ReplayOutcome::Replayed
                    }
                    None => ReplayOutcome::NoBackend,
                }
            }
            ControlEvent::RelativeMouseWheel { x, y } => match backends.mouse.as_mut() {
                Some(mouse) => {
                    mouse.wheel(x as i16, y as i16);
                    ReplayOutcome::Replayed
                }
                None => ReplayOutcome::NoBackend,
            },
            ControlEvent::GamepadAxis { which, axis, value } => {
                backends.pad_state.apply_axis(axis, value);
                let state = backends.pad_state;
                match backends.pad.as_mut() {
                    Some(pad) => {
                        pad.set_state(which, &state);
                        ReplayOutcome::Replayed
                    }
                    None => ReplayOutcome::NoBackend,
                }
            }
            ControlEvent::GamepadButton {
                which,
                button,
                state,
            } => {
                backends.pad_state.apply_button(button, state.is_pressed());
                let full = backends.pad_state;
                match backends.pad.as_mut() {
                    Some(pad) => {
                        pad.set_state(which, &full);
                        ReplayOutcome::Replayed
                    }
                    None => ReplayOutcome::NoBackend,
                }
            }
            ControlEvent::JoystickHat { which, hat } => {
                backends.pad_state.apply_hat(hat);
                let full = backends.pad_state;
                match backends.pad.as_mut() {
                    Some(pad) => {
                        pad.set_state(which, &full);
                        ReplayOutcome::Replayed
                    }
                    None => ReplayOutcome::NoBackend,
                }
            }
            ControlEvent::Ping | ControlEvent::Pong => ReplayOutcome::Ignored,
        }
    }

    fn replay_key(
        &self,
        backends: &mut Backends,
        scan: Option<ScanCode>,
        pressed: bool,
    ) -> ReplayOutcome {
        let Some(scan) = scan else {
            return ReplayOutcome::DroppedUnmapped;
        };
        if self.disabled[scan.code as usize] {
            log::info!("Disabled scan code: {}", scan.code);
            return ReplayOutcome::DroppedDisabled(scan.code);
        }
        match backends.keyboard.as_mut() {
            Some(keyboard) => {
                keyboard.key(scan, pressed);
                ReplayOutcome::Replayed
            }
            None => ReplayOutcome::NoBackend,
        }
    }
}

fn make_keyboard(kind: KeyboardBackendKind) -> Option<Box<dyn KeyboardSink>> {
    match kind {
        KeyboardBackendKind::None => None,
        KeyboardBackendKind::VirtualHid => {
            // The virtual HID transport needs the kernel driver; fall back
            // rather than half-work.
            log::warn!("[Replay] Virtual HID keyboard transport not present");
            None
        }
        KeyboardBackendKind::SyntheticInput => {
            #[cfg(windows)]
            {
                Some(Box::new(windows::SendInputKeyboard::new()))
            }
            #[cfg(not(windows))]
            {
                log::warn!("[Replay] Synthetic keyboard input requires a Windows host");
                None
            }
        }
    }
}

fn make_mouse(kind: MouseBackendKind) -> Option<Box<dyn MouseSink>> {
    match kind {
        MouseBackendKind::None => None,
        MouseBackendKind::VirtualHid => {
            log::warn!("[Replay] Virtual HID mouse transport not present");
            None
        }
        MouseBackendKind::SyntheticInput => {
            #[cfg(windows)]
            {
                Some(Box::new(windows::SendInputMouse::new()))
            }
            #[cfg(not(windows))]
            {
                log::warn!("[Replay] Synthetic mouse input requires a Windows host");
                None
            }
        }
        MouseBackendKind::WindowMessage => {
            #[cfg(windows)]
            {
                Some(Box::new(windows::WindowMessageMouse::new()))
            }
            #[cfg(not(windows))]
            {
                log::warn!("[Replay] Window-message mouse requires a Windows host");
                None
            }
        }
    }
}

fn make_pad(kind: GamepadBackendKind) -> Option<Box<dyn PadSink>> {
    match kind {
        GamepadBackendKind::None => None,
        GamepadBackendKind::VirtualHid => {
            log::warn!("[Replay] Virtual HID gamepad transport not present");
            None
        }
        GamepadBackendKind::VirtualPad => {
            // The virtual pad bus is an external driver; without it the
            // class stays unmapped.
            log::warn!("[Replay] Virtual pad bus not present");
            None
        }
    }
}
