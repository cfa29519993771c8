//! In-process capture transport.
//!
//! The real capture agents are Windows externals talking through named
//! sections and events (see [`super::windows`]). This module provides the
//! same surface inside one process: tests drive the encoders through it, and
//! non-Windows hosts use it as the capture stand-in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::ShmError;
use crate::shm::layout::SharedVideoFrameInfo;
use crate::shm::signal::{FrameSignal, StateEvent, Wakeup};
use crate::shm::{write_pod, AudioCaptureSource, Region, SharedAudioFramesHeader, VideoCaptureSource};

/// Heap-backed region with interior mutability.
pub struct LocalRegion {
    data: Mutex<Vec<u8>>,
}

impl LocalRegion {
    pub fn with_len(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; len]),
        })
    }
}

impl Region for LocalRegion {
    fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        let data = self.data.lock().map_err(|_| ShmError::Map {
            name: "local region".into(),
            reason: "poisoned".into(),
        })?;
        let end = offset + out.len();
        if end > data.len() {
            return Err(ShmError::RegionTooSmall {
                name: "local region".into(),
                expected: end,
                actual: data.len(),
            });
        }
        out.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        let mut data = self.data.lock().map_err(|_| ShmError::Map {
            name: "local region".into(),
            reason: "poisoned".into(),
        })?;
        let end = offset + bytes.len();
        if end > data.len() {
            return Err(ShmError::RegionTooSmall {
                name: "local region".into(),
                expected: end,
                actual: data.len(),
            });
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Default)]
struct SignalState {
    stop: bool,
    ready: bool,
}

/// Condvar-backed `{stop, frame_ready}` multiplexer.
#[derive(Default)]
pub struct LocalSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl LocalSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl FrameSignal for LocalSignal {
    fn wait(&self) -> Wakeup {
        let Ok(mut state) = self.state.lock() else {
            return Wakeup::Stop;
        };
        loop {
            if state.stop {
                return Wakeup::Stop;
            }
            if state.ready {
                state.ready = false; // auto-reset
                return Wakeup::FrameReady;
            }
            state = match self.condvar.wait(state) {
                Ok(guard) => guard,
                Err(_) => return Wakeup::Stop,
            };
        }
    }

    fn signal_frame(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.ready = true;
            self.condvar.notify_all();
        }
    }

    fn signal_stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stop = true;
            self.condvar.notify_all();
        }
    }

    fn clear_stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stop = false;
        }
    }
}

/// Manual-reset flag.
#[derive(Default)]
pub struct LocalStateEvent {
    set: AtomicBool,
}

impl LocalStateEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StateEvent for LocalStateEvent {
    fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }
}

/// In-process video capture host: owns the info block, the frame ring region
/// and the signals. The producer half is what a test (or local capture
/// stand-in) drives; the consumer half implements [`VideoCaptureSource`].
pub struct LocalVideoCapture {
    info: Arc<LocalRegion>,
    frames: Mutex<Option<Arc<LocalRegion>>>,
    signal: Arc<LocalSignal>,
    started: Arc<LocalStateEvent>,
    stopped: Arc<LocalStateEvent>,
}

impl LocalVideoCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            info: LocalRegion::with_len(std::mem::size_of::<SharedVideoFrameInfo>()),
            frames: Mutex::new(None),
            signal: LocalSignal::new(),
            started: LocalStateEvent::new(),
            stopped: LocalStateEvent::new(),
        })
    }

    /// Producer side: publishes frame geometry.
    pub fn publish_frame_info(&self, info: &SharedVideoFrameInfo) -> Result<(), ShmError> {
        write_pod(&*self.info, 0, info)
    }

    /// Producer side: allocates the frame ring region.
    pub fn create_frames_region(&self, len: usize) -> Arc<LocalRegion> {
        let region = LocalRegion::with_len(len);
        if let Ok(mut frames) = self.frames.lock() {
            *frames = Some(Arc::clone(&region));
        }
        region
    }

    /// Producer side: pulse frame readiness.
    pub fn signal_frame(&self) {
        self.signal.signal_frame();
    }

    pub fn raw_signal(&self) -> Arc<LocalSignal> {
        Arc::clone(&self.signal)
    }
}

impl VideoCaptureSource for LocalVideoCapture {
    fn frame_info(&self) -> Result<SharedVideoFrameInfo, ShmError> {
        crate::shm::read_pod(&*self.info, 0)
    }

    fn open_yuv_frames(&self, expected_len: usize) -> Result<Arc<dyn Region>, ShmError> {
        let frames = self.frames.lock().map_err(|_| ShmError::Map {
            name: "local video frames".into(),
            reason: "poisoned".into(),
        })?;
        let region = frames.as_ref().ok_or_else(|| ShmError::Map {
            name: "local video frames".into(),
            reason: "not created".into(),
        })?;
        if region.len() < expected_len {
            return Err(ShmError::RegionTooSmall {
                name: "local video frames".into(),
                expected: expected_len,
                actual: region.len(),
            });
        }
        Ok(Arc::clone(region) as Arc<dyn Region>)
    }

    fn signal(&self) -> Arc<dyn FrameSignal> {
        Arc::clone(&self.signal) as Arc<dyn FrameSignal>
    }

    fn started_event(&self) -> Arc<dyn StateEvent> {
        Arc::clone(&self.started) as Arc<dyn StateEvent>
    }

    fn stopped_event(&self) -> Arc<dyn StateEvent> {
        Arc::clone(&self.stopped) as Arc<dyn StateEvent>
    }
}

/// In-process audio capture host.
pub struct LocalAudioCapture {
    frames: Mutex<Option<Arc<LocalRegion>>>,
    signal: Arc<LocalSignal>,
    started: Arc<LocalStateEvent>,
    stopped: Arc<LocalStateEvent>,
    source_rate: std::sync::atomic::AtomicU32,
}

impl LocalAudioCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(None),
            signal: LocalSignal::new(),
            started: LocalStateEvent::new(),
            stopped: LocalStateEvent::new(),
            source_rate: std::sync::atomic::AtomicU32::new(48_000),
        })
    }

    pub fn set_source_rate(&self, rate: u32) {
        self.source_rate.store(rate, Ordering::SeqCst);
    }

    /// Producer side: allocates the ring region sized for `header`.
    pub fn create_frames_region(&self, len: usize) -> Arc<LocalRegion> {
        let region = LocalRegion::with_len(len);
        if let Ok(mut frames) = self.frames.lock() {
            *frames = Some(Arc::clone(&region));
        }
        region
    }

    pub fn signal_frame(&self) {
        self.signal.signal_frame();
    }

    pub fn raw_signal(&self) -> Arc<LocalSignal> {
        Arc::clone(&self.signal)
    }
}

impl AudioCaptureSource for LocalAudioCapture {
    fn source_rate(&self) -> u32 {
        self.source_rate.load(Ordering::SeqCst)
    }

    fn open_frames(&self) -> Result<(SharedAudioFramesHeader, Arc<dyn Region>), ShmError> {
        let frames = self.frames.lock().map_err(|_| ShmError::Map {
            name: "local audio frames".into(),
            reason: "poisoned".into(),
        })?;
        let region = frames.as_ref().ok_or_else(|| ShmError::Map {
            name: "local audio frames".into(),
            reason: "not created".into(),
        })?;
        let header: SharedAudioFramesHeader = crate::shm::read_pod(&**region, 0)?;
        Ok((header, Arc::clone(region) as Arc<dyn Region>))
    }

    fn signal(&self) -> Arc<dyn FrameSignal> {
        Arc::clone(&self.signal) as Arc<dyn FrameSignal>
    }

    fn started_event(&self) -> Arc<dyn StateEvent> {
        Arc::clone(&self.started) as Arc<dyn StateEvent>
    }

    fn stopped_event(&self) -> Arc<dyn StateEvent> {
        Arc::clone(&self.stopped) as Arc<dyn StateEvent>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_stop_wins_over_ready() {
        let signal = LocalSignal::new();
        signal.signal_frame();
        signal.signal_stop();
        assert_eq!(signal.wait(), Wakeup::Stop);
    }

    #[test]
    fn signal_frame_is_auto_reset() {
        let signal = LocalSignal::new();
        signal.signal_frame();
        assert_eq!(signal.wait(), Wakeup::FrameReady);

        let waiter = Arc::clone(&signal);
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        // Second pulse wakes the blocked waiter exactly once.
        signal.signal_frame();
        assert_eq!(handle.join().unwrap(), Wakeup::FrameReady);
    }

    #[test]
    fn state_event_is_idempotent() {
        let event = LocalStateEvent::new();
        assert!(!event.is_set());
        event.set();
        event.set();
        assert!(event.is_set());
        event.reset();
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn region_bounds_are_checked() {
        let region = LocalRegion::with_len(8);
        let mut out = [0u8; 4];
        assert!(region.read(6, &mut out).is_err());
        assert!(region.write(5, &[0u8; 4]).is_err());
        assert!(region.write(4, &[1u8; 4]).is_ok());
        region.read(4, &mut out).unwrap();
        assert_eq!(out, [1u8; 4]);
    }
}
