//! Windows transport: named file mappings and named events, the real
//! channel to the capture agents.

use std::ffi::c_void;
use std::sync::Arc;

use windows_sys::Win32::Foundation::{CloseHandle, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject, INFINITE,
};

use crate::error::ShmError;
use crate::shm::layout::SharedVideoFrameInfo;
use crate::shm::signal::{FrameSignal, StateEvent, Wakeup};
use crate::shm::{
    names, AudioCaptureSource, Region, SharedAudioFramesHeader, VideoCaptureSource,
};

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> String {
    std::io::Error::last_os_error().to_string()
}

/// A mapped view of a named section.
pub struct WindowsRegion {
    handle: HANDLE,
    view: *mut u8,
    len: usize,
}

// The view pointer is only ever dereferenced through the copying accessors.
unsafe impl Send for WindowsRegion {}
unsafe impl Sync for WindowsRegion {}

impl WindowsRegion {
    /// Creates (or opens, if it already exists) a named section of `len`
    /// bytes and maps it.
    pub fn create(name: &str, len: usize) -> Result<Arc<Self>, ShmError> {
        let wname = wide(name);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ShmError::Map {
                name: name.into(),
                reason: last_error(),
            });
        }
        Self::map(handle, name, len)
    }

    /// Opens an existing named section of exactly `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Arc<Self>, ShmError> {
        let wname = wide(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wname.as_ptr()) };
        if handle.is_null() {
            return Err(ShmError::Map {
                name: name.into(),
                reason: last_error(),
            });
        }
        Self::map(handle, name, len)
    }

    fn map(handle: HANDLE, name: &str, len: usize) -> Result<Arc<Self>, ShmError> {
        let view: MEMORY_MAPPED_VIEW_ADDRESS =
            unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            let reason = last_error();
            unsafe { CloseHandle(handle) };
            return Err(ShmError::Map {
                name: name.into(),
                reason,
            });
        }
        Ok(Arc::new(Self {
            handle,
            view: view.Value as *mut u8,
            len,
        }))
    }
}

impl Region for WindowsRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError> {
        let end = offset + out.len();
        if end > self.len {
            return Err(ShmError::RegionTooSmall {
                name: "mapped region".into(),
                expected: end,
                actual: self.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.view.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let end = offset + data.len();
        if end > self.len {
            return Err(ShmError::RegionTooSmall {
                name: "mapped region".into(),
                expected: end,
                actual: self.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.view.add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for WindowsRegion {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view as *mut c_void,
            });
            CloseHandle(self.handle);
        }
    }
}

struct OwnedEvent {
    handle: HANDLE,
}

unsafe impl Send for OwnedEvent {}
unsafe impl Sync for OwnedEvent {}

impl OwnedEvent {
    /// Creates or opens a named event. `manual_reset` selects the reset
    /// semantics when the event is created fresh.
    fn create(name: &str, manual_reset: bool) -> Result<Self, ShmError> {
        let wname = wide(name);
        let handle = unsafe {
            CreateEventW(
                std::ptr::null(),
                if manual_reset { TRUE } else { FALSE },
                FALSE,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ShmError::Event {
                name: name.into(),
                reason: last_error(),
            });
        }
        Ok(Self { handle })
    }
}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// `{stop, frame_ready}` pair backed by named events. The stop event is
/// manual-reset, the ready event auto-reset.
pub struct WindowsFrameSignal {
    stop: OwnedEvent,
    ready: OwnedEvent,
}

impl WindowsFrameSignal {
    pub fn create(stop_name: &str, ready_name: &str) -> Result<Arc<Self>, ShmError> {
        Ok(Arc::new(Self {
            stop: OwnedEvent::create(stop_name, true)?,
            ready: OwnedEvent::create(ready_name, false)?,
        }))
    }
}

impl FrameSignal for WindowsFrameSignal {
    fn wait(&self) -> Wakeup {
        let handles = [self.stop.handle, self.ready.handle];
        let wait = unsafe {
            WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), FALSE, INFINITE)
        };
        // Lowest-index signaled object wins; stop is first.
        if wait == WAIT_OBJECT_0 {
            Wakeup::Stop
        } else if wait == WAIT_OBJECT_0 + 1 {
            // Stop may have raced in; honor it first.
            if unsafe { WaitForSingleObject(self.stop.handle, 0) } == WAIT_OBJECT_0 {
                Wakeup::Stop
            } else {
                Wakeup::FrameReady
            }
        } else {
            log::warn!("[Shm] Unexpected WaitForMultipleObjects() return {}", wait);
            Wakeup::Stop
        }
    }

    fn signal_frame(&self) {
        unsafe { SetEvent(self.ready.handle) };
    }

    fn signal_stop(&self) {
        unsafe { SetEvent(self.stop.handle) };
    }

    fn clear_stop(&self) {
        unsafe { ResetEvent(self.stop.handle) };
    }
}

/// Named manual-reset event.
pub struct WindowsStateEvent {
    event: OwnedEvent,
}

impl WindowsStateEvent {
    pub fn create(name: &str) -> Result<Arc<Self>, ShmError> {
        Ok(Arc::new(Self {
            event: OwnedEvent::create(name, true)?,
        }))
    }
}

impl StateEvent for WindowsStateEvent {
    fn set(&self) {
        unsafe { SetEvent(self.event.handle) };
    }

    fn reset(&self) {
        unsafe { ResetEvent(self.event.handle) };
    }

    fn is_set(&self) -> bool {
        unsafe { WaitForSingleObject(self.event.handle, 0) == WAIT_OBJECT_0 }
    }
}

/// Video capture attach point over the named objects.
pub struct WindowsVideoCapture {
    info: Arc<WindowsRegion>,
    signal: Arc<WindowsFrameSignal>,
    started: Arc<WindowsStateEvent>,
    stopped: Arc<WindowsStateEvent>,
}

impl WindowsVideoCapture {
    pub fn create() -> Result<Arc<Self>, ShmError> {
        Ok(Arc::new(Self {
            info: WindowsRegion::create(
                names::SHARED_VIDEO_FRAME_INFO_MAPPING,
                std::mem::size_of::<SharedVideoFrameInfo>(),
            )?,
            signal: WindowsFrameSignal::create(
                names::VIDEO_STOPPED_EVENT,
                names::SHARED_VIDEO_FRAME_READY_EVENT,
            )?,
            started: WindowsStateEvent::create(names::VIDEO_STARTED_EVENT)?,
            stopped: WindowsStateEvent::create(names::VIDEO_STOPPED_EVENT)?,
        }))
    }
}

impl VideoCaptureSource for WindowsVideoCapture {
    fn frame_info(&self) -> Result<SharedVideoFrameInfo, ShmError> {
        crate::shm::read_pod(&*self.info, 0)
    }

    fn open_yuv_frames(&self, expected_len: usize) -> Result<Arc<dyn Region>, ShmError> {
        let region = WindowsRegion::open(names::SHARED_VIDEO_YUV_FRAMES_MAPPING, expected_len)?;
        Ok(region as Arc<dyn Region>)
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

/// Audio capture attach point over the named objects.
pub struct WindowsAudioCapture {
    signal: Arc<WindowsFrameSignal>,
    started: Arc<WindowsStateEvent>,
    stopped: Arc<WindowsStateEvent>,
}

impl WindowsAudioCapture {
    pub fn create() -> Result<Arc<Self>, ShmError> {
        Ok(Arc::new(Self {
            signal: WindowsFrameSignal::create(
                names::AUDIO_STOPPED_EVENT,
                names::SHARED_AUDIO_FRAME_READY_EVENT,
            )?,
            started: WindowsStateEvent::create(names::AUDIO_STARTED_EVENT)?,
            stopped: WindowsStateEvent::create(names::AUDIO_STOPPED_EVENT)?,
        }))
    }
}

impl AudioCaptureSource for WindowsAudioCapture {
    fn open_frames(&self) -> Result<(SharedAudioFramesHeader, Arc<dyn Region>), ShmError> {
        // Header first to learn the geometry, then remap at full size.
        let header_region = WindowsRegion::open(
            names::SHARED_AUDIO_FRAME_MAPPING,
            std::mem::size_of::<SharedAudioFramesHeader>(),
        )?;
        let header: SharedAudioFramesHeader = crate::shm::read_pod(&*header_region, 0)?;
        drop(header_region);
        let full_len = crate::shm::AudioRing::required_len(&header);
        let region = WindowsRegion::open(names::SHARED_AUDIO_FRAME_MAPPING, full_len)?;
        Ok((header, region as Arc<dyn Region>))
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
