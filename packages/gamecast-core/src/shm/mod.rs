//! Shared-memory frame transport between the capture agents and the encoders.
//!
//! The capture agents (audio loopback and swap-chain interception) are
//! external producers. They populate fixed-layout rings in named shared
//! memory and pulse a readiness event per frame; the encoders consume the
//! newest slot (latest-wins) so a slow consumer drops intermediate frames
//! instead of falling behind.
//!
//! Layout structs are the ABI: field order, widths and native endianness
//! must match the agent exactly.

mod layout;
pub mod local;
mod ring;
mod signal;
#[cfg(windows)]
pub mod windows;

pub use layout::{
    AudioSampleFormat, FrameStats, PackedAudioFrameHeader, SharedAudioFramesHeader,
    PackedVideoTextureFrame, SharedVideoFrameInfo, SharedVideoFramesHeader, VideoFrameType,
    AUDIO_FRAME_HEADER_LEN, AUDIO_RING_HEADER_LEN, FRAME_STATS_LEN, NUM_SHARED_FRAMES,
    VIDEO_FRAME_INFO_LEN, VIDEO_RING_HEADER_LEN,
};
pub use ring::{AudioRing, AudioRingFrame, VideoYuvRing, YuvFrameRef};
pub use signal::{FrameSignal, StateEvent, Wakeup};

use std::sync::Arc;

use crate::error::ShmError;

/// Fixed region and event names, the contract with the capture agents.
pub mod names {
    pub const SHARED_AUDIO_FRAME_MAPPING: &str = "ksyun.regame.SharedAudioFrameFileMapping";
    pub const SHARED_AUDIO_FRAME_READY_EVENT: &str = "ksyun.regame.SharedAudioFrameReadyEvent";
    pub const AUDIO_STARTED_EVENT: &str = "ksyun.regame.AudioStarted";
    pub const AUDIO_STOPPED_EVENT: &str = "ksyun.regame.AudioStopped";

    pub const SHARED_VIDEO_FRAME_INFO_MAPPING: &str =
        "ksyun.regame.SharedVideoFrameInfoFileMapping";
    pub const SHARED_VIDEO_YUV_FRAMES_MAPPING: &str =
        "ksyun.regame.SharedVideoYuvFramesFileMapping";
    pub const SHARED_VIDEO_TEXTURE_FRAMES_MAPPING: &str =
        "ksyun.regame.SharedVideoTextureFramesFileMapping";
    pub const SHARED_VIDEO_FRAME_READY_EVENT: &str = "ksyun.regame.SharedVideoFrameReadyEvent";
    pub const VIDEO_STARTED_EVENT: &str = "ksyun.regame.VideoStarted";
    pub const VIDEO_STOPPED_EVENT: &str = "ksyun.regame.VideoStopped";
    pub const DO_NOT_PRESENT_EVENT: &str = "ksyun.regame.DoNotPresent";
}

/// A byte-addressable shared region. Accessors copy in/out; the producer may
/// be writing other slots concurrently, so no references into the region are
/// ever handed out.
pub trait Region: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `out.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), ShmError>;

    /// Copies `data` into the region starting at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), ShmError>;
}

/// Reads a `Pod` struct out of a region at `offset`.
pub fn read_pod<T: bytemuck::Pod>(region: &dyn Region, offset: usize) -> Result<T, ShmError> {
    let mut raw = vec![0u8; std::mem::size_of::<T>()];
    region.read(offset, &mut raw)?;
    Ok(bytemuck::pod_read_unaligned(&raw))
}

/// Writes a `Pod` struct into a region at `offset`.
pub fn write_pod<T: bytemuck::Pod>(
    region: &dyn Region,
    offset: usize,
    value: &T,
) -> Result<(), ShmError> {
    region.write(offset, bytemuck::bytes_of(value))
}

/// Encoder-side attach point for the video capture agent.
pub trait VideoCaptureSource: Send + Sync {
    /// Reads the shared frame info block. Valid once the first frame has been
    /// produced (geometry is unknown before that).
    fn frame_info(&self) -> Result<SharedVideoFrameInfo, ShmError>;

    /// Opens the YUV frame ring; `expected_len` is the exact region size
    /// derived from the frame geometry. Out-of-range sizes are fatal.
    fn open_yuv_frames(&self, expected_len: usize) -> Result<Arc<dyn Region>, ShmError>;

    /// The stop/frame-ready multiplexed wait object.
    fn signal(&self) -> Arc<dyn FrameSignal>;

    /// Started/stopped events visible to the capture agent.
    fn started_event(&self) -> Arc<dyn StateEvent>;
    fn stopped_event(&self) -> Arc<dyn StateEvent>;
}

/// Encoder-side attach point for the audio capture agent.
pub trait AudioCaptureSource: Send + Sync {
    /// Opens the audio frame ring and returns its header (source format).
    fn open_frames(&self) -> Result<(SharedAudioFramesHeader, Arc<dyn Region>), ShmError>;

    /// Sample rate of the source PCM. The loopback agent captures at the
    /// shared engine mix rate, 48 kHz on stock hosts.
    fn source_rate(&self) -> u32 {
        48_000
    }

    fn signal(&self) -> Arc<dyn FrameSignal>;

    fn started_event(&self) -> Arc<dyn StateEvent>;
    fn stopped_event(&self) -> Arc<dyn StateEvent>;
}
