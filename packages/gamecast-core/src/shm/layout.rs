//! C-layout structs shared with the capture agents.
//!
//! These are read and written with native endianness (intra-host shared
//! memory). All structs are `#[repr(C)]` with fixed-width fields and no
//! implicit padding; sizes are asserted in tests.

use bytemuck::{Pod, Zeroable};

/// Slots per ring. Small on purpose: latest-wins reading makes extra depth
/// useless.
pub const NUM_SHARED_FRAMES: usize = 2;

pub const VIDEO_FRAME_INFO_LEN: usize = std::mem::size_of::<SharedVideoFrameInfo>();
pub const VIDEO_RING_HEADER_LEN: usize = std::mem::size_of::<SharedVideoFramesHeader>();
pub const FRAME_STATS_LEN: usize = std::mem::size_of::<FrameStats>();
pub const AUDIO_RING_HEADER_LEN: usize = std::mem::size_of::<SharedAudioFramesHeader>();
pub const AUDIO_FRAME_HEADER_LEN: usize = std::mem::size_of::<PackedAudioFrameHeader>();

/// Raw video frame representation written by the capture agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VideoFrameType {
    None = 0,
    Yuv = 1,
    Texture = 2,
    I420 = 3,
    J420 = 4,
    I422 = 5,
    J422 = 6,
    I444 = 7,
}

impl VideoFrameType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Yuv),
            2 => Some(Self::Texture),
            3 => Some(Self::I420),
            4 => Some(Self::J420),
            5 => Some(Self::I422),
            6 => Some(Self::J422),
            7 => Some(Self::I444),
            _ => None,
        }
    }

    /// In-memory YUV variants that live in the YUV ring (as opposed to the
    /// texture ring, whose payload is a GPU handle).
    pub fn is_cpu_yuv(self) -> bool {
        matches!(
            self,
            Self::Yuv | Self::I420 | Self::J420 | Self::I422 | Self::J422 | Self::I444
        )
    }
}

/// Sample format of the raw PCM in the audio ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AudioSampleFormat {
    None = 0,
    I16 = 1,
    F32 = 2,
}

impl AudioSampleFormat {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::I16),
            2 => Some(Self::F32),
            _ => None,
        }
    }

    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::None => 0,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Geometry and provenance of the video frames currently being produced.
///
/// Written once by the capture agent at the start of a run and re-written
/// only when geometry changes; the encoder re-reads it on every wakeup to
/// detect mid-session resizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SharedVideoFrameInfo {
    /// Monotonic tick of the most recent geometry (re)write.
    pub timestamp: u64,
    /// [`VideoFrameType`] as u32.
    pub frame_type: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel format code of the producer, opaque to this side.
    pub format: u32,
    /// Source window handle, opaque.
    pub window: u64,
}

/// Per-frame latency instrumentation. Never gates correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FrameStats {
    pub timestamp: u64,
    pub preprocess_ns: u64,
    pub rgb_mapping_ns: u64,
    pub yuv_convert_ns: u64,
    pub encode_ns: u64,
    pub total_ns: u64,
}

/// Header of the YUV (and texture) frame rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SharedVideoFramesHeader {
    /// Bytes per packed frame slot (stats header + payload).
    pub data_size: u32,
}

/// One entry of the texture ring. The payload is a GPU texture owned by the
/// producer, identified by `(instance_id, texture_id)`; this side treats it
/// as an opaque handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PackedVideoTextureFrame {
    pub instance_id: u64,
    pub texture_id: u64,
    pub stats: FrameStats,
}

/// Header of the audio frame ring: the source PCM format.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SharedAudioFramesHeader {
    /// NUL-padded producer codec/source name.
    pub codec_name: [u8; 32],
    pub channels: u32,
    /// Samples per channel per ring slot.
    pub frame_size: u32,
    pub sample_bits: u32,
    /// [`AudioSampleFormat`] as u32.
    pub sample_format: u32,
}

impl std::fmt::Debug for SharedAudioFramesHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name_len = self
            .codec_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.codec_name.len());
        f.debug_struct("SharedAudioFramesHeader")
            .field(
                "codec_name",
                &String::from_utf8_lossy(&self.codec_name[..name_len]),
            )
            .field("channels", &self.channels)
            .field("frame_size", &self.frame_size)
            .field("sample_bits", &self.sample_bits)
            .field("sample_format", &self.sample_format)
            .finish()
    }
}

impl SharedAudioFramesHeader {
    /// Bytes of PCM payload per ring slot.
    pub fn frame_bytes(&self) -> usize {
        let format = AudioSampleFormat::from_u32(self.sample_format).unwrap_or(AudioSampleFormat::None);
        self.frame_size as usize * self.channels as usize * format.bytes_per_sample()
    }
}

/// Per-slot header in the audio ring, followed by `frame_bytes` of PCM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PackedAudioFrameHeader {
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes_are_abi_stable() {
        assert_eq!(VIDEO_FRAME_INFO_LEN, 32);
        assert_eq!(FRAME_STATS_LEN, 48);
        assert_eq!(VIDEO_RING_HEADER_LEN, 4);
        assert_eq!(std::mem::size_of::<PackedVideoTextureFrame>(), 64);
        assert_eq!(AUDIO_RING_HEADER_LEN, 48);
        assert_eq!(AUDIO_FRAME_HEADER_LEN, 8);
    }

    #[test]
    fn audio_header_frame_bytes() {
        let mut header = SharedAudioFramesHeader::zeroed();
        header.channels = 2;
        header.frame_size = 480;
        header.sample_format = AudioSampleFormat::F32 as u32;
        assert_eq!(header.frame_bytes(), 480 * 2 * 4);
    }

    #[test]
    fn frame_type_codes() {
        assert_eq!(VideoFrameType::from_u32(1), Some(VideoFrameType::Yuv));
        assert_eq!(VideoFrameType::from_u32(2), Some(VideoFrameType::Texture));
        assert_eq!(VideoFrameType::from_u32(99), None);
        assert!(VideoFrameType::I420.is_cpu_yuv());
        assert!(!VideoFrameType::Texture.is_cpu_yuv());
    }
}
