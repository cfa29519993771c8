//! Codec boundary: the interface the encoding pipelines consume.
//!
//! Encoders follow the send/receive drain model: submit a raw frame, then
//! pull compressed packets until the codec reports `TryAgain`. Audio and
//! video are tagged variants with no shared dynamic dispatch outside the
//! framer callback.
//!
//! Concrete backends: Opus via the `opus` crate, H.264 via `openh264`,
//! AAC behind the `aac` feature. The video selection layer resolves any
//! backend preference it cannot open onto the software H.264 encoder.

mod h264;
mod opus_codec;
#[cfg(feature = "aac")]
mod aac;

pub use h264::OpenH264Codec;
pub use opus_codec::OpusCodec;

use crate::config::AudioCodecKind;
use crate::error::CodecError;
use crate::shm::AudioSampleFormat;

/// One compressed packet out of a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub keyframe: bool,
}

/// Option vector in the encoder's own vocabulary (name-value pairs).
/// Built by the selection layer, consumed by the concrete codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderOptions {
    pairs: Vec<(&'static str, String)>,
}

impl EncoderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, value: impl Into<String>) {
        self.pairs.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn pairs(&self) -> &[(&'static str, String)] {
        &self.pairs
    }
}

/// Interleaved PCM in the negotiated sample format.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuf {
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl SampleBuf {
    pub fn format(&self) -> AudioSampleFormat {
        match self {
            Self::I16(_) => AudioSampleFormat::I16,
            Self::F32(_) => AudioSampleFormat::F32,
        }
    }

    /// Samples per channel for `channels` interleaved channels.
    pub fn frames(&self, channels: usize) -> usize {
        let len = match self {
            Self::I16(buf) => buf.len(),
            Self::F32(buf) => buf.len(),
        };
        len / channels.max(1)
    }
}

/// A borrowed planar YUV 4:2:0 picture.
#[derive(Debug, Clone, Copy)]
pub struct YuvFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// Audio encoder half of the codec boundary.
pub trait AudioEncoderCodec: Send {
    /// Samples per channel the codec consumes per call.
    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn sample_format(&self) -> AudioSampleFormat;

    /// Submits exactly one frame of `frame_size` samples per channel.
    fn send_frame(&mut self, samples: &SampleBuf, pts: i64) -> Result<(), CodecError>;

    /// Drains the next packet; `Err(TryAgain)` when none is pending.
    fn receive_packet(&mut self) -> Result<CodecPacket, CodecError>;
}

/// Video encoder half of the codec boundary.
pub trait VideoEncoderCodec: Send {
    fn send_frame(
        &mut self,
        frame: &YuvFrame<'_>,
        pts: i64,
        force_keyframe: bool,
    ) -> Result<(), CodecError>;

    fn receive_packet(&mut self) -> Result<CodecPacket, CodecError>;
}

/// Format/rate sets an audio codec supports, used for negotiation.
pub struct AudioCodecCaps {
    pub sample_formats: &'static [AudioSampleFormat],
    pub sample_rates: &'static [u32],
}

/// Capability table per audio codec.
pub fn audio_caps(kind: AudioCodecKind) -> AudioCodecCaps {
    match kind {
        AudioCodecKind::Opus => AudioCodecCaps {
            sample_formats: &[AudioSampleFormat::I16, AudioSampleFormat::F32],
            sample_rates: &[48_000, 24_000, 16_000, 12_000, 8_000],
        },
        AudioCodecKind::Aac => AudioCodecCaps {
            sample_formats: &[AudioSampleFormat::I16],
            sample_rates: &[96_000, 64_000, 48_000, 44_100, 32_000, 24_000, 16_000, 12_000, 8_000],
        },
    }
}

/// Prefers the source format when the codec supports it, otherwise the
/// first offered format.
pub fn negotiate_sample_format(
    caps: &AudioCodecCaps,
    source: AudioSampleFormat,
) -> AudioSampleFormat {
    if caps.sample_formats.contains(&source) {
        source
    } else {
        caps.sample_formats[0]
    }
}

/// Chooses the supported rate nearest to the source rate.
pub fn negotiate_sample_rate(caps: &AudioCodecCaps, source: u32) -> u32 {
    let mut best = caps.sample_rates[0];
    let mut min_diff = best.abs_diff(source);
    for &rate in &caps.sample_rates[1..] {
        let diff = rate.abs_diff(source);
        if diff < min_diff {
            min_diff = diff;
            best = rate;
        }
    }
    best
}

/// Opens the audio codec at the negotiated parameters. Output is always
/// stereo regardless of the source channel count.
pub fn open_audio(
    kind: AudioCodecKind,
    sample_rate: u32,
    sample_format: AudioSampleFormat,
    bitrate: u64,
) -> Result<Box<dyn AudioEncoderCodec>, CodecError> {
    match kind {
        AudioCodecKind::Opus => Ok(Box::new(OpusCodec::open(
            sample_rate,
            sample_format,
            bitrate,
        )?)),
        #[cfg(feature = "aac")]
        AudioCodecKind::Aac => Ok(Box::new(aac::AacCodec::open(sample_rate, bitrate)?)),
        #[cfg(not(feature = "aac"))]
        AudioCodecKind::Aac => Err(CodecError::Unavailable("aac")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_negotiation_prefers_source() {
        let caps = audio_caps(AudioCodecKind::Opus);
        assert_eq!(
            negotiate_sample_format(&caps, AudioSampleFormat::F32),
            AudioSampleFormat::F32
        );
        let caps = audio_caps(AudioCodecKind::Aac);
        // AAC offers only i16; falls back to the first offered format.
        assert_eq!(
            negotiate_sample_format(&caps, AudioSampleFormat::F32),
            AudioSampleFormat::I16
        );
    }

    #[test]
    fn rate_negotiation_picks_nearest() {
        let caps = audio_caps(AudioCodecKind::Opus);
        assert_eq!(negotiate_sample_rate(&caps, 44_100), 48_000);
        assert_eq!(negotiate_sample_rate(&caps, 11_000), 12_000);
        assert_eq!(negotiate_sample_rate(&caps, 48_000), 48_000);
    }
}
