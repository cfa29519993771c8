//! Opus audio codec backend.

use std::collections::VecDeque;

use crate::codec::{AudioEncoderCodec, CodecPacket, SampleBuf};
use crate::error::CodecError;
use crate::shm::AudioSampleFormat;

/// Output is always stereo.
const CHANNELS: usize = 2;

/// Worst-case packet buffer handed to the encoder.
const MAX_PACKET: usize = 4000;

pub struct OpusCodec {
    encoder: opus::Encoder,
    sample_rate: u32,
    sample_format: AudioSampleFormat,
    frame_size: usize,
    pending: VecDeque<CodecPacket>,
}

impl OpusCodec {
    pub fn open(
        sample_rate: u32,
        sample_format: AudioSampleFormat,
        bitrate: u64,
    ) -> Result<Self, CodecError> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Stereo, opus::Application::Audio)
                .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self {
            encoder,
            sample_rate,
            sample_format,
            // 20 ms frames.
            frame_size: sample_rate as usize / 50,
            pending: VecDeque::new(),
        })
    }
}

impl AudioEncoderCodec for OpusCodec {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn sample_format(&self) -> AudioSampleFormat {
        self.sample_format
    }

    fn send_frame(&mut self, samples: &SampleBuf, pts: i64) -> Result<(), CodecError> {
        if samples.frames(CHANNELS) != self.frame_size {
            return Err(CodecError::Encode(format!(
                "expected {} samples per channel, got {}",
                self.frame_size,
                samples.frames(CHANNELS)
            )));
        }
        let data = match samples {
            SampleBuf::I16(pcm) => self
                .encoder
                .encode_vec(pcm, MAX_PACKET)
                .map_err(|e| CodecError::Encode(e.to_string()))?,
            SampleBuf::F32(pcm) => self
                .encoder
                .encode_vec_float(pcm, MAX_PACKET)
                .map_err(|e| CodecError::Encode(e.to_string()))?,
        };
        self.pending.push_back(CodecPacket {
            data,
            pts,
            // Every Opus packet is independently decodable.
            keyframe: true,
        });
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CodecPacket, CodecError> {
        self.pending.pop_front().ok_or(CodecError::TryAgain)
    }
}
