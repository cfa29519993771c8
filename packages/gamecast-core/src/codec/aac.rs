//! AAC audio codec backend (fdk-aac), compiled with the `aac` feature.

use std::collections::VecDeque;

use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};

use crate::codec::{AudioEncoderCodec, CodecPacket, SampleBuf};
use crate::error::CodecError;
use crate::shm::AudioSampleFormat;

const CHANNELS: usize = 2;

/// AAC-LC frame length in samples per channel.
const AAC_FRAME_SIZE: usize = 1024;

pub struct AacCodec {
    encoder: Encoder,
    sample_rate: u32,
    pending: VecDeque<CodecPacket>,
}

impl AacCodec {
    pub fn open(sample_rate: u32, bitrate: u64) -> Result<Self, CodecError> {
        let encoder = Encoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(bitrate as u32),
            sample_rate,
            transport: Transport::Raw,
            channels: ChannelMode::Stereo,
        })
        .map_err(|e| CodecError::Init(format!("{:?}", e)))?;
        Ok(Self {
            encoder,
            sample_rate,
            pending: VecDeque::new(),
        })
    }

    /// AudioSpecificConfig for the init segment.
    pub fn audio_specific_config(&self) -> Vec<u8> {
        crate::container::audio_specific_config(self.sample_rate, CHANNELS as u8)
    }
}

impl AudioEncoderCodec for AacCodec {
    fn frame_size(&self) -> usize {
        AAC_FRAME_SIZE
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn sample_format(&self) -> AudioSampleFormat {
        AudioSampleFormat::I16
    }

    fn send_frame(&mut self, samples: &SampleBuf, pts: i64) -> Result<(), CodecError> {
        let pcm = match samples {
            SampleBuf::I16(pcm) => pcm,
            SampleBuf::F32(_) => {
                return Err(CodecError::Encode("aac consumes i16 samples".into()));
            }
        };
        if pcm.len() != AAC_FRAME_SIZE * CHANNELS {
            return Err(CodecError::Encode(format!(
                "expected {} interleaved samples, got {}",
                AAC_FRAME_SIZE * CHANNELS,
                pcm.len()
            )));
        }
        let mut out = vec![0u8; 1536 * CHANNELS];
        let info = self
            .encoder
            .encode(pcm, &mut out)
            .map_err(|e| CodecError::Encode(format!("{:?}", e)))?;
        if info.output_size > 0 {
            out.truncate(info.output_size);
            self.pending.push_back(CodecPacket {
                data: out,
                pts,
                keyframe: true,
            });
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CodecPacket, CodecError> {
        self.pending.pop_front().ok_or(CodecError::TryAgain)
    }
}
