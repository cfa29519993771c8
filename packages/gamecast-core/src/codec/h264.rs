//! Software H.264 backend (OpenH264).
//!
//! The encoder's safe surface exposes bitrate, rate-control mode, frame
//! skipping and forced IDRs, so the option vector maps onto those: `crf`
//! selects the rate-control mode, the preset's speed tier decides whether
//! frames may be dropped under bitrate pressure, and the GOP is enforced
//! here as a forced-IDR cadence since the config carries no intra-period
//! field. Output is constrained baseline, which is the requested profile,
//! and the encoder buffers no lookahead, which covers the zero-latency
//! tune.

use std::collections::VecDeque;

use openh264::encoder::{Encoder, EncoderConfig, FrameType, RateControlMode};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

use crate::codec::{CodecPacket, EncoderOptions, VideoEncoderCodec, YuvFrame};
use crate::error::CodecError;

/// Quality values at or below this keep the encoder in quality-first rate
/// control; worse values switch to strict bitrate mode.
const QUALITY_FIRST_MAX: u32 = 35;

/// Speed-tier presets that tolerate dropped frames under pressure.
pub fn preset_allows_skip(preset: &str) -> bool {
    matches!(
        preset,
        "ultrafast" | "superfast" | "veryfast" | "faster" | "llhp" | "speed"
    )
}

fn rate_control_for(quality: u32) -> RateControlMode {
    if quality <= QUALITY_FIRST_MAX {
        RateControlMode::Quality
    } else {
        RateControlMode::Bitrate
    }
}

/// Adapts a borrowed shared-memory picture to the OpenH264 input trait.
struct BorrowedYuv<'a> {
    frame: &'a YuvFrame<'a>,
}

impl YUVSource for BorrowedYuv<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.frame.width as usize, self.frame.height as usize)
    }

    fn y(&self) -> &[u8] {
        self.frame.y
    }

    fn u(&self) -> &[u8] {
        self.frame.u
    }

    fn v(&self) -> &[u8] {
        self.frame.v
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.frame.y_stride, self.frame.uv_stride, self.frame.uv_stride)
    }
}

pub struct OpenH264Codec {
    encoder: Encoder,
    /// Forced-IDR cadence in frames; 0 disables the cadence.
    gop: u32,
    frames_since_idr: u32,
    pending: VecDeque<CodecPacket>,
}

impl OpenH264Codec {
    pub fn open(
        _width: u32,
        _height: u32,
        bitrate: u64,
        gop: i32,
        options: &EncoderOptions,
    ) -> Result<Self, CodecError> {
        let quality: u32 = options
            .get("crf")
            .and_then(|value| value.parse().ok())
            .unwrap_or(23);
        let preset = options.get("preset").unwrap_or("medium");

        let config = EncoderConfig::new()
            .set_bitrate_bps(bitrate as u32)
            .rate_control_mode(rate_control_for(quality))
            .enable_skip_frame(preset_allows_skip(preset))
            .max_frame_rate(60.0);
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self {
            encoder,
            gop: gop.max(0) as u32,
            frames_since_idr: 0,
            pending: VecDeque::new(),
        })
    }
}

impl VideoEncoderCodec for OpenH264Codec {
    fn send_frame(
        &mut self,
        frame: &YuvFrame<'_>,
        pts: i64,
        force_keyframe: bool,
    ) -> Result<(), CodecError> {
        let gop_due = self.gop > 0 && self.frames_since_idr >= self.gop;
        if force_keyframe || gop_due {
            self.encoder.force_intra_frame();
        }
        let source = BorrowedYuv { frame };
        let bitstream = self
            .encoder
            .encode(&source)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        if keyframe {
            self.frames_since_idr = 0;
        }
        self.frames_since_idr += 1;
        let data = bitstream.to_vec();
        if !data.is_empty() {
            self.pending.push_back(CodecPacket {
                data,
                pts,
                keyframe,
            });
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CodecPacket, CodecError> {
        self.pending.pop_front().ok_or(CodecError::TryAgain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_presets_allow_frame_skipping() {
        assert!(preset_allows_skip("ultrafast"));
        assert!(preset_allows_skip("llhp"));
        assert!(!preset_allows_skip("medium"));
        assert!(!preset_allows_skip("slow"));
    }

    fn options(preset: &str, quality: u32) -> EncoderOptions {
        let mut options = EncoderOptions::new();
        options.push("preset", preset);
        options.push("crf", quality.to_string());
        options
    }

    fn encode_one(codec: &mut OpenH264Codec, frame_index: usize, pts: i64) -> Vec<CodecPacket> {
        const W: usize = 64;
        const H: usize = 64;
        let mut y = vec![0x80u8; W * H];
        // Moving bar so consecutive frames differ.
        let bar = (frame_index * 97) % (W * H - 64);
        y[bar..bar + 64].fill(0xF0);
        let u = vec![0x80u8; W * H / 4];
        let v = vec![0x80u8; W * H / 4];
        let frame = YuvFrame {
            width: W as u32,
            height: H as u32,
            y: &y,
            u: &u,
            v: &v,
            y_stride: W,
            uv_stride: W / 2,
        };
        codec.send_frame(&frame, pts, false).unwrap();
        let mut packets = Vec::new();
        while let Ok(packet) = codec.receive_packet() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn gop_forces_periodic_keyframes() {
        let mut codec =
            OpenH264Codec::open(64, 64, 500_000, 2, &options("medium", 23)).unwrap();
        let mut keyframes = Vec::new();
        for index in 0..6 {
            for packet in encode_one(&mut codec, index, index as i64 * 1500) {
                keyframes.push(packet.keyframe);
            }
        }
        assert_eq!(keyframes.len(), 6);
        // First frame is an IDR; the cadence forces one every two frames.
        assert!(keyframes[0]);
        assert!(keyframes[2]);
        assert!(keyframes[4]);
        assert!(!keyframes[1]);
    }

    #[test]
    fn forced_keyframe_resets_the_cadence() {
        let mut codec =
            OpenH264Codec::open(64, 64, 500_000, 100, &options("medium", 23)).unwrap();
        let first = encode_one(&mut codec, 0, 0);
        assert!(first[0].keyframe);
        let second = encode_one(&mut codec, 1, 1500);
        assert!(!second[0].keyframe);

        // An on-demand IDR arrives regardless of the cadence.
        let mut y = vec![0x20u8; 64 * 64];
        y[0..64].fill(0xF0);
        let u = vec![0x80u8; 64 * 64 / 4];
        let v = vec![0x80u8; 64 * 64 / 4];
        let frame = YuvFrame {
            width: 64,
            height: 64,
            y: &y,
            u: &u,
            v: &v,
            y_stride: 64,
            uv_stride: 32,
        };
        codec.send_frame(&frame, 3000, true).unwrap();
        let packet = codec.receive_packet().unwrap();
        assert!(packet.keyframe);
    }
}
