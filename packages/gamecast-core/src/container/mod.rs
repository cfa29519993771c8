//! Output containers matched to the codecs.
//!
//! A container wraps codec packets for the wire: `annexb` for the raw
//! H.264 byte stream, `oggopus` for Opus, `fmp4` (fragmented MP4,
//! one fragment per packet) for AAC.
//!
//! Output is split into two phases through [`ContainerOutput`]: header-phase
//! chunks form the codec init header (they may arrive in several callbacks
//! and are accumulated downstream), body-phase packets are the stream
//! payload. Once the first body packet is emitted the header is sealed and
//! `on_header` is never called again.

mod annexb;
mod fmp4;
mod oggopus;

pub use annexb::AnnexBContainer;
pub use fmp4::Fmp4Container;
pub use oggopus::OggOpusContainer;

use crate::codec::CodecPacket;
use crate::error::CodecError;

/// Two-phase container sink.
pub trait ContainerOutput {
    fn on_header(&mut self, chunk: &[u8]);
    fn on_packet(&mut self, packet: &[u8]);
}

/// A wire container for one elementary stream.
pub trait MediaContainer: Send {
    /// Emits whatever global header bytes are known up front. Containers
    /// whose parameter sets only exist after the first encode emit them
    /// from `write_packet` instead.
    fn write_header(&mut self, out: &mut dyn ContainerOutput) -> Result<(), CodecError>;

    /// Wraps and emits one codec packet. Implementations flush eagerly:
    /// every call produces its output immediately to preserve low-latency
    /// framing.
    fn write_packet(
        &mut self,
        packet: &CodecPacket,
        out: &mut dyn ContainerOutput,
    ) -> Result<(), CodecError>;
}

/// MPEG-4 AudioSpecificConfig for AAC-LC.
pub fn audio_specific_config(sample_rate: u32, channels: u8) -> Vec<u8> {
    let rate_index = match sample_rate {
        96_000 => 0u8,
        88_200 => 1,
        64_000 => 2,
        48_000 => 3,
        44_100 => 4,
        32_000 => 5,
        24_000 => 6,
        22_050 => 7,
        16_000 => 8,
        12_000 => 9,
        11_025 => 10,
        8_000 => 11,
        _ => 15, // explicit frequency escape; callers stick to the table
    };
    let object_type = 2u8; // AAC-LC
    vec![
        (object_type << 3) | (rate_index >> 1),
        ((rate_index & 1) << 7) | (channels << 3),
    ]
}

/// Test/utility sink collecting both phases.
#[derive(Default)]
pub struct CollectingOutput {
    pub header: Vec<u8>,
    pub packets: Vec<Vec<u8>>,
    pub header_calls: usize,
}

impl ContainerOutput for CollectingOutput {
    fn on_header(&mut self, chunk: &[u8]) {
        self.header.extend_from_slice(chunk);
        self.header_calls += 1;
    }

    fn on_packet(&mut self, packet: &[u8]) {
        self.packets.push(packet.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asc_for_48k_stereo() {
        // AAC-LC, rate index 3, 2 channels: 0x11 0x90.
        assert_eq!(audio_specific_config(48_000, 2), vec![0x11, 0x90]);
    }

    #[test]
    fn asc_for_44k_stereo() {
        assert_eq!(audio_specific_config(44_100, 2), vec![0x12, 0x10]);
    }
}
