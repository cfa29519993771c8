//! Ogg encapsulation for Opus.
//!
//! The init header is the identification page (OpusHead) followed by the
//! comment page (OpusTags), delivered as two header-phase callbacks. Each
//! packet then
//! gets its own page so the bitstream flushes promptly; granule positions
//! count 48 kHz samples regardless of the coding rate.

use crate::codec::CodecPacket;
use crate::container::{ContainerOutput, MediaContainer};
use crate::error::CodecError;

const VENDOR: &[u8] = b"gamecast";

/// Ogg page CRC: polynomial 0x04C11DB7, no reflection, zero init/xorout.
fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

pub struct OggOpusContainer {
    serial: u32,
    page_seq: u32,
    granule: u64,
    /// Granule increment per packet in 48 kHz units.
    samples_per_packet_48k: u64,
    preskip: u16,
    sample_rate: u32,
}

impl OggOpusContainer {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            serial: 0x6361_7374, // fixed stream serial
            page_seq: 0,
            granule: 0,
            samples_per_packet_48k: frame_size as u64 * 48_000 / sample_rate.max(1) as u64,
            preskip: 312,
            sample_rate,
        }
    }

    fn page(&mut self, packet: &[u8], header_type: u8, granule: u64) -> Vec<u8> {
        // Lacing: 255-byte segments with a terminating short segment.
        let mut lacing = Vec::new();
        let mut remaining = packet.len();
        loop {
            if remaining >= 255 {
                lacing.push(255u8);
                remaining -= 255;
            } else {
                lacing.push(remaining as u8);
                break;
            }
        }

        let mut page = Vec::with_capacity(27 + lacing.len() + packet.len());
        page.extend_from_slice(b"OggS");
        page.push(0); // stream structure version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.page_seq.to_le_bytes());
        self.page_seq += 1;
        page.extend_from_slice(&[0u8; 4]); // crc placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(packet);

        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    fn opus_head(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(2); // stereo
        head.extend_from_slice(&self.preskip.to_le_bytes());
        head.extend_from_slice(&self.sample_rate.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes()); // output gain
        head.push(0); // channel mapping family
        head
    }

    fn opus_tags(&self) -> Vec<u8> {
        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
        tags.extend_from_slice(VENDOR);
        tags.extend_from_slice(&0u32.to_le_bytes()); // no user comments
        tags
    }
}

impl MediaContainer for OggOpusContainer {
    fn write_header(&mut self, out: &mut dyn ContainerOutput) -> Result<(), CodecError> {
        let head = self.opus_head();
        let page = self.page(&head, 0x02, 0); // BOS
        out.on_header(&page);
        let tags = self.opus_tags();
        let page = self.page(&tags, 0x00, 0);
        out.on_header(&page);
        Ok(())
    }

    fn write_packet(
        &mut self,
        packet: &CodecPacket,
        out: &mut dyn ContainerOutput,
    ) -> Result<(), CodecError> {
        self.granule += self.samples_per_packet_48k;
        let page = self.page(&packet.data, 0x00, self.granule);
        out.on_packet(&page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::CollectingOutput;

    #[test]
    fn header_is_two_pages() {
        let mut container = OggOpusContainer::new(48_000, 960);
        let mut out = CollectingOutput::default();
        container.write_header(&mut out).unwrap();

        assert_eq!(out.header_calls, 2);
        assert_eq!(&out.header[..4], b"OggS");
        // First page flagged BOS.
        assert_eq!(out.header[5], 0x02);
        assert!(out
            .header
            .windows(8)
            .any(|window| window == b"OpusHead"));
        assert!(out.header.windows(8).any(|window| window == b"OpusTags"));
    }

    #[test]
    fn granule_advances_in_48k_units() {
        // 20 ms at 24 kHz coding rate is still 960 samples at 48 kHz.
        let mut container = OggOpusContainer::new(24_000, 480);
        let mut out = CollectingOutput::default();
        let packet = CodecPacket {
            data: vec![0xFC, 1, 2, 3],
            pts: 0,
            keyframe: true,
        };
        container.write_packet(&packet, &mut out).unwrap();
        container.write_packet(&packet, &mut out).unwrap();

        assert_eq!(out.packets.len(), 2);
        let granule = u64::from_le_bytes(out.packets[1][6..14].try_into().unwrap());
        assert_eq!(granule, 1920);
    }

    #[test]
    fn pages_carry_valid_crc() {
        let mut container = OggOpusContainer::new(48_000, 960);
        let mut out = CollectingOutput::default();
        let packet = CodecPacket {
            data: vec![0u8; 300], // spans two lacing segments
            pts: 0,
            keyframe: true,
        };
        container.write_packet(&packet, &mut out).unwrap();

        let page = &out.packets[0];
        let stored = u32::from_le_bytes(page[22..26].try_into().unwrap());
        let mut zeroed = page.clone();
        zeroed[22..26].fill(0);
        assert_eq!(stored, ogg_crc(&zeroed));
        // 300 bytes lace as 255 + 45.
        assert_eq!(page[26], 2);
        assert_eq!(&page[27..29], &[255, 45]);
    }
}
