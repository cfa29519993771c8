//! Fragmented MP4 container for AAC.
//!
//! The init header is the `ftyp` + `moov` pair (two header-phase callbacks,
//! which is why the init-header buffer accumulates). Every packet becomes
//! its own `moof`+`mdat` fragment so the bitstream flushes after each frame.

use crate::codec::CodecPacket;
use crate::container::{audio_specific_config, ContainerOutput, MediaContainer};
use crate::error::CodecError;

const TRACK_ID: u32 = 1;

fn mp4_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.push(version);
    inner.extend_from_slice(&flags.to_be_bytes()[1..]);
    inner.extend_from_slice(payload);
    mp4_box(fourcc, &inner)
}

fn descriptor(tag: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() < 128);
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(tag);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

pub struct Fmp4Container {
    sample_rate: u32,
    channels: u8,
    bitrate: u32,
    /// Samples per channel per packet (AAC-LC: 1024).
    frame_size: u32,
    sequence: u32,
    decode_time: u64,
}

impl Fmp4Container {
    pub fn new(sample_rate: u32, channels: u8, bitrate: u32, frame_size: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bitrate,
            frame_size,
            sequence: 0,
            decode_time: 0,
        }
    }

    fn esds(&self) -> Vec<u8> {
        let asc = audio_specific_config(self.sample_rate, self.channels);

        let mut decoder_config = Vec::new();
        decoder_config.push(0x40); // object type: ISO/IEC 14496-3 audio
        decoder_config.push(0x15); // stream type: audio, upstream 0, reserved 1
        decoder_config.extend_from_slice(&[0, 0, 0]); // buffer size
        decoder_config.extend_from_slice(&self.bitrate.to_be_bytes()); // max
        decoder_config.extend_from_slice(&self.bitrate.to_be_bytes()); // avg
        decoder_config.extend_from_slice(&descriptor(0x05, &asc));

        let mut es = Vec::new();
        es.extend_from_slice(&(TRACK_ID as u16).to_be_bytes());
        es.push(0); // no stream priority/flags
        es.extend_from_slice(&descriptor(0x04, &decoder_config));
        es.extend_from_slice(&descriptor(0x06, &[0x02])); // SL config

        full_box(b"esds", 0, 0, &descriptor(0x03, &es))
    }

    fn mp4a(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0u8; 6]); // reserved
        payload.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        payload.extend_from_slice(&[0u8; 8]); // reserved
        payload.extend_from_slice(&(self.channels as u16).to_be_bytes());
        payload.extend_from_slice(&16u16.to_be_bytes()); // sample size
        payload.extend_from_slice(&[0u8; 4]); // pre-defined + reserved
        payload.extend_from_slice(&((self.sample_rate as u32) << 16).to_be_bytes());
        payload.extend_from_slice(&self.esds());
        mp4_box(b"mp4a", &payload)
    }

    fn moov(&self) -> Vec<u8> {
        let timescale = self.sample_rate;

        let mut mvhd = Vec::new();
        mvhd.extend_from_slice(&[0u8; 8]); // creation/modification
        mvhd.extend_from_slice(&1000u32.to_be_bytes()); // movie timescale
        mvhd.extend_from_slice(&0u32.to_be_bytes()); // duration unknown
        mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        mvhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        mvhd.extend_from_slice(&[0u8; 10]); // reserved
        for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            mvhd.extend_from_slice(&value.to_be_bytes()); // unity matrix
        }
        mvhd.extend_from_slice(&[0u8; 24]); // pre-defined
        mvhd.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next track id
        let mvhd = full_box(b"mvhd", 0, 0, &mvhd);

        let mut tkhd = Vec::new();
        tkhd.extend_from_slice(&[0u8; 8]);
        tkhd.extend_from_slice(&TRACK_ID.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 4]); // reserved
        tkhd.extend_from_slice(&0u32.to_be_bytes()); // duration
        tkhd.extend_from_slice(&[0u8; 8]); // reserved
        tkhd.extend_from_slice(&0u16.to_be_bytes()); // layer
        tkhd.extend_from_slice(&1u16.to_be_bytes()); // alternate group (audio)
        tkhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
        tkhd.extend_from_slice(&[0u8; 2]);
        for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            tkhd.extend_from_slice(&value.to_be_bytes());
        }
        tkhd.extend_from_slice(&[0u8; 8]); // width/height 0 for audio
        let tkhd = full_box(b"tkhd", 0, 0x000007, &tkhd);

        let mut mdhd = Vec::new();
        mdhd.extend_from_slice(&[0u8; 8]);
        mdhd.extend_from_slice(&timescale.to_be_bytes());
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&0x55C4u16.to_be_bytes()); // und language
        mdhd.extend_from_slice(&[0u8; 2]);
        let mdhd = full_box(b"mdhd", 0, 0, &mdhd);

        let mut hdlr = Vec::new();
        hdlr.extend_from_slice(&[0u8; 4]);
        hdlr.extend_from_slice(b"soun");
        hdlr.extend_from_slice(&[0u8; 12]);
        hdlr.extend_from_slice(b"SoundHandler\0");
        let hdlr = full_box(b"hdlr", 0, 0, &hdlr);

        let smhd = full_box(b"smhd", 0, 0, &[0u8; 4]);
        let url = full_box(b"url ", 0, 1, &[]);
        let mut dref_payload = 1u32.to_be_bytes().to_vec();
        dref_payload.extend_from_slice(&url);
        let dref = full_box(b"dref", 0, 0, &dref_payload);
        let dinf = mp4_box(b"dinf", &dref);

        let mut stsd_payload = 1u32.to_be_bytes().to_vec();
        stsd_payload.extend_from_slice(&self.mp4a());
        let stsd = full_box(b"stsd", 0, 0, &stsd_payload);
        let stts = full_box(b"stts", 0, 0, &0u32.to_be_bytes());
        let stsc = full_box(b"stsc", 0, 0, &0u32.to_be_bytes());
        let stsz = full_box(b"stsz", 0, 0, &[0u8; 8]);
        let stco = full_box(b"stco", 0, 0, &0u32.to_be_bytes());

        let mut stbl_payload = stsd;
        stbl_payload.extend_from_slice(&stts);
        stbl_payload.extend_from_slice(&stsc);
        stbl_payload.extend_from_slice(&stsz);
        stbl_payload.extend_from_slice(&stco);
        let stbl = mp4_box(b"stbl", &stbl_payload);

        let mut minf_payload = smhd;
        minf_payload.extend_from_slice(&dinf);
        minf_payload.extend_from_slice(&stbl);
        let minf = mp4_box(b"minf", &minf_payload);

        let mut mdia_payload = mdhd;
        mdia_payload.extend_from_slice(&hdlr);
        mdia_payload.extend_from_slice(&minf);
        let mdia = mp4_box(b"mdia", &mdia_payload);

        let mut trak_payload = tkhd;
        trak_payload.extend_from_slice(&mdia);
        let trak = mp4_box(b"trak", &trak_payload);

        let mut trex = Vec::new();
        trex.extend_from_slice(&TRACK_ID.to_be_bytes());
        trex.extend_from_slice(&1u32.to_be_bytes()); // default description index
        trex.extend_from_slice(&self.frame_size.to_be_bytes()); // default duration
        trex.extend_from_slice(&[0u8; 8]); // default size/flags
        let trex = full_box(b"trex", 0, 0, &trex);
        let mvex = mp4_box(b"mvex", &trex);

        let mut moov_payload = mvhd;
        moov_payload.extend_from_slice(&trak);
        moov_payload.extend_from_slice(&mvex);
        mp4_box(b"moov", &moov_payload)
    }

    fn moof(&self, data_len: usize) -> Vec<u8> {
        let mfhd = full_box(b"mfhd", 0, 0, &self.sequence.to_be_bytes());

        // default-base-is-moof
        let tfhd = full_box(b"tfhd", 0, 0x0002_0000, &TRACK_ID.to_be_bytes());

        let mut tfdt = Vec::new();
        tfdt.extend_from_slice(&self.decode_time.to_be_bytes());
        let tfdt = full_box(b"tfdt", 1, 0, &tfdt);

        // data-offset + sample-duration + sample-size present
        let mut trun = Vec::new();
        trun.extend_from_slice(&1u32.to_be_bytes()); // sample count
        trun.extend_from_slice(&0i32.to_be_bytes()); // data offset placeholder
        trun.extend_from_slice(&self.frame_size.to_be_bytes());
        trun.extend_from_slice(&(data_len as u32).to_be_bytes());
        let trun = full_box(b"trun", 0, 0x000301, &trun);

        let mut traf_payload = tfhd;
        traf_payload.extend_from_slice(&tfdt);
        traf_payload.extend_from_slice(&trun);
        let traf = mp4_box(b"traf", &traf_payload);

        let mut moof_payload = mfhd;
        moof_payload.extend_from_slice(&traf);
        let mut moof = mp4_box(b"moof", &moof_payload);

        // Patch the trun data offset: first mdat payload byte relative to
        // the moof start. The data-offset field sits 12 bytes from the end
        // of the moof box (offset i32, duration u32, size u32).
        let data_offset = (moof.len() + 8) as i32;
        let patch_at = moof.len() - 12;
        moof[patch_at..patch_at + 4].copy_from_slice(&data_offset.to_be_bytes());
        moof
    }
}

impl MediaContainer for Fmp4Container {
    fn write_header(&mut self, out: &mut dyn ContainerOutput) -> Result<(), CodecError> {
        let mut ftyp = Vec::new();
        ftyp.extend_from_slice(b"iso5");
        ftyp.extend_from_slice(&1u32.to_be_bytes()); // minor version
        ftyp.extend_from_slice(b"isomiso5dash");
        out.on_header(&mp4_box(b"ftyp", &ftyp));
        out.on_header(&self.moov());
        Ok(())
    }

    fn write_packet(
        &mut self,
        packet: &CodecPacket,
        out: &mut dyn ContainerOutput,
    ) -> Result<(), CodecError> {
        self.sequence += 1;
        let mut fragment = self.moof(packet.data.len());
        fragment.extend_from_slice(&mp4_box(b"mdat", &packet.data));
        self.decode_time += u64::from(self.frame_size);
        out.on_packet(&fragment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::CollectingOutput;

    fn walk_boxes(data: &[u8]) -> Vec<([u8; 4], usize)> {
        let mut boxes = Vec::new();
        let mut i = 0;
        while i + 8 <= data.len() {
            let size = u32::from_be_bytes(data[i..i + 4].try_into().unwrap()) as usize;
            let fourcc: [u8; 4] = data[i + 4..i + 8].try_into().unwrap();
            boxes.push((fourcc, size));
            if size < 8 {
                break;
            }
            i += size;
        }
        boxes
    }

    #[test]
    fn init_header_is_ftyp_then_moov_in_two_callbacks() {
        let mut container = Fmp4Container::new(48_000, 2, 128_000, 1024);
        let mut out = CollectingOutput::default();
        container.write_header(&mut out).unwrap();

        assert_eq!(out.header_calls, 2);
        let boxes = walk_boxes(&out.header);
        assert_eq!(boxes[0].0, *b"ftyp");
        assert_eq!(boxes[1].0, *b"moov");
        assert_eq!(boxes[0].1 + boxes[1].1, out.header.len());
    }

    #[test]
    fn each_packet_is_one_fragment() {
        let mut container = Fmp4Container::new(48_000, 2, 128_000, 1024);
        let mut out = CollectingOutput::default();
        let packet = CodecPacket {
            data: vec![0xAB; 100],
            pts: 0,
            keyframe: true,
        };
        container.write_packet(&packet, &mut out).unwrap();
        container.write_packet(&packet, &mut out).unwrap();

        assert_eq!(out.packets.len(), 2);
        for fragment in &out.packets {
            let boxes = walk_boxes(fragment);
            assert_eq!(boxes[0].0, *b"moof");
            assert_eq!(boxes[1].0, *b"mdat");
            assert_eq!(boxes[1].1, 8 + 100);
        }
    }

    #[test]
    fn trun_data_offset_points_at_mdat_payload() {
        let mut container = Fmp4Container::new(48_000, 2, 128_000, 1024);
        let mut out = CollectingOutput::default();
        let packet = CodecPacket {
            data: vec![0xCD; 32],
            pts: 0,
            keyframe: true,
        };
        container.write_packet(&packet, &mut out).unwrap();

        let fragment = &out.packets[0];
        let moof_len = u32::from_be_bytes(fragment[0..4].try_into().unwrap()) as usize;
        let offset_at = moof_len - 12;
        let data_offset =
            i32::from_be_bytes(fragment[offset_at..offset_at + 4].try_into().unwrap()) as usize;
        assert_eq!(&fragment[data_offset..data_offset + 4], &[0xCD; 4]);
    }
}
