//! Fixed-slot frame rings over a shared region.
//!
//! Single producer, single consumer. The producer writes slot
//! `count % N`, stamps the slot timestamp last, then pulses the readiness
//! event. The consumer always picks whichever slot holds the newest
//! timestamp rather than the slot the producer most recently named, so a
//! slow consumer drops intermediate frames and a spurious wakeup merely
//! re-reads the same frame.

use std::sync::Arc;

use crate::error::ShmError;
use crate::shm::layout::{
    AudioSampleFormat, FrameStats, PackedAudioFrameHeader, SharedAudioFramesHeader,
    SharedVideoFramesHeader, AUDIO_FRAME_HEADER_LEN, AUDIO_RING_HEADER_LEN, FRAME_STATS_LEN,
    NUM_SHARED_FRAMES, VIDEO_RING_HEADER_LEN,
};
use crate::shm::{read_pod, write_pod, Region};

/// Reference to the newest slot of the YUV ring.
#[derive(Debug, Clone, Copy)]
pub struct YuvFrameRef {
    pub slot: usize,
    pub stats: FrameStats,
}

/// The YUV video frame ring: `{ data_size } || N × { stats || payload }`.
pub struct VideoYuvRing {
    region: Arc<dyn Region>,
    data_size: usize,
}

impl VideoYuvRing {
    /// Region size required for a given packed-frame size.
    pub fn required_len(data_size: usize) -> usize {
        VIDEO_RING_HEADER_LEN + NUM_SHARED_FRAMES * data_size
    }

    /// Opens an existing ring and validates its geometry.
    ///
    /// `expected_payload` is the pixel buffer size derived from the shared
    /// frame info; a mismatched `data_size` is fatal.
    pub fn open(region: Arc<dyn Region>, expected_payload: usize) -> Result<Self, ShmError> {
        let header: SharedVideoFramesHeader = read_pod(&*region, 0)?;
        let data_size = header.data_size as usize;
        let expected = FRAME_STATS_LEN + expected_payload;
        if data_size != expected {
            return Err(ShmError::BadDataSize {
                expected,
                actual: data_size,
            });
        }
        let need = Self::required_len(data_size);
        if region.len() < need {
            return Err(ShmError::RegionTooSmall {
                name: "video yuv frames".into(),
                expected: need,
                actual: region.len(),
            });
        }
        Ok(Self { region, data_size })
    }

    /// Producer side: initializes the ring header.
    pub fn create(region: Arc<dyn Region>, payload_len: usize) -> Result<Self, ShmError> {
        let data_size = FRAME_STATS_LEN + payload_len;
        let need = Self::required_len(data_size);
        if region.len() < need {
            return Err(ShmError::RegionTooSmall {
                name: "video yuv frames".into(),
                expected: need,
                actual: region.len(),
            });
        }
        let header = SharedVideoFramesHeader {
            data_size: data_size as u32,
        };
        write_pod(&*region, 0, &header)?;
        Ok(Self { region, data_size })
    }

    pub fn payload_len(&self) -> usize {
        self.data_size - FRAME_STATS_LEN
    }

    fn slot_offset(&self, slot: usize) -> usize {
        VIDEO_RING_HEADER_LEN + slot * self.data_size
    }

    /// Picks the slot with the maximum timestamp.
    pub fn latest(&self) -> Result<YuvFrameRef, ShmError> {
        let mut best = YuvFrameRef {
            slot: 0,
            stats: read_pod(&*self.region, self.slot_offset(0))?,
        };
        for slot in 1..NUM_SHARED_FRAMES {
            let stats: FrameStats = read_pod(&*self.region, self.slot_offset(slot))?;
            if stats.timestamp > best.stats.timestamp {
                best = YuvFrameRef { slot, stats };
            }
        }
        Ok(best)
    }

    /// Copies `out.len()` payload bytes of `slot` (the YUV planes).
    pub fn read_payload(&self, slot: usize, out: &mut [u8]) -> Result<(), ShmError> {
        debug_assert!(out.len() <= self.payload_len());
        self.region
            .read(self.slot_offset(slot) + FRAME_STATS_LEN, out)
    }

    /// Producer side: writes stats + payload into `slot`. The timestamp
    /// inside `stats` is what makes the slot visible as newest.
    pub fn write_frame(
        &self,
        slot: usize,
        stats: &FrameStats,
        payload: &[u8],
    ) -> Result<(), ShmError> {
        let offset = self.slot_offset(slot);
        self.region.write(offset + FRAME_STATS_LEN, payload)?;
        // Stats (with the timestamp) go last so a torn read never sees a
        // new timestamp over old pixels.
        write_pod(&*self.region, offset, stats)
    }
}

/// One frame drained from the audio ring.
#[derive(Debug, Clone)]
pub struct AudioRingFrame {
    pub timestamp: u64,
    pub pcm: Vec<u8>,
}

/// The audio frame ring: `{ header } || N × { timestamp || pcm }`.
pub struct AudioRing {
    region: Arc<dyn Region>,
    header: SharedAudioFramesHeader,
    frame_bytes: usize,
}

impl AudioRing {
    pub fn required_len(header: &SharedAudioFramesHeader) -> usize {
        AUDIO_RING_HEADER_LEN + NUM_SHARED_FRAMES * (AUDIO_FRAME_HEADER_LEN + header.frame_bytes())
    }

    /// Opens an existing ring, validating the source format header.
    pub fn open(region: Arc<dyn Region>) -> Result<Self, ShmError> {
        let header: SharedAudioFramesHeader = read_pod(&*region, 0)?;
        if AudioSampleFormat::from_u32(header.sample_format).is_none()
            || header.channels == 0
            || header.frame_size == 0
        {
            return Err(ShmError::BadDataSize {
                expected: 0,
                actual: header.frame_bytes(),
            });
        }
        let need = Self::required_len(&header);
        if region.len() < need {
            return Err(ShmError::RegionTooSmall {
                name: "audio frames".into(),
                expected: need,
                actual: region.len(),
            });
        }
        let frame_bytes = header.frame_bytes();
        Ok(Self {
            region,
            header,
            frame_bytes,
        })
    }

    /// Producer side: writes the format header into a fresh region.
    pub fn create(
        region: Arc<dyn Region>,
        header: SharedAudioFramesHeader,
    ) -> Result<Self, ShmError> {
        let need = Self::required_len(&header);
        if region.len() < need {
            return Err(ShmError::RegionTooSmall {
                name: "audio frames".into(),
                expected: need,
                actual: region.len(),
            });
        }
        write_pod(&*region, 0, &header)?;
        let frame_bytes = header.frame_bytes();
        Ok(Self {
            region,
            header,
            frame_bytes,
        })
    }

    pub fn header(&self) -> &SharedAudioFramesHeader {
        &self.header
    }

    fn slot_offset(&self, slot: usize) -> usize {
        AUDIO_RING_HEADER_LEN + slot * (AUDIO_FRAME_HEADER_LEN + self.frame_bytes)
    }

    /// Drains the newest frame if it is newer than `last_seen`.
    pub fn latest(&self, last_seen: u64) -> Result<Option<AudioRingFrame>, ShmError> {
        let mut best_slot = 0usize;
        let mut best: PackedAudioFrameHeader = read_pod(&*self.region, self.slot_offset(0))?;
        for slot in 1..NUM_SHARED_FRAMES {
            let head: PackedAudioFrameHeader = read_pod(&*self.region, self.slot_offset(slot))?;
            if head.timestamp > best.timestamp {
                best = head;
                best_slot = slot;
            }
        }
        if best.timestamp == 0 || best.timestamp <= last_seen {
            return Ok(None);
        }
        let mut pcm = vec![0u8; self.frame_bytes];
        self.region
            .read(self.slot_offset(best_slot) + AUDIO_FRAME_HEADER_LEN, &mut pcm)?;
        Ok(Some(AudioRingFrame {
            timestamp: best.timestamp,
            pcm,
        }))
    }

    /// Producer side: writes PCM then stamps the slot timestamp.
    pub fn write_frame(&self, slot: usize, timestamp: u64, pcm: &[u8]) -> Result<(), ShmError> {
        debug_assert!(pcm.len() <= self.frame_bytes);
        let offset = self.slot_offset(slot);
        self.region.write(offset + AUDIO_FRAME_HEADER_LEN, pcm)?;
        write_pod(&*self.region, offset, &PackedAudioFrameHeader { timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::local::LocalRegion;
    use bytemuck::Zeroable;

    fn stats(timestamp: u64) -> FrameStats {
        FrameStats {
            timestamp,
            ..FrameStats::zeroed()
        }
    }

    #[test]
    fn yuv_reader_picks_newest_slot() {
        let payload = 16usize;
        let region = LocalRegion::with_len(VideoYuvRing::required_len(FRAME_STATS_LEN + payload));
        let ring = VideoYuvRing::create(region.clone(), payload).unwrap();

        ring.write_frame(0, &stats(10), &[0xAA; 16]).unwrap();
        ring.write_frame(1, &stats(11), &[0xBB; 16]).unwrap();

        let newest = ring.latest().unwrap();
        assert_eq!(newest.slot, 1);
        assert_eq!(newest.stats.timestamp, 11);

        // Producer laps the ring: slot 0 is now newest again.
        ring.write_frame(0, &stats(12), &[0xCC; 16]).unwrap();
        let newest = ring.latest().unwrap();
        assert_eq!(newest.slot, 0);
        let mut out = [0u8; 16];
        ring.read_payload(newest.slot, &mut out).unwrap();
        assert_eq!(out, [0xCC; 16]);
    }

    #[test]
    fn yuv_open_rejects_mismatched_data_size() {
        let payload = 16usize;
        let region = LocalRegion::with_len(VideoYuvRing::required_len(FRAME_STATS_LEN + payload));
        VideoYuvRing::create(region.clone(), payload).unwrap();
        let err = VideoYuvRing::open(region, payload + 4).unwrap_err();
        assert!(matches!(err, ShmError::BadDataSize { .. }));
    }

    fn audio_header() -> SharedAudioFramesHeader {
        let mut header = SharedAudioFramesHeader::zeroed();
        header.channels = 2;
        header.frame_size = 4;
        header.sample_bits = 16;
        header.sample_format = AudioSampleFormat::I16 as u32;
        header
    }

    #[test]
    fn audio_ring_drains_only_new_frames() {
        let header = audio_header();
        let region = LocalRegion::with_len(AudioRing::required_len(&header));
        let ring = AudioRing::create(region, header).unwrap();

        assert!(ring.latest(0).unwrap().is_none());

        ring.write_frame(0, 5, &[1u8; 16]).unwrap();
        let frame = ring.latest(0).unwrap().unwrap();
        assert_eq!(frame.timestamp, 5);
        assert_eq!(frame.pcm, vec![1u8; 16]);

        // Already consumed: nothing newer than 5.
        assert!(ring.latest(5).unwrap().is_none());

        ring.write_frame(1, 6, &[2u8; 16]).unwrap();
        let frame = ring.latest(5).unwrap().unwrap();
        assert_eq!(frame.timestamp, 6);
    }

    #[test]
    fn audio_open_rejects_bad_header() {
        let mut header = audio_header();
        header.sample_format = 77;
        let region = LocalRegion::with_len(1024);
        crate::shm::write_pod(&*region, 0, &header).unwrap();
        assert!(AudioRing::open(region).is_err());
    }
}
