//! Video encoder thread.
//!
//! Geometry is unknown until the capture agent produces its first frame, so
//! initialization is deferred: wait for the first readiness pulse, read the
//! shared frame info, open the ring sized to that geometry, then open the
//! codec. A mid-session geometry change makes the thread exit cleanly with
//! a restart request; the engine recreates the component so clients keep
//! their connection and simply receive a fresh init header.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use crate::codec::YuvFrame;
use crate::config::VideoConfig;
use crate::container::{AnnexBContainer, MediaContainer};
use crate::error::{CodecError, EngineError};
use crate::framer::{Framer, HeaderBuffer, PacketSink};
use crate::protocol::PacketKind;
use crate::shm::{VideoCaptureSource, VideoFrameType, VideoYuvRing, Wakeup};
use crate::video::options::{
    encoder_options, open_video_codec, resolve_backend, VideoEncodeParams, H264_TIME_BASE,
};

/// How an encoding run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoderEnd {
    Stopped,
    /// Source dimensions changed; the engine should recreate the encoder.
    GeometryChanged,
}

pub struct VideoEncoder {
    config: VideoConfig,
    capture: Arc<dyn VideoCaptureSource>,
    sink: Arc<dyn PacketSink>,
    header: Arc<HeaderBuffer>,
    keyframe_requested: Arc<AtomicBool>,
    restart: Arc<dyn Fn() + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl VideoEncoder {
    pub fn new(
        config: VideoConfig,
        capture: Arc<dyn VideoCaptureSource>,
        sink: Arc<dyn PacketSink>,
        restart: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            config,
            capture,
            sink,
            header: Arc::new(HeaderBuffer::new(PacketKind::Video)),
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            restart,
            thread: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn header(&self) -> Arc<HeaderBuffer> {
        Arc::clone(&self.header)
    }

    /// One-shot: the next submitted frame is marked forced-IDR. Used on
    /// authorization so a new client can decode immediately.
    pub fn produce_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::SeqCst);
    }

    /// Spawns the encoding thread. Idempotent while running.
    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let config = self.config.clone();
        let capture = Arc::clone(&self.capture);
        let sink = Arc::clone(&self.sink);
        let header = Arc::clone(&self.header);
        let keyframe = Arc::clone(&self.keyframe_requested);
        let restart = Arc::clone(&self.restart);
        capture.signal().clear_stop();
        *thread = Some(std::thread::spawn(move || {
            let end = encoding_thread(&config, &capture, sink, header, keyframe);
            capture.started_event().reset();
            capture.stopped_event().set();
            match end {
                Ok(VideoEncoderEnd::GeometryChanged) => restart(),
                Ok(VideoEncoderEnd::Stopped) => {}
                Err(e) => log::error!("[VideoEncoder] Encoding thread failed: {}", e),
            }
        }));
    }

    /// Stops and joins the encoding thread.
    pub fn stop(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.capture.signal().signal_stop();
            if let Err(e) = handle.join() {
                log::error!("[VideoEncoder] Thread join failed: {:?}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.header.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn encoding_thread(
    config: &VideoConfig,
    capture: &Arc<dyn VideoCaptureSource>,
    sink: Arc<dyn PacketSink>,
    header: Arc<HeaderBuffer>,
    keyframe_requested: Arc<AtomicBool>,
) -> Result<VideoEncoderEnd, EngineError> {
    let signal = capture.signal();
    capture.started_event().set();
    capture.stopped_event().reset();

    // Dimensions are unknown until the first frame arrives.
    match signal.wait() {
        Wakeup::Stop => return Ok(VideoEncoderEnd::Stopped),
        Wakeup::FrameReady => {}
    }

    let saved_info = capture.frame_info()?;
    log::info!(
        "[VideoEncoder] First frame: timestamp {}, type {}, dimension {} x {}, format {}",
        saved_info.timestamp,
        saved_info.frame_type,
        saved_info.width,
        saved_info.height,
        saved_info.format
    );

    let frame_type =
        VideoFrameType::from_u32(saved_info.frame_type).unwrap_or(VideoFrameType::None);
    if !frame_type.is_cpu_yuv() {
        return Err(EngineError::Resource(format!(
            "unsupported video frame type {}",
            saved_info.frame_type
        )));
    }

    // The shared buffer is sized generously at 4 bytes per pixel.
    let pixel_size = 4 * saved_info.width as usize * saved_info.height as usize;
    let region = capture.open_yuv_frames(VideoYuvRing::required_len(
        crate::shm::FRAME_STATS_LEN + pixel_size,
    ))?;
    let ring = VideoYuvRing::open(region, pixel_size)?;

    // Encoded resolution is the source rounded down to even.
    let width = saved_info.width & !1;
    let height = saved_info.height & !1;

    let backend = resolve_backend(config.backend);
    let options = encoder_options(config.effective_preset(), config.quality);
    log::info!(
        "[VideoEncoder] openh264 {}x{} bitrate {} gop {} options {:?}",
        width,
        height,
        config.bitrate,
        config.gop,
        options.pairs()
    );
    let params = VideoEncodeParams {
        width,
        height,
        bitrate: config.bitrate,
        gop: config.gop,
        options,
    };
    let mut codec = open_video_codec(backend, &params)?;

    let mut container = AnnexBContainer::new();
    let mut framer = Framer::new(PacketKind::Video, header, sink);
    container.write_header(&mut framer)?;

    let y_len = width as usize * height as usize;
    let uv_len = y_len / 4;
    let mut pixels = vec![0u8; y_len + 2 * uv_len];
    let startup = Instant::now();

    loop {
        if let Err(e) = encode_latest(
            &ring,
            &mut pixels,
            width,
            height,
            startup,
            &keyframe_requested,
            codec.as_mut(),
            &mut container,
            &mut framer,
        ) {
            // Per-frame failures are logged and the loop continues.
            log::warn!("[VideoEncoder] encode failed: {}", e);
        }

        match signal.wait() {
            Wakeup::Stop => return Ok(VideoEncoderEnd::Stopped),
            Wakeup::FrameReady => {}
        }

        let info = capture.frame_info()?;
        if info.width != saved_info.width || info.height != saved_info.height {
            log::info!(
                "[VideoEncoder] Video dimension changed to {} x {}",
                info.width,
                info.height
            );
            return Ok(VideoEncoderEnd::GeometryChanged);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_latest(
    ring: &VideoYuvRing,
    pixels: &mut [u8],
    width: u32,
    height: u32,
    startup: Instant,
    keyframe_requested: &AtomicBool,
    codec: &mut dyn crate::codec::VideoEncoderCodec,
    container: &mut AnnexBContainer,
    framer: &mut Framer,
) -> Result<(), EngineError> {
    let newest = ring.latest()?;
    log::trace!("[VideoEncoder] latest video frame {}", newest.stats.timestamp);
    ring.read_payload(newest.slot, pixels)?;

    let y_len = width as usize * height as usize;
    let uv_len = y_len / 4;
    let frame = YuvFrame {
        width,
        height,
        y: &pixels[..y_len],
        u: &pixels[y_len..y_len + uv_len],
        v: &pixels[y_len + uv_len..y_len + 2 * uv_len],
        y_stride: width as usize,
        uv_stride: width as usize / 2,
    };

    // Wall-clock pts in 1/90000 ticks since the first frame.
    let elapsed = startup.elapsed().as_secs_f64();
    let pts = (elapsed * H264_TIME_BASE as f64).round() as i64;
    let force_keyframe = keyframe_requested.swap(false, Ordering::SeqCst);

    codec
        .send_frame(&frame, pts, force_keyframe)
        .map_err(EngineError::from)?;
    loop {
        match codec.receive_packet() {
            Ok(packet) => container.write_packet(&packet, framer)?,
            Err(CodecError::TryAgain) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NetPacketHeader;
    use crate::shm::local::LocalVideoCapture;
    use crate::shm::{FrameStats, SharedVideoFrameInfo};
    use bytes::Bytes;
    use bytemuck::Zeroable;
    use std::time::Duration;

    struct CollectingSink {
        packets: parking_lot::Mutex<Vec<Bytes>>,
    }

    impl crate::framer::PacketSink for CollectingSink {
        fn send(&self, packet: Bytes) -> usize {
            self.packets.lock().push(packet);
            1
        }
    }

    const W: u32 = 64;
    const H: u32 = 64;

    fn frame_info(width: u32, height: u32) -> SharedVideoFrameInfo {
        SharedVideoFrameInfo {
            timestamp: 1,
            frame_type: VideoFrameType::I420 as u32,
            width,
            height,
            format: 0,
            window: 0,
        }
    }

    fn produce_frame(capture: &LocalVideoCapture, ring: &VideoYuvRing, slot: usize, ts: u64) {
        let pixel_size = 4 * (W * H) as usize;
        let mut payload = vec![0u8; pixel_size];
        // Gray picture with a moving bar so the encoder sees motion.
        let y_len = (W * H) as usize;
        payload[..y_len].fill(0x80);
        let bar = (ts as usize * 8) % y_len;
        payload[bar..y_len.min(bar + 64)].fill(0xF0);
        payload[y_len..y_len + y_len / 2].fill(0x80);
        let stats = FrameStats {
            timestamp: ts,
            ..FrameStats::zeroed()
        };
        ring.write_frame(slot, &stats, &payload).unwrap();
        capture.signal_frame();
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !predicate() {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {}",
                what
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn software_config() -> VideoConfig {
        VideoConfig {
            backend: crate::config::VideoBackend::Software,
            ..VideoConfig::default()
        }
    }

    #[test]
    fn init_header_is_captured_before_first_body_packet() {
        let capture = LocalVideoCapture::new();
        capture.publish_frame_info(&frame_info(W, H)).unwrap();
        let pixel_size = 4 * (W * H) as usize;
        let region = capture.create_frames_region(VideoYuvRing::required_len(
            crate::shm::FRAME_STATS_LEN + pixel_size,
        ));
        let ring = VideoYuvRing::create(region, pixel_size).unwrap();

        let sink = Arc::new(CollectingSink {
            packets: parking_lot::Mutex::new(Vec::new()),
        });
        let encoder = VideoEncoder::new(
            software_config(),
            capture.clone() as Arc<dyn VideoCaptureSource>,
            sink.clone(),
            Arc::new(|| {}),
        );
        encoder.start();

        for ts in 1..=5u64 {
            produce_frame(&capture, &ring, (ts as usize - 1) % 2, ts);
            std::thread::sleep(Duration::from_millis(25));
        }
        wait_for("video packets", || !sink.packets.lock().is_empty());

        // The init header run (SPS/PPS) is a single well-formed packet.
        let init = encoder.header().bytes();
        assert!(!init.is_empty());
        let init_header = NetPacketHeader::decode(&init).unwrap();
        assert_eq!(init_header.kind, PacketKind::Video);
        assert_eq!(init.len(), NetPacketHeader::LEN + init_header.size as usize);

        let packets = sink.packets.lock();
        let body_header = NetPacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(body_header.kind, PacketKind::Video);
        assert_eq!(
            body_header.size as usize,
            packets[0].len() - NetPacketHeader::LEN
        );
        drop(packets);
        encoder.stop();
    }

    #[test]
    fn geometry_change_requests_exactly_one_restart() {
        let capture = LocalVideoCapture::new();
        capture.publish_frame_info(&frame_info(W, H)).unwrap();
        let pixel_size = 4 * (W * H) as usize;
        let region = capture.create_frames_region(VideoYuvRing::required_len(
            crate::shm::FRAME_STATS_LEN + pixel_size,
        ));
        let ring = VideoYuvRing::create(region, pixel_size).unwrap();

        let restarts = Arc::new(AtomicBool::new(false));
        let restart_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let flag = Arc::clone(&restarts);
        let count = Arc::clone(&restart_count);
        let sink = Arc::new(CollectingSink {
            packets: parking_lot::Mutex::new(Vec::new()),
        });
        let encoder = VideoEncoder::new(
            software_config(),
            capture.clone() as Arc<dyn VideoCaptureSource>,
            sink,
            Arc::new(move || {
                flag.store(true, Ordering::SeqCst);
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        encoder.start();

        produce_frame(&capture, &ring, 0, 1);
        std::thread::sleep(Duration::from_millis(50));

        // Capture agent switches to a smaller mode.
        capture.publish_frame_info(&frame_info(32, 32)).unwrap();
        produce_frame(&capture, &ring, 1, 2);

        wait_for("restart request", || restarts.load(Ordering::SeqCst));
        encoder.stop();
        assert_eq!(restart_count.load(Ordering::SeqCst), 1);
    }
}
