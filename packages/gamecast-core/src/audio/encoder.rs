//! Audio encoder thread.
//!
//! Consumes raw PCM from the capture ring, resamples to the negotiated
//! codec format, encodes, and emits wire packets through the framer. The
//! codec's global header (Ogg head pages, or the fMP4 init segment for AAC)
//! is captured into the init-header buffer before any body packet flows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::codec::{
    audio_caps, negotiate_sample_format, negotiate_sample_rate, open_audio,
};
use crate::config::{AudioCodecKind, AudioConfig};
use crate::container::{Fmp4Container, MediaContainer, OggOpusContainer};
use crate::error::{CodecError, EngineError};
use crate::framer::{Framer, HeaderBuffer, PacketSink};
use crate::protocol::PacketKind;
use crate::shm::{AudioCaptureSource, AudioRing, AudioSampleFormat, Wakeup};
use crate::audio::resampler::AudioResampler;

pub struct AudioEncoder {
    config: AudioConfig,
    capture: Arc<dyn AudioCaptureSource>,
    sink: Arc<dyn PacketSink>,
    header: Arc<HeaderBuffer>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl AudioEncoder {
    pub fn new(
        config: AudioConfig,
        capture: Arc<dyn AudioCaptureSource>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        Self {
            config,
            capture,
            sink,
            header: Arc::new(HeaderBuffer::new(PacketKind::Audio)),
            thread: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// The captured init header (framed); empty until the thread has
    /// written the container header.
    pub fn header(&self) -> Arc<HeaderBuffer> {
        Arc::clone(&self.header)
    }

    pub fn codec(&self) -> AudioCodecKind {
        self.config.codec
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
        capture.signal().clear_stop();
        *thread = Some(std::thread::spawn(move || {
            if let Err(e) = encoding_thread(&config, &capture, sink, header) {
                log::error!("[AudioEncoder] Encoding thread failed: {}", e);
            }
            capture.started_event().reset();
            capture.stopped_event().set();
        }));
    }

    /// Stops and joins the encoding thread.
    pub fn stop(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.capture.signal().signal_stop();
            if let Err(e) = handle.join() {
                log::error!("[AudioEncoder] Thread join failed: {:?}", e);
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
    config: &AudioConfig,
    capture: &Arc<dyn AudioCaptureSource>,
    sink: Arc<dyn PacketSink>,
    header: Arc<HeaderBuffer>,
) -> Result<(), EngineError> {
    let caps = audio_caps(config.codec);

    let (ring_header, region) = capture.open_frames()?;
    let ring = AudioRing::open(region)?;
    let source_format = AudioSampleFormat::from_u32(ring_header.sample_format)
        .unwrap_or(AudioSampleFormat::None);
    let source_rate = capture.source_rate();

    let out_format = negotiate_sample_format(&caps, source_format);
    let out_rate = negotiate_sample_rate(&caps, source_rate);

    let mut codec = open_audio(config.codec, out_rate, out_format, config.bitrate)?;
    let frame_size = codec.frame_size();

    log::info!(
        "[AudioEncoder] {:?}: source {} Hz {:?} x{} -> {} Hz {:?} stereo, frame {}",
        config.codec,
        source_rate,
        source_format,
        ring_header.channels,
        out_rate,
        out_format,
        frame_size
    );

    let resampler = AudioResampler::init(
        ring_header.channels as u16,
        source_format,
        source_rate,
        2,
        out_format,
        out_rate,
        frame_size,
    )?;

    let mut container: Box<dyn MediaContainer> = match config.codec {
        AudioCodecKind::Opus => Box::new(OggOpusContainer::new(out_rate, frame_size)),
        AudioCodecKind::Aac => Box::new(Fmp4Container::new(
            out_rate,
            2,
            config.bitrate as u32,
            frame_size as u32,
        )),
    };
    let mut framer = Framer::new(PacketKind::Audio, header, sink);
    container.write_header(&mut framer)?;

    capture.started_event().set();
    capture.stopped_event().reset();

    let signal = capture.signal();
    let source_samples = ring_header.frame_size as usize;
    let mut last_seen = 0u64;
    let mut next_pts: i64 = 0;

    loop {
        match signal.wait() {
            Wakeup::Stop => {
                log::debug!("[AudioEncoder] Stopping");
                break;
            }
            Wakeup::FrameReady => {}
        }

        while let Some(frame) = ring.latest(last_seen)? {
            last_seen = frame.timestamp;
            resampler.store(&frame.pcm, source_samples)?;
        }

        loop {
            let samples = match resampler.read_frame()? {
                Some(samples) => samples,
                None => break,
            };
            let pts = next_pts;
            next_pts += frame_size as i64;
            if let Err(e) = codec.send_frame(&samples, pts) {
                // Transient per-frame errors are recovered locally.
                log::warn!("[AudioEncoder] send_frame failed: {}", e);
                continue;
            }
            loop {
                match codec.receive_packet() {
                    Ok(packet) => container.write_packet(&packet, &mut framer)?,
                    Err(CodecError::TryAgain) => break,
                    Err(e) => {
                        log::warn!("[AudioEncoder] receive_packet failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
