//! Audio resampler: channel, sample-format and sample-rate conversion with
//! a FIFO delivering exactly-sized frames to the encoder.
//!
//! `store` accepts whatever the capture side produced; `read_frame` drains
//! exactly `frame_size` output samples per call or reports would-block.
//! All operations are mutually excluded by a single internal lock. Rate
//! conversion only exists when input and output rates differ; otherwise the
//! data path is a pass-through (format/channel mapping is lossless
//! bookkeeping either way).

use std::collections::VecDeque;

use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::codec::SampleBuf;
use crate::error::ResampleError;
use crate::shm::AudioSampleFormat;

/// Input chunk the rate converter consumes at a time. Residual samples wait
/// for the next `store`.
const RESAMPLE_CHUNK: usize = 1024;

struct Inner {
    in_rate: u32,
    in_channels: usize,
    in_format: AudioSampleFormat,
    out_rate: u32,
    out_channels: usize,
    out_format: AudioSampleFormat,
    frame_size: usize,
    converter: Option<FastFixedIn<f32>>,
    /// Planar input awaiting a full converter chunk.
    pending: Vec<VecDeque<f32>>,
    /// Interleaved output samples ready for `read_frame`.
    fifo: VecDeque<f32>,
}

pub struct AudioResampler {
    inner: Mutex<Inner>,
}

impl AudioResampler {
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        in_channels: u16,
        in_format: AudioSampleFormat,
        in_rate: u32,
        out_channels: u16,
        out_format: AudioSampleFormat,
        out_rate: u32,
        frame_size: usize,
    ) -> Result<Self, ResampleError> {
        if in_channels == 0 || out_channels == 0 || out_channels > 2 {
            return Err(ResampleError::UnsupportedChannels(out_channels.max(in_channels)));
        }
        let converter = if in_rate != out_rate {
            let ratio = f64::from(out_rate) / f64::from(in_rate);
            let converter = FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Cubic,
                RESAMPLE_CHUNK,
                out_channels as usize,
            )
            .map_err(|e| ResampleError::Convert(e.to_string()))?;
            log::debug!(
                "[Resample] rate {} -> {}, format {:?} -> {:?}, channels {} -> {}",
                in_rate,
                out_rate,
                in_format,
                out_format,
                in_channels,
                out_channels
            );
            Some(converter)
        } else {
            None
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                in_rate,
                in_channels: in_channels as usize,
                in_format,
                out_rate,
                out_channels: out_channels as usize,
                out_format,
                frame_size,
                converter,
                pending: vec![VecDeque::new(); out_channels as usize],
                fifo: VecDeque::new(),
            }),
        })
    }

    /// Appends `n_samples` per-channel input samples (interleaved raw bytes
    /// in the configured input format).
    pub fn store(&self, pcm: &[u8], n_samples: usize) -> Result<(), ResampleError> {
        let mut inner = self.inner.lock();
        let channels = inner.in_channels;
        let need = n_samples * channels * inner.in_format.bytes_per_sample();
        if pcm.len() < need {
            return Err(ResampleError::Convert(format!(
                "short input: {} bytes for {} samples",
                pcm.len(),
                n_samples
            )));
        }

        // Decode to f32 and map channels onto the output layout.
        let planar = decode_to_planar(pcm, n_samples, channels, inner.in_format, inner.out_channels);

        if inner.converter.is_none() {
            interleave_into(&mut inner.fifo, &planar);
            return Ok(());
        }

        for (channel, samples) in planar.into_iter().enumerate() {
            inner.pending[channel].extend(samples);
        }
        // Drain every full chunk so output is never trapped behind more
        // than one partial chunk.
        while inner.pending[0].len() >= RESAMPLE_CHUNK {
            let mut chunk: Vec<Vec<f32>> = Vec::with_capacity(inner.out_channels);
            for pending in inner.pending.iter_mut() {
                chunk.push(pending.drain(..RESAMPLE_CHUNK).collect());
            }
            let converter = inner.converter.as_mut().ok_or(ResampleError::NotInitialized)?;
            let out = converter
                .process(&chunk, None)
                .map_err(|e| ResampleError::Convert(e.to_string()))?;
            interleave_into(&mut inner.fifo, &out);
        }
        Ok(())
    }

    /// Drains exactly `frame_size` samples per channel, converted to the
    /// output sample format. `Ok(None)` means would-block: not enough
    /// samples buffered yet.
    pub fn read_frame(&self) -> Result<Option<SampleBuf>, ResampleError> {
        let mut inner = self.inner.lock();
        let want = inner.frame_size * inner.out_channels;
        if inner.fifo.len() < want {
            return Ok(None);
        }
        let samples: Vec<f32> = inner.fifo.drain(..want).collect();
        let buf = match inner.out_format {
            AudioSampleFormat::F32 => SampleBuf::F32(samples),
            AudioSampleFormat::I16 => SampleBuf::I16(
                samples
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect(),
            ),
            AudioSampleFormat::None => return Err(ResampleError::NotInitialized),
        };
        Ok(Some(buf))
    }

    /// Buffered output samples (per channel).
    pub fn buffered(&self) -> usize {
        let inner = self.inner.lock();
        inner.fifo.len() / inner.out_channels.max(1)
    }

    pub fn out_rate(&self) -> u32 {
        self.inner.lock().out_rate
    }

    pub fn in_rate(&self) -> u32 {
        self.inner.lock().in_rate
    }
}

/// Decodes interleaved raw samples to f32 planar in the output channel
/// layout: mono fans out to both channels, extra source channels beyond the
/// layout are dropped.
fn decode_to_planar(
    pcm: &[u8],
    n_samples: usize,
    in_channels: usize,
    in_format: AudioSampleFormat,
    out_channels: usize,
) -> Vec<Vec<f32>> {
    let sample_at = |frame: usize, channel: usize| -> f32 {
        let index = frame * in_channels + channel;
        match in_format {
            AudioSampleFormat::I16 => {
                let at = index * 2;
                i16::from_ne_bytes([pcm[at], pcm[at + 1]]) as f32 / 32768.0
            }
            AudioSampleFormat::F32 => {
                let at = index * 4;
                f32::from_ne_bytes([pcm[at], pcm[at + 1], pcm[at + 2], pcm[at + 3]])
            }
            AudioSampleFormat::None => 0.0,
        }
    };

    let mut planar = vec![Vec::with_capacity(n_samples); out_channels];
    for frame in 0..n_samples {
        for (channel, plane) in planar.iter_mut().enumerate() {
            let source_channel = if channel < in_channels { channel } else { 0 };
            plane.push(sample_at(frame, source_channel));
        }
    }
    planar
}

fn interleave_into(fifo: &mut VecDeque<f32>, planar: &[Vec<f32>]) {
    let frames = planar.first().map(Vec::len).unwrap_or(0);
    for frame in 0..frames {
        for plane in planar {
            fifo.push_back(plane[frame]);
        }
    }
}
