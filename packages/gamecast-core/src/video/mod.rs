//! Video pipeline: backend resolution, encoder options, encoder thread.

mod encoder;
mod options;

pub use encoder::{VideoEncoder, VideoEncoderEnd};
pub use options::{
    backend_available, encoder_options, open_video_codec, resolve_backend, VideoEncodeParams,
    H264_TIME_BASE,
};
