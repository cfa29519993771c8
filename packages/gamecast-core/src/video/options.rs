//! Video encoder selection and options.
//!
//! The configuration expresses a backend preference (the CLI's NVENC
//! toggle); resolution maps it onto what the codec layer can actually
//! open. Today that is the software H.264 encoder, so a hardware request
//! resolves to software with a warning while a runtime init failure of the
//! opened encoder stays fatal.

use crate::codec::{EncoderOptions, OpenH264Codec, VideoEncoderCodec};
use crate::config::VideoBackend;
use crate::error::CodecError;

/// Stream time base denominator (H.264 convention).
pub const H264_TIME_BASE: i64 = 90_000;

/// Whether the codec layer can open an encoder for this backend.
pub const fn backend_available(backend: VideoBackend) -> bool {
    matches!(backend, VideoBackend::Software)
}

/// Resolves the configured backend preference against what can be opened.
pub fn resolve_backend(requested: VideoBackend) -> VideoBackend {
    if backend_available(requested) {
        requested
    } else {
        log::warn!(
            "[VideoEncoder] Backend {:?} not available in this build, using software",
            requested
        );
        VideoBackend::Software
    }
}

/// Builds the software encoder's option vector. The profile is baseline
/// (all the encoder produces) and the zero-latency tune is inherent; the
/// codec wrapper consumes `preset` and `crf`.
pub fn encoder_options(preset: &str, quality: u32) -> EncoderOptions {
    let mut options = EncoderOptions::new();
    options.push("preset", preset);
    options.push("crf", quality.to_string());
    options.push("forced-idr", "1");
    options.push("tune", "zerolatency");
    options.push("profile", "baseline");
    options
}

/// Parameters for opening the codec once geometry is known.
#[derive(Debug, Clone)]
pub struct VideoEncodeParams {
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub gop: i32,
    pub options: EncoderOptions,
}

/// Opens the concrete encoder for the resolved backend.
pub fn open_video_codec(
    backend: VideoBackend,
    params: &VideoEncodeParams,
) -> Result<Box<dyn VideoEncoderCodec>, CodecError> {
    match backend {
        VideoBackend::Software => Ok(Box::new(OpenH264Codec::open(
            params.width,
            params.height,
            params.bitrate,
            params.gop,
            &params.options,
        )?)),
        VideoBackend::Amf | VideoBackend::Nvenc | VideoBackend::Qsv => {
            Err(CodecError::Unavailable("hardware encoder"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_options_carry_preset_and_quality() {
        let options = encoder_options("ultrafast", 23);
        assert_eq!(options.get("preset"), Some("ultrafast"));
        assert_eq!(options.get("crf"), Some("23"));
        assert_eq!(options.get("profile"), Some("baseline"));
        assert_eq!(options.get("tune"), Some("zerolatency"));
    }

    #[test]
    fn only_the_software_backend_is_available() {
        assert!(backend_available(VideoBackend::Software));
        assert!(!backend_available(VideoBackend::Nvenc));
        assert!(!backend_available(VideoBackend::Qsv));
        assert!(!backend_available(VideoBackend::Amf));
    }

    #[test]
    fn hardware_preferences_resolve_to_software() {
        assert_eq!(resolve_backend(VideoBackend::Nvenc), VideoBackend::Software);
        assert_eq!(resolve_backend(VideoBackend::Amf), VideoBackend::Software);
        assert_eq!(resolve_backend(VideoBackend::Qsv), VideoBackend::Software);
        assert_eq!(
            resolve_backend(VideoBackend::Software),
            VideoBackend::Software
        );
    }

    #[test]
    fn resolved_backend_always_opens() {
        let params = VideoEncodeParams {
            width: 64,
            height: 64,
            bitrate: 500_000,
            gop: 30,
            options: encoder_options("ultrafast", 23),
        };
        let backend = resolve_backend(VideoBackend::Nvenc);
        assert!(open_video_codec(backend, &params).is_ok());
    }

    #[test]
    fn unresolved_hardware_backend_is_unavailable() {
        let params = VideoEncodeParams {
            width: 64,
            height: 64,
            bitrate: 500_000,
            gop: 30,
            options: encoder_options("ultrafast", 23),
        };
        assert!(matches!(
            open_video_codec(VideoBackend::Nvenc, &params),
            Err(CodecError::Unavailable(_))
        ));
    }
}
