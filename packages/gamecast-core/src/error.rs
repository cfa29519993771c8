//! Centralized error types for the Gamecast core library.
//!
//! Each subsystem defines a structured error with `thiserror`; [`EngineError`]
//! is the crate-wide type surfaced at the engine boundary. No panic crosses a
//! component boundary: transient codec and connection errors are recovered
//! locally, session-level errors surface only as a session close, and
//! engine-fatal errors exit the process with a non-zero status.

use thiserror::Error;

use crate::control::ControlType;

/// Invalid configuration value; fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("audio-bitrate out of range!")]
    AudioBitrateOutOfRange,
    #[error("unsupported audio-codec!")]
    UnsupportedAudioCodec,
    #[error("video-bitrate too low!")]
    VideoBitrateTooLow,
    #[error("video-gop out of range!")]
    VideoGopOutOfRange,
    #[error("video-quality out of range!")]
    VideoQualityOutOfRange,
    #[error("invalid bind-address: {0}")]
    InvalidBindAddress(String),
    #[error("invalid user-service endpoint: {0}")]
    InvalidUserService(String),
}

/// Malformed wire data on the streaming connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated message")]
    Truncated,
    #[error("unsupported packet version {0}")]
    BadVersion(u8),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("unknown client action {0}")]
    UnknownAction(u8),
    #[error("verification data too large ({0} bytes)")]
    VerificationTooLarge(usize),
    #[error("message not allowed in the current session state")]
    BadState,
}

/// Malformed control (input-event) message. The offending message is
/// dropped; the session stays up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("control message truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unknown control type {0}")]
    UnknownType(u8),
    #[error("size {actual} not matched for type {control_type:?} (expected {expected})")]
    LengthMismatch {
        control_type: ControlType,
        expected: usize,
        actual: usize,
    },
    #[error("bad button state {0}")]
    BadButtonState(u8),
}

/// Shared-memory region or readiness-event failure. Fatal to the owning
/// encoder; the ring is never partially valid.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("mapping {name} failed: {reason}")]
    Map { name: String, reason: String },
    #[error("region {name} too small: {actual} bytes, need {expected}")]
    RegionTooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid data size {actual}, should be {expected}")]
    BadDataSize { expected: usize, actual: usize },
    #[error("event {name} failed: {reason}")]
    Event { name: String, reason: String },
}

/// Resampler failure.
#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("resampler not initialized")]
    NotInitialized,
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u16),
    #[error("rate conversion failed: {0}")]
    Convert(String),
}

/// Codec-layer failure. `TryAgain` is the non-error drain signal of the
/// send/receive loop; initialization failures are fatal to the encoder
/// instance, per-frame failures are logged and skipped.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no output available, try again")]
    TryAgain,
    #[error("encoder {0} is not available in this build")]
    Unavailable(&'static str),
    #[error("could not find encoder for {0}")]
    UnknownCodec(String),
    #[error("codec init failed: {0}")]
    Init(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("capture device lost")]
    DeviceLost,
}

/// User-service (authentication) failure after retries are exhausted.
#[derive(Debug, Error)]
pub enum UserServiceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    BadResponse(String),
    #[error("login rejected")]
    Rejected,
    #[error("retries exhausted")]
    RetriesExhausted,
}

/// Crate-wide error type surfaced at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("resample error: {0}")]
    Resample(#[from] ResampleError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("user service error: {0}")]
    UserService(#[from] UserServiceError),
}

impl EngineError {
    /// Machine-readable error code, used in logs and exit paths.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Resource(_) => "resource_error",
            Self::Shm(_) => "resource_error",
            Self::Codec(_) => "codec_error",
            Self::Resample(_) => "codec_error",
            Self::Protocol(_) => "protocol_error",
            Self::UserService(_) => "authentication_failure",
        }
    }
}

/// Convenient Result alias for engine-level operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_mention_out_of_range() {
        assert!(ConfigError::AudioBitrateOutOfRange
            .to_string()
            .contains("out of range"));
        assert!(ConfigError::VideoGopOutOfRange
            .to_string()
            .contains("out of range"));
    }

    #[test]
    fn engine_error_codes() {
        let err = EngineError::from(ConfigError::AudioBitrateOutOfRange);
        assert_eq!(err.code(), "configuration_error");
        let err = EngineError::from(CodecError::DeviceLost);
        assert_eq!(err.code(), "codec_error");
    }
}
