//! Engine configuration types.
//!
//! All values are validated up front; an invalid value is fatal at startup.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_AUDIO_BITRATE: u64 = 128_000;
pub const DEFAULT_VIDEO_BITRATE: u64 = 1_000_000;
pub const DEFAULT_VIDEO_GOP: i32 = 180;
pub const DEFAULT_VIDEO_QUALITY: u32 = 23;
pub const DEFAULT_PORT: u16 = 8080;

pub const MIN_AUDIO_BITRATE: u64 = 16_000;
pub const MAX_AUDIO_BITRATE: u64 = 256_000;
pub const MIN_VIDEO_BITRATE: u64 = 100_000;
pub const MIN_VIDEO_GOP: i32 = 1;
pub const MAX_VIDEO_GOP: i32 = 500;
pub const MAX_VIDEO_QUALITY: u32 = 51;

/// Maximum simultaneous client sessions (and authorized sessions).
pub const MAX_CLIENTS: usize = 8;

/// Audio codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodecKind {
    Opus,
    Aac,
}

impl AudioCodecKind {
    /// Parses the CLI codec name. `libopus` and `opus` are aliases.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "libopus" | "opus" => Ok(Self::Opus),
            "aac" => Ok(Self::Aac),
            _ => Err(ConfigError::UnsupportedAudioCodec),
        }
    }

    /// Stable id reported in the login result.
    pub const fn wire_id(self) -> u32 {
        match self {
            Self::Opus => 1,
            Self::Aac => 2,
        }
    }
}

/// Video codec. H.264 is the only stream format produced; the id is what
/// the login result reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecKind {
    H264,
}

impl VideoCodecKind {
    pub const fn wire_id(self) -> u32 {
        match self {
            Self::H264 => 1,
        }
    }
}

/// Video encoder backend preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoBackend {
    Software,
    Amf,
    Nvenc,
    Qsv,
}

/// When the encoder threads run.
///
/// `OnStartup` (desktop mode): capture and encode from process start, never
/// stopping until exit. `OnFirstAuthorized` (server mode): encoders start
/// when the first session authorizes and stop when the last one leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderRunMode {
    OnStartup,
    OnFirstAuthorized,
}

/// Replay backend for keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyboardBackendKind {
    None,
    VirtualHid,
    SyntheticInput,
}

/// Replay backend for mouse input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseBackendKind {
    None,
    VirtualHid,
    SyntheticInput,
    WindowMessage,
}

/// Replay backend for gamepad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamepadBackendKind {
    None,
    VirtualHid,
    VirtualPad,
}

/// Audio pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub codec: AudioCodecKind,
    pub bitrate: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodecKind::Opus,
            bitrate: DEFAULT_AUDIO_BITRATE,
        }
    }
}

/// Video pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub codec: VideoCodecKind,
    pub backend: VideoBackend,
    pub bitrate: u64,
    pub gop: i32,
    /// Encoder preset; `None` resolves per backend (llhp for NVENC,
    /// ultrafast for software).
    pub preset: Option<String>,
    /// Constant-quality value, 0-51, lower is better.
    pub quality: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodecKind::H264,
            backend: VideoBackend::Nvenc,
            bitrate: DEFAULT_VIDEO_BITRATE,
            gop: DEFAULT_VIDEO_GOP,
            preset: None,
            quality: DEFAULT_VIDEO_QUALITY,
        }
    }
}

impl VideoConfig {
    /// Effective preset string for the selected backend.
    pub fn effective_preset(&self) -> &str {
        match &self.preset {
            Some(p) => p.as_str(),
            None => match self.backend {
                VideoBackend::Nvenc => "llhp",
                _ => "ultrafast",
            },
        }
    }
}

/// Input replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub keyboard: KeyboardBackendKind,
    pub mouse: MouseBackendKind,
    pub gamepad: GamepadBackendKind,
    /// Host scan codes that are never replayed.
    pub disable_keys: Vec<u8>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            keyboard: KeyboardBackendKind::SyntheticInput,
            mouse: MouseBackendKind::SyntheticInput,
            gamepad: GamepadBackendKind::VirtualPad,
            disable_keys: Vec::new(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bind_address: IpAddr,
    /// WebSocket port for media streaming; 0 disables streaming out but the
    /// encoders still run from startup.
    pub stream_port: u16,
    /// UDP port for the control fast path.
    pub control_port: u16,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub replay: ReplayConfig,
    /// User verification service endpoint, e.g. `http://127.0.0.1:3928/`.
    pub user_service: String,
    pub encoder_mode: EncoderRunMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "::".parse().unwrap_or(IpAddr::from([0u8; 16])),
            stream_port: DEFAULT_PORT,
            control_port: DEFAULT_PORT,
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
            replay: ReplayConfig::default(),
            user_service: "http://127.0.0.1:3928/".to_string(),
            encoder_mode: EncoderRunMode::OnFirstAuthorized,
        }
    }
}

impl EngineConfig {
    /// Sanity-checks every range-bound value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.bitrate < MIN_AUDIO_BITRATE || self.audio.bitrate > MAX_AUDIO_BITRATE {
            return Err(ConfigError::AudioBitrateOutOfRange);
        }
        if self.video.bitrate < MIN_VIDEO_BITRATE {
            return Err(ConfigError::VideoBitrateTooLow);
        }
        if self.video.gop < MIN_VIDEO_GOP || self.video.gop > MAX_VIDEO_GOP {
            return Err(ConfigError::VideoGopOutOfRange);
        }
        if self.video.quality > MAX_VIDEO_QUALITY {
            return Err(ConfigError::VideoQualityOutOfRange);
        }
        if self.user_service.is_empty() {
            return Err(ConfigError::InvalidUserService("empty".into()));
        }
        Ok(())
    }

    /// Streaming disabled means desktop mode: encoders run unconditionally.
    pub fn effective_encoder_mode(&self) -> EncoderRunMode {
        if self.stream_port == 0 {
            EncoderRunMode::OnStartup
        } else {
            self.encoder_mode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_audio_bitrate_is_rejected() {
        let mut config = EngineConfig::default();
        config.audio.bitrate = 300_000;
        let err = config.validate().unwrap_err();
        assert_eq!(err, ConfigError::AudioBitrateOutOfRange);
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn low_video_bitrate_is_rejected() {
        let mut config = EngineConfig::default();
        config.video.bitrate = 50_000;
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::VideoBitrateTooLow
        );
    }

    #[test]
    fn gop_bounds_are_enforced() {
        let mut config = EngineConfig::default();
        config.video.gop = 0;
        assert!(config.validate().is_err());
        config.video.gop = 501;
        assert!(config.validate().is_err());
        config.video.gop = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn codec_aliases_parse() {
        assert_eq!(
            AudioCodecKind::parse("libopus").unwrap(),
            AudioCodecKind::Opus
        );
        assert_eq!(AudioCodecKind::parse("opus").unwrap(), AudioCodecKind::Opus);
        assert_eq!(AudioCodecKind::parse("aac").unwrap(), AudioCodecKind::Aac);
        assert!(AudioCodecKind::parse("mp3").is_err());
    }

    #[test]
    fn stream_port_zero_forces_startup_mode() {
        let mut config = EngineConfig::default();
        config.encoder_mode = EncoderRunMode::OnFirstAuthorized;
        config.stream_port = 0;
        assert_eq!(config.effective_encoder_mode(), EncoderRunMode::OnStartup);
    }
}
