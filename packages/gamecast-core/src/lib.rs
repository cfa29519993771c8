//! Gamecast Core - cloud gaming edge engine.
//!
//! This crate captures a running game's video and audio through shared
//! memory rings populated by external capture agents, encodes both in real
//! time, streams the compressed media to remote clients over a framed
//! binary WebSocket connection, and replays client input (keyboard, mouse,
//! gamepad) back into the game.
//!
//! # Architecture
//!
//! - [`shm`]: shared-memory frame rings and readiness events (capture ABI)
//! - [`audio`]: resampler and audio encoder thread
//! - [`video`]: encoder selection, per-backend options, video encoder thread
//! - [`codec`]: the codec boundary (send/receive drain model)
//! - [`container`]: wire containers (Annex B, Ogg Opus, fragmented MP4)
//! - [`framer`]: packet framing and the accumulating init-header buffer
//! - [`session`]: per-client state machine and ordered egress
//! - [`hub`]: session registry, caps, fan-out, encoder lifecycle
//! - [`user_service`]: JSON-RPC login/keepalive/logout client
//! - [`control`] / [`replay`]: input-event decoding and replay backends
//! - [`engine`]: wires everything together, owns the servers

pub mod audio;
pub mod codec;
pub mod config;
pub mod container;
pub mod control;
pub mod engine;
pub mod error;
pub mod framer;
pub mod hub;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod shm;
pub mod user_service;
pub mod video;

// Re-export commonly used types at the crate root
pub use config::{
    AudioCodecKind, AudioConfig, EncoderRunMode, EngineConfig, ReplayConfig, VideoBackend,
    VideoCodecKind, VideoConfig, MAX_CLIENTS,
};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, EngineResult};
pub use hub::{EncoderControl, StreamHub};
pub use protocol::{NetPacketHeader, PacketKind, PROTOCOL_VERSION};
pub use session::{ClientSession, SessionState};
