//! Gamecast Server - headless cloud gaming edge server.
//!
//! Captures a running game through the shared-memory capture agents,
//! encodes audio and video, streams to remote clients and replays their
//! input. Exits non-zero on argument or initialization failure.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gamecast_core::{AudioCodecKind, Engine, EngineConfig, VideoBackend};
use tokio::signal;

/// Gamecast edge engine.
#[derive(Parser, Debug)]
#[command(name = "gamecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio bitrate in bits per second (16000-256000).
    #[arg(long, default_value_t = 128_000)]
    audio_bitrate: u64,

    /// Audio codec, one of {libopus, opus, aac}.
    #[arg(long, default_value = "libopus")]
    audio_codec: String,

    /// Bind address for listening, eg: 0.0.0.0
    #[arg(long, default_value = "::")]
    bind_address: String,

    /// UDP port for the control flow.
    #[arg(long, default_value_t = 8080)]
    control_port: u16,

    /// Enable NVENC hardware encoding.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_nvenc: bool,

    /// WebSocket port for streaming. If 0, streaming out via network is
    /// disabled; capture and encode start at startup and never stop until
    /// exit. The stream port only carries media output.
    #[arg(long, default_value_t = 8080)]
    stream_port: u16,

    /// User verification service endpoint.
    #[arg(long, default_value = "http://127.0.0.1:3928/")]
    user_service: String,

    /// Video bitrate in bits per second (>= 100000).
    #[arg(long, default_value_t = 1_000_000)]
    video_bitrate: u64,

    /// Video GOP length (1-500).
    #[arg(long, default_value_t = 180)]
    video_gop: i32,

    /// Video encoder preset; defaults to llhp with NVENC, ultrafast
    /// otherwise.
    #[arg(long)]
    video_preset: Option<String>,

    /// Video quality, lower is better, 0-51, 0 is lossless.
    #[arg(long, default_value_t = 23)]
    video_quality: u32,

    /// Disabled host scan codes, comma separated (eg: 91 to block the
    /// left meta key).
    #[arg(long, value_delimiter = ',')]
    disable_keys: Vec<u8>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GAMECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

fn build_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let bind_address: IpAddr = args
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind-address: {}", args.bind_address))?;

    let mut config = EngineConfig::default();
    config.bind_address = bind_address;
    config.stream_port = args.stream_port;
    config.control_port = if args.control_port == 0 {
        8080
    } else {
        args.control_port
    };
    config.audio.codec = AudioCodecKind::parse(&args.audio_codec).map_err(anyhow::Error::new)?;
    config.audio.bitrate = args.audio_bitrate;
    config.video.backend = if args.enable_nvenc {
        VideoBackend::Nvenc
    } else {
        VideoBackend::Software
    };
    config.video.bitrate = args.video_bitrate;
    config.video.gop = args.video_gop;
    config.video.preset = args.video_preset.clone();
    config.video.quality = args.video_quality;
    config.replay.disable_keys = args.disable_keys.clone();
    config.user_service = args.user_service.clone();

    config.validate().map_err(anyhow::Error::new)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Gamecast Edge Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args).map_err(|e| {
        // Argument failures must reach stderr even with logging off.
        eprintln!("Invalid argument: {}", e);
        e
    })?;

    let engine = Engine::with_default_capture(config).context("Init engine failed")?;

    let runner = Arc::clone(&engine);
    let server = tokio::spawn(async move { runner.run().await });

    shutdown_signal().await;
    log::info!("Received shutdown signal");
    engine.shutdown();

    match server.await {
        Ok(result) => result.context("Engine failed")?,
        Err(e) => log::error!("Engine task panicked: {}", e),
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => log::error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
