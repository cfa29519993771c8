//! The engine: owns the encoder pair, the session hub, the streaming and
//! control servers, and the restart loop that recreates the video encoder
//! on mid-session geometry changes.
//!
//! Constructed explicitly in `main` and passed by reference; there are no
//! hidden singletons.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioEncoder;
use crate::config::{EncoderRunMode, EngineConfig};
use crate::control;
use crate::error::{EngineError, EngineResult};
use crate::framer::{HeaderBuffer, PacketSink};
use crate::hub::{EncoderControl, StreamHub};
use crate::replay::ReplayRouter;
use crate::session::{serve_socket, AuthClient, AuthFactory, ClientSession};
use crate::shm::{AudioCaptureSource, StateEvent, VideoCaptureSource};
use crate::user_service::UserServiceClient;
use crate::video::VideoEncoder;

/// Events posted back to the engine loop from worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineEvent {
    RestartVideoEncoder,
}

/// Late-bound packet sink: encoders are built before the hub exists.
struct HubSink {
    hub: OnceLock<Weak<StreamHub>>,
}

impl HubSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: OnceLock::new(),
        })
    }

    fn bind(&self, hub: &Arc<StreamHub>) {
        let _ = self.hub.set(Arc::downgrade(hub));
    }
}

impl PacketSink for HubSink {
    fn send(&self, packet: Bytes) -> usize {
        self.hub
            .get()
            .and_then(Weak::upgrade)
            .map(|hub| hub.send(packet))
            .unwrap_or(0)
    }
}

/// The encoder pair behind the narrow [`EncoderControl`] interface. The
/// video half is recreated on geometry change, so it lives in an Option.
struct EngineEncoders {
    config: EngineConfig,
    audio: AudioEncoder,
    video: Mutex<Option<VideoEncoder>>,
    video_capture: Arc<dyn VideoCaptureSource>,
    sink: Arc<HubSink>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEncoders {
    fn make_video(&self) -> VideoEncoder {
        let events = self.events.clone();
        VideoEncoder::new(
            self.config.video.clone(),
            Arc::clone(&self.video_capture),
            Arc::clone(&self.sink) as Arc<dyn PacketSink>,
            Arc::new(move || {
                let _ = events.send(EngineEvent::RestartVideoEncoder);
            }),
        )
    }

    fn video_header_buffer(&self) -> Option<Arc<HeaderBuffer>> {
        self.video.lock().as_ref().map(VideoEncoder::header)
    }
}

impl EncoderControl for EngineEncoders {
    fn start(&self) {
        self.audio.start();
        if let Some(video) = self.video.lock().as_ref() {
            video.start();
        }
    }

    fn stop(&self) {
        self.audio.stop();
        if let Some(video) = self.video.lock().as_ref() {
            video.stop();
        }
    }

    fn audio_header(&self) -> Bytes {
        self.audio.header().bytes()
    }

    fn video_header(&self) -> Bytes {
        self.video_header_buffer()
            .map(|header| header.bytes())
            .unwrap_or_default()
    }

    fn audio_codec_id(&self) -> u32 {
        self.config.audio.codec.wire_id()
    }

    fn video_codec_id(&self) -> u32 {
        self.config.video.codec.wire_id()
    }

    fn produce_keyframe(&self) {
        if let Some(video) = self.video.lock().as_ref() {
            video.produce_keyframe();
        }
    }
}

/// Shared state of the WebSocket accept path.
struct StreamServer {
    hub: Arc<StreamHub>,
    router: Arc<ReplayRouter>,
    auth_factory: AuthFactory,
}

pub struct Engine {
    config: EngineConfig,
    hub: Arc<StreamHub>,
    encoders: Arc<EngineEncoders>,
    router: Arc<ReplayRouter>,
    present_flag: Arc<dyn StateEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        video_capture: Arc<dyn VideoCaptureSource>,
        audio_capture: Arc<dyn AudioCaptureSource>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = HubSink::new();

        let encoders = Arc::new(EngineEncoders {
            config: config.clone(),
            audio: AudioEncoder::new(
                config.audio.clone(),
                audio_capture,
                Arc::clone(&sink) as Arc<dyn PacketSink>,
            ),
            video: Mutex::new(None),
            video_capture,
            sink: Arc::clone(&sink),
            events: events_tx,
        });
        *encoders.video.lock() = Some(encoders.make_video());

        let mode = config.effective_encoder_mode();
        let hub = StreamHub::new(mode, Arc::clone(&encoders) as Arc<dyn EncoderControl>);
        sink.bind(&hub);

        let router = ReplayRouter::new(config.replay.clone());

        let present_flag: Arc<dyn StateEvent> = {
            #[cfg(windows)]
            {
                crate::shm::windows::WindowsStateEvent::create(
                    crate::shm::names::DO_NOT_PRESENT_EVENT,
                )?
            }
            #[cfg(not(windows))]
            {
                crate::shm::local::LocalStateEvent::new()
            }
        };

        Ok(Arc::new(Self {
            config,
            hub,
            encoders,
            router,
            present_flag,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Builds the engine against the platform capture transport: named
    /// shared memory on Windows, the in-process stand-in elsewhere.
    pub fn with_default_capture(config: EngineConfig) -> EngineResult<Arc<Self>> {
        #[cfg(windows)]
        {
            let video = crate::shm::windows::WindowsVideoCapture::create()?;
            let audio = crate::shm::windows::WindowsAudioCapture::create()?;
            Self::new(config, video, audio)
        }
        #[cfg(not(windows))]
        {
            let video = crate::shm::local::LocalVideoCapture::new();
            let audio = crate::shm::local::LocalAudioCapture::new();
            Self::new(config, video, audio)
        }
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tells the capture side whether to suppress presentation.
    /// Idempotent: the event ends up set or reset regardless of repeats.
    pub fn set_present_flag(&self, do_not_present: bool) {
        if do_not_present {
            self.present_flag.set();
        } else {
            self.present_flag.reset();
        }
    }

    /// Requests a forced IDR from the video encoder.
    pub fn video_produce_keyframe(&self) {
        self.encoders.produce_keyframe();
    }

    /// Runs the servers and the engine loop until [`Engine::shutdown`].
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::Resource("engine already running".into()))?;

        if self.config.effective_encoder_mode() == EncoderRunMode::OnStartup {
            log::info!("[Engine] Desktop mode: encoders run from startup");
            self.encoders.start();
        }

        // Stream server (WebSocket).
        if self.config.stream_port != 0 {
            let addr = SocketAddr::new(self.config.bind_address, self.config.stream_port);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| EngineError::Resource(format!("bind {}: {}", addr, e)))?;
            log::info!("[Engine] Stream server on {}", addr);

            let endpoint = self.config.user_service.clone();
            let auth_factory: AuthFactory = Arc::new(move |weak| {
                UserServiceClient::new(endpoint.clone(), weak) as Arc<dyn AuthClient>
            });
            let server = Arc::new(StreamServer {
                hub: Arc::clone(&self.hub),
                router: Arc::clone(&self.router),
                auth_factory,
            });
            let app = axum::Router::new()
                .route("/", axum::routing::get(ws_handler))
                .with_state(server);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                let result = axum::serve(listener, service)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = result {
                    log::error!("[Engine] Stream server error: {}", e);
                }
            });
        } else {
            log::info!("[Engine] Streaming disabled (stream port 0)");
        }

        // Control fast path (UDP).
        if self.config.control_port != 0 {
            let addr = SocketAddr::new(self.config.bind_address, self.config.control_port);
            let socket = tokio::net::UdpSocket::bind(addr)
                .await
                .map_err(|e| EngineError::Resource(format!("bind {}: {}", addr, e)))?;
            log::info!("[Engine] Control server on {}", addr);
            let router = Arc::clone(&self.router);
            router.initialize();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = socket.recv_from(&mut buf) => match received {
                            Ok((len, _peer)) => match control::decode(&buf[..len]) {
                                Ok(message) => {
                                    router.replay(&message.event);
                                }
                                Err(e) => log::debug!("[Control] Dropping datagram: {}", e),
                            },
                            Err(e) => {
                                log::error!("[Control] recv failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Engine loop: geometry-change restarts.
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(EngineEvent::RestartVideoEncoder) => self.restart_video_encoder(),
                    None => break,
                }
            }
        }

        log::info!("[Engine] Shutting down");
        self.hub.stop(false);
        self.encoders.stop();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Replaces the video encoder after a geometry change. The old thread
    /// has already exited; the new instance starts a fresh stream with a
    /// fresh init header.
    fn restart_video_encoder(&self) {
        log::info!("[Engine] Restarting video encoder");
        let fresh = self.encoders.make_video();
        {
            let mut slot = self.encoders.video.lock();
            if let Some(old) = slot.take() {
                old.stop();
            }
            *slot = Some(fresh);
        }
        let should_run = match self.config.effective_encoder_mode() {
            EncoderRunMode::OnStartup => true,
            EncoderRunMode::OnFirstAuthorized => self.hub.authorized_count() > 0,
        };
        if should_run {
            if let Some(video) = self.encoders.video.lock().as_ref() {
                video.start();
            }
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<StreamServer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.protocols(["webgame"])
        .on_upgrade(move |socket| async move {
            log::info!("[Engine] Accept {}", remote);
            let id = server.hub.next_session_id();
            let (session, outbound_rx) = ClientSession::new(
                id,
                remote.to_string(),
                Arc::downgrade(&server.hub),
                Arc::clone(&server.router),
                server.auth_factory.clone(),
            );
            if !server.hub.join(&session) {
                // Over the cap: close immediately with reconnect semantics.
                session.close(true);
            }
            serve_socket(socket, session, outbound_rx).await;
        })
}
