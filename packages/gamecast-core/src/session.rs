//! Per-client session: ingress parsing, authorization lifecycle, and the
//! ordered egress queue.
//!
//! Ingress is a length-prefixed message stream with no framing alignment;
//! the parser reassembles messages across transport reads and enforces a
//! 7-second deadline from the first byte of every message. The session
//! state gates what ingress is allowed: only a login before authorization,
//! only ping/control after it.
//!
//! Egress is a single-flight ordered queue; init-header injection for the
//! first audio/video packet happens at enqueue time under the queue lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::control;
use crate::error::ProtocolError;
use crate::framer::frame_packet;
use crate::hub::StreamHub;
use crate::protocol::{
    ClientAction, ClientLogin, LoginResult, PacketKind, PACKAGE_HEAD_LEN, PROTOCOL_VERSION,
};
use crate::replay::ReplayRouter;
use crate::user_service::Verification;

/// Per-message ingress deadline, measured from the first byte.
pub const MESSAGE_DEADLINE: Duration = Duration::from_secs(7);

/// Upper bound on one ingress message body.
const MAX_INGRESS_BODY: u32 = 64 * 1024;

/// Authentication client the session drives. The production implementation
/// is the user-service JSON-RPC client; tests substitute stubs.
pub trait AuthClient: Send + Sync {
    fn login(&self, verification: Verification);
    fn logout(&self);
    fn username(&self) -> String;
}

/// Factory producing an auth client bound to a session.
pub type AuthFactory = Arc<dyn Fn(Weak<ClientSession>) -> Arc<dyn AuthClient> + Send + Sync>;

/// Close semantics on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseCode {
    /// Transient condition; the client may reconnect.
    TryAgainLater,
    /// Final shutdown.
    GoingAway,
}

impl SessionCloseCode {
    pub const fn code(self) -> u16 {
        match self {
            Self::TryAgainLater => 1013,
            Self::GoingAway => 1001,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Self::TryAgainLater => "try again later",
            Self::GoingAway => "going away",
        }
    }
}

/// Outbound item for the single-flight writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Bytes),
    Close(SessionCloseCode),
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingress parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    None,
    Head,
    Body,
}

/// One reassembled ingress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressMessage {
    pub action: u8,
    pub body: Bytes,
}

/// Why the parser gave up on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseClose {
    /// The per-message deadline elapsed mid-message.
    Timeout,
    Protocol(ProtocolError),
}

/// Reassembles `{size u32 BE} {action u8} {body}` messages from arbitrary
/// transport reads.
pub struct IngressParser {
    buffer: BytesMut,
    state: ParseState,
    first_byte_at: Option<Instant>,
}

impl Default for IngressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ParseState::None,
            first_byte_at: None,
        }
    }

    /// Appends transport data and drains every complete message.
    pub fn feed(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<IngressMessage>, ParseClose> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while !self.buffer.is_empty() {
            if self.state == ParseState::None {
                self.first_byte_at = Some(now);
                self.state = ParseState::Head;
            }
            if let Some(first) = self.first_byte_at {
                if now.duration_since(first) > MESSAGE_DEADLINE {
                    return Err(ParseClose::Timeout);
                }
            }
            if self.state == ParseState::Head {
                if self.buffer.len() < PACKAGE_HEAD_LEN {
                    return Ok(messages);
                }
                self.state = ParseState::Body;
            }
            // Body: need the whole message.
            let size = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            if size == 0 || size > MAX_INGRESS_BODY {
                return Err(ParseClose::Protocol(ProtocolError::Truncated));
            }
            let total = PACKAGE_HEAD_LEN + size as usize;
            if self.buffer.len() < total {
                return Ok(messages);
            }
            self.buffer.advance(PACKAGE_HEAD_LEN);
            let mut message = self.buffer.split_to(size as usize).freeze();
            let action = message[0];
            message.advance(1);
            messages.push(IngressMessage {
                action,
                body: message,
            });
            self.state = ParseState::None;
            self.first_byte_at = None;
        }
        Ok(messages)
    }

    /// True when a partially received message has outlived the deadline.
    pub fn deadline_exceeded(&self, now: Instant) -> bool {
        self.first_byte_at
            .map(|first| now.duration_since(first) > MESSAGE_DEADLINE)
            .unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Authorization state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Authorizing,
    Authorized,
    Failed,
}

struct WriteState {
    audio_header_sent: bool,
    video_header_sent: bool,
}

pub struct ClientSession {
    id: u64,
    remote: String,
    hub: Weak<StreamHub>,
    router: Arc<ReplayRouter>,
    auth_factory: AuthFactory,
    state: Mutex<SessionState>,
    username: Mutex<String>,
    user: Mutex<Option<Arc<dyn AuthClient>>>,
    write_state: Mutex<WriteState>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    closing: AtomicBool,
}

impl ClientSession {
    pub fn new(
        id: u64,
        remote: String,
        hub: Weak<StreamHub>,
        router: Arc<ReplayRouter>,
        auth_factory: AuthFactory,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            remote,
            hub,
            router,
            auth_factory,
            state: Mutex::new(SessionState::None),
            username: Mutex::new(String::new()),
            user: Mutex::new(None),
            write_state: Mutex::new(WriteState {
                audio_header_sent: false,
                video_header_sent: false,
            }),
            outbound_tx,
            closing: AtomicBool::new(false),
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Enqueues one framed packet, injecting the matching init-header run
    /// ahead of the first packet of each media kind. The queue lock makes
    /// latch-check plus enqueue atomic, so ordering is preserved.
    pub fn write(&self, packet: Bytes) {
        if packet.is_empty() {
            return;
        }
        let mut write_state = self.write_state.lock();
        let kind = packet.get(1).copied().and_then(PacketKind::from_u8);
        let buffer = match kind {
            Some(PacketKind::Audio) if !write_state.audio_header_sent => {
                write_state.audio_header_sent = true;
                self.with_header(|encoders| encoders.audio_header(), packet)
            }
            Some(PacketKind::Video) if !write_state.video_header_sent => {
                write_state.video_header_sent = true;
                self.with_header(|encoders| encoders.video_header(), packet)
            }
            _ => packet,
        };
        let _ = self.outbound_tx.send(Outbound::Data(buffer));
    }

    fn with_header(
        &self,
        header: impl Fn(&Arc<dyn crate::hub::EncoderControl>) -> Bytes,
        packet: Bytes,
    ) -> Bytes {
        let Some(hub) = self.hub.upgrade() else {
            return packet;
        };
        let header = header(hub.encoders());
        if header.is_empty() {
            return packet;
        }
        let mut buffer = BytesMut::with_capacity(header.len() + packet.len());
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(&packet);
        buffer.freeze()
    }

    /// Handles one reassembled ingress message. An error means the session
    /// must close (restart semantics).
    pub fn handle_message(self: &Arc<Self>, message: &IngressMessage) -> Result<(), ProtocolError> {
        let state = self.state();
        match state {
            SessionState::Authorized => {
                match ClientAction::from_u8(message.action) {
                    Some(ClientAction::Ping) => {
                        self.write(frame_packet(PacketKind::Pong, &[]));
                    }
                    Some(ClientAction::Control) => match control::decode(&message.body) {
                        Ok(control) => {
                            self.router.replay(&control.event);
                        }
                        Err(e) => {
                            // Dropped, never partially applied.
                            log::debug!("[Session] {} dropping control: {}", self.remote, e);
                        }
                    },
                    Some(ClientAction::Login) => {
                        // Re-login is dropped without side effect.
                        log::debug!("[Session] {} login while authorized, ignored", self.remote);
                    }
                    None => {
                        log::debug!(
                            "[Session] {} unknown action {}",
                            self.remote,
                            message.action
                        );
                    }
                }
                Ok(())
            }
            SessionState::None => match ClientAction::from_u8(message.action) {
                Some(ClientAction::Login) => self.begin_login(&message.body),
                _ => Err(ProtocolError::BadState),
            },
            // No ingress accepted while the user service decides, and a
            // failed session is already on its way out.
            SessionState::Authorizing | SessionState::Failed => Ok(()),
        }
    }

    fn begin_login(self: &Arc<Self>, body: &[u8]) -> Result<(), ProtocolError> {
        let login = ClientLogin::decode(body)?;
        *self.state.lock() = SessionState::Authorizing;
        *self.username.lock() = login.username.clone();

        let auth = (self.auth_factory)(Arc::downgrade(self));
        *self.user.lock() = Some(Arc::clone(&auth));
        auth.login(Verification {
            version: login.protocol_version,
            username: login.username,
            verification_type: login.verification_type,
            data: login.verification_data,
        });
        Ok(())
    }

    /// User-service login outcome.
    pub fn notify_login_result(self: &Arc<Self>, ok: bool) {
        if !ok {
            *self.state.lock() = SessionState::Failed;
            log::error!(
                "[Session] {} from {} login failed!",
                self.username.lock(),
                self.remote
            );
            self.close(true);
            return;
        }

        *self.state.lock() = SessionState::Authorized;
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if !hub.add_authorized(self) {
            self.close(true);
            return;
        }

        let encoders = hub.encoders();
        let result = LoginResult {
            protocol_version: PROTOCOL_VERSION,
            error_code: 0,
            audio_codec: encoders.audio_codec_id(),
            video_codec: encoders.video_codec_id(),
        };
        let mut body = BytesMut::new();
        result.encode(&mut body);
        self.write(frame_packet(PacketKind::LoginResult, &body));

        log::info!(
            "[Session] Authorized {} from {}",
            self.username.lock(),
            self.remote
        );
        self.router.initialize();
        // Fresh clients need a keyframe to start decoding.
        encoders.produce_keyframe();
    }

    /// User-service keep-alive outcome.
    pub fn notify_keepalive_result(self: &Arc<Self>, ok: bool) {
        if !ok {
            *self.state.lock() = SessionState::Failed;
            log::error!(
                "[Session] {} from {} keepalive failed!",
                self.username.lock(),
                self.remote
            );
            self.close(true);
        }
    }

    /// Closes the session. `restart = true` tells the client to come back
    /// later; `false` is a hard goodbye.
    pub fn close(self: &Arc<Self>, restart: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(user) = self.user.lock().take() {
            user.logout();
        }
        log::info!("[Session] Closing {}", self.remote);
        let code = if restart {
            SessionCloseCode::TryAgainLater
        } else {
            SessionCloseCode::GoingAway
        };
        let _ = self.outbound_tx.send(Outbound::Close(code));
        if let Some(hub) = self.hub.upgrade() {
            hub.leave(self);
        }
    }

    /// Final detach when the socket loop ends; safe to call repeatedly.
    pub fn detach(self: &Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(user) = self.user.lock().take() {
            user.logout();
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.leave(self);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket loop
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one accepted WebSocket: ordered writes from the outbound queue,
/// ingress parsing with the per-message deadline watchdog.
pub async fn serve_socket(
    socket: WebSocket,
    session: Arc<ClientSession>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut parser = IngressParser::new();
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Data(bytes)) => {
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        session.close(true);
                        break;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: code.code(),
                            reason: code.reason().into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    match parser.feed(&data, Instant::now()) {
                        Ok(messages) => {
                            for message in &messages {
                                if let Err(e) = session.handle_message(message) {
                                    log::debug!(
                                        "[Session] {} protocol error: {}",
                                        session.remote(),
                                        e
                                    );
                                    session.close(true);
                                    break;
                                }
                            }
                        }
                        Err(ParseClose::Timeout) => {
                            log::debug!("[Session] {} message timeout", session.remote());
                            session.close(true);
                        }
                        Err(ParseClose::Protocol(e)) => {
                            log::debug!("[Session] {} bad framing: {}", session.remote(), e);
                            session.close(true);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    session.close(true);
                    break;
                }
                Some(Ok(_)) => {} // text/ping/pong are not part of the protocol
                Some(Err(e)) => {
                    log::debug!("[Session] {} read error: {}", session.remote(), e);
                    session.close(true);
                    break;
                }
            },
            _ = watchdog.tick() => {
                if parser.deadline_exceeded(Instant::now()) {
                    log::debug!("[Session] {} message timeout", session.remote());
                    session.close(true);
                }
            }
        }
    }

    session.detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderRunMode;
    use crate::hub::{EncoderControl, StreamHub};
    use crate::replay::ReplayRouter;
    use std::sync::atomic::AtomicUsize;

    // ── parser ──────────────────────────────────────────────────────────

    fn framed(action: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(1 + body.len() as u32).to_be_bytes());
        out.push(action);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn parser_reassembles_across_reads() {
        let mut parser = IngressParser::new();
        let now = Instant::now();
        let message = framed(2, &[1, 2, 3]);

        // Message boundaries never align with transport reads.
        let (first, second) = message.split_at(3);
        assert!(parser.feed(first, now).unwrap().is_empty());
        let messages = parser.feed(second, now).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].action, 2);
        assert_eq!(&messages[0].body[..], &[1, 2, 3]);
    }

    #[test]
    fn parser_drains_multiple_messages_per_read() {
        let mut parser = IngressParser::new();
        let now = Instant::now();
        let mut data = framed(1, &[]);
        data.extend(framed(2, &[9]));
        let messages = parser.feed(&data, now).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].action, 1);
        assert_eq!(messages[1].action, 2);
    }

    #[test]
    fn parser_enforces_message_deadline() {
        let mut parser = IngressParser::new();
        let start = Instant::now();
        assert!(parser.feed(&[0, 0], start).unwrap().is_empty());
        assert!(!parser.deadline_exceeded(start + Duration::from_secs(6)));
        assert!(parser.deadline_exceeded(start + Duration::from_secs(8)));

        // New data after the deadline also fails.
        let result = parser.feed(&[0, 10], start + Duration::from_secs(8));
        assert_eq!(result.unwrap_err(), ParseClose::Timeout);
    }

    #[test]
    fn parser_deadline_resets_per_message() {
        let mut parser = IngressParser::new();
        let start = Instant::now();
        parser.feed(&framed(1, &[]), start).unwrap();
        // Message completed; nothing pending, no deadline.
        assert!(!parser.deadline_exceeded(start + Duration::from_secs(100)));
    }

    #[test]
    fn parser_rejects_zero_and_oversized_messages() {
        let mut parser = IngressParser::new();
        let now = Instant::now();
        assert!(matches!(
            parser.feed(&0u32.to_be_bytes(), now),
            Err(ParseClose::Protocol(_))
        ));

        let mut parser = IngressParser::new();
        let huge = (MAX_INGRESS_BODY + 1).to_be_bytes();
        assert!(matches!(
            parser.feed(&huge, now),
            Err(ParseClose::Protocol(_))
        ));
    }

    // ── session state machine ───────────────────────────────────────────

    struct StubEncoders {
        starts: AtomicUsize,
        stops: AtomicUsize,
        keyframes: AtomicUsize,
        audio_header: Bytes,
        video_header: Bytes,
    }

    impl StubEncoders {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                keyframes: AtomicUsize::new(0),
                audio_header: frame_packet(PacketKind::Audio, b"AUDIOHDR"),
                video_header: frame_packet(PacketKind::Video, b"VIDEOHDR"),
            })
        }
    }

    impl EncoderControl for StubEncoders {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn audio_header(&self) -> Bytes {
            self.audio_header.clone()
        }
        fn video_header(&self) -> Bytes {
            self.video_header.clone()
        }
        fn audio_codec_id(&self) -> u32 {
            1
        }
        fn video_codec_id(&self) -> u32 {
            1
        }
        fn produce_keyframe(&self) {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubAuth {
        session: Weak<ClientSession>,
        outcome: Option<bool>,
        logins: Arc<AtomicUsize>,
        logouts: Arc<AtomicUsize>,
    }

    impl AuthClient for StubAuth {
        fn login(&self, _verification: Verification) {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if let (Some(outcome), Some(session)) = (self.outcome, self.session.upgrade()) {
                session.notify_login_result(outcome);
            }
        }
        fn logout(&self) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
        fn username(&self) -> String {
            "stub".into()
        }
    }

    struct Fixture {
        hub: Arc<StreamHub>,
        encoders: Arc<StubEncoders>,
        logins: Arc<AtomicUsize>,
        logouts: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let encoders = StubEncoders::new();
            let hub = StreamHub::new(
                EncoderRunMode::OnFirstAuthorized,
                Arc::clone(&encoders) as Arc<dyn EncoderControl>,
            );
            Self {
                hub,
                encoders,
                logins: Arc::new(AtomicUsize::new(0)),
                logouts: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn session(
            &self,
            outcome: Option<bool>,
        ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Outbound>) {
            let logins = Arc::clone(&self.logins);
            let logouts = Arc::clone(&self.logouts);
            let factory: AuthFactory = Arc::new(move |weak| {
                Arc::new(StubAuth {
                    session: weak,
                    outcome,
                    logins: Arc::clone(&logins),
                    logouts: Arc::clone(&logouts),
                }) as Arc<dyn AuthClient>
            });
            let id = self.hub.next_session_id();
            let (session, rx) = ClientSession::new(
                id,
                format!("10.0.0.{}:5000", id),
                Arc::downgrade(&self.hub),
                ReplayRouter::disabled(),
                factory,
            );
            assert!(self.hub.join(&session));
            (session, rx)
        }
    }

    fn login_message() -> IngressMessage {
        let login = ClientLogin {
            protocol_version: PROTOCOL_VERSION,
            username: "player1".into(),
            verification_type: 0,
            verification_data: b"secret".to_vec(),
        };
        let mut body = BytesMut::new();
        login.encode(&mut body);
        IngressMessage {
            action: ClientAction::Login as u8,
            body: body.freeze(),
        }
    }

    fn control_message() -> IngressMessage {
        // Keyboard press, scan 0x1E.
        let mut raw = vec![0u8, 0u8];
        raw.extend_from_slice(&42u32.to_be_bytes());
        raw.extend_from_slice(&0x1Eu16.to_be_bytes());
        raw.push(1);
        IngressMessage {
            action: ClientAction::Control as u8,
            body: Bytes::from(raw),
        }
    }

    #[tokio::test]
    async fn control_before_login_closes_session() {
        let fixture = Fixture::new();
        let (session, _rx) = fixture.session(None);
        let err = session.handle_message(&control_message()).unwrap_err();
        assert_eq!(err, ProtocolError::BadState);
    }

    #[tokio::test]
    async fn successful_login_authorizes_and_starts_encoders() {
        let fixture = Fixture::new();
        let (session, mut rx) = fixture.session(Some(true));

        session.handle_message(&login_message()).unwrap();
        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(fixture.hub.authorized_count(), 1);
        assert_eq!(fixture.encoders.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.encoders.keyframes.load(Ordering::SeqCst), 1);

        // Login result packet is the first outbound item.
        let Some(Outbound::Data(packet)) = rx.recv().await else {
            panic!("expected login result");
        };
        let header = crate::protocol::NetPacketHeader::decode(&packet).unwrap();
        assert_eq!(header.kind, PacketKind::LoginResult);
        let result =
            LoginResult::decode(&packet[crate::protocol::NetPacketHeader::LEN..]).unwrap();
        assert_eq!(result.error_code, 0);
    }

    #[tokio::test]
    async fn rejected_login_fails_and_closes_with_try_again_later() {
        let fixture = Fixture::new();
        let (session, mut rx) = fixture.session(Some(false));

        session.handle_message(&login_message()).unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!fixture.hub.contains(session.id()));
        assert_eq!(fixture.hub.session_count(), 0);

        let item = rx.recv().await.unwrap();
        assert_eq!(item, Outbound::Close(SessionCloseCode::TryAgainLater));
        // Auth handle logged out on close.
        assert_eq!(fixture.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relogin_is_ignored_in_authorizing_and_authorized() {
        let fixture = Fixture::new();

        // Authorizing: the stub never answers, so the state stays pending.
        let (session, _rx) = fixture.session(None);
        session.handle_message(&login_message()).unwrap();
        assert_eq!(session.state(), SessionState::Authorizing);
        session.handle_message(&login_message()).unwrap();
        assert_eq!(fixture.logins.load(Ordering::SeqCst), 1);

        // Authorized: a second login is dropped without side effect.
        let (session, _rx) = fixture.session(Some(true));
        session.handle_message(&login_message()).unwrap();
        assert_eq!(session.state(), SessionState::Authorized);
        session.handle_message(&login_message()).unwrap();
        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(fixture.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_media_packet_of_each_kind_gets_its_init_header() {
        let fixture = Fixture::new();
        let (session, mut rx) = fixture.session(Some(true));
        session.handle_message(&login_message()).unwrap();
        let _login_result = rx.recv().await;

        session.write(frame_packet(PacketKind::Audio, b"a0"));
        session.write(frame_packet(PacketKind::Audio, b"a1"));
        session.write(frame_packet(PacketKind::Video, b"v0"));

        let Some(Outbound::Data(first_audio)) = rx.recv().await else {
            panic!()
        };
        // Header run precedes the body in the same buffer; both parse as
        // self-delimiting packets.
        let header = crate::protocol::NetPacketHeader::decode(&first_audio).unwrap();
        assert_eq!(header.kind, PacketKind::Audio);
        assert_eq!(header.size as usize, b"AUDIOHDR".len());
        let body_at = crate::protocol::NetPacketHeader::LEN + header.size as usize;
        let body_header =
            crate::protocol::NetPacketHeader::decode(&first_audio[body_at..]).unwrap();
        assert_eq!(body_header.size as usize, 2);

        let Some(Outbound::Data(second_audio)) = rx.recv().await else {
            panic!()
        };
        // Latch set: only the bare body packet.
        assert_eq!(
            second_audio,
            frame_packet(PacketKind::Audio, b"a1")
        );

        let Some(Outbound::Data(first_video)) = rx.recv().await else {
            panic!()
        };
        let video_header = crate::protocol::NetPacketHeader::decode(&first_video).unwrap();
        assert_eq!(video_header.kind, PacketKind::Video);
        assert_eq!(video_header.size as usize, b"VIDEOHDR".len());
    }

    #[tokio::test]
    async fn backpressure_preserves_order() {
        let fixture = Fixture::new();
        let (session, mut rx) = fixture.session(Some(true));
        session.handle_message(&login_message()).unwrap();
        let _login_result = rx.recv().await;

        for i in 0..100u32 {
            session.write(frame_packet(PacketKind::Video, &i.to_be_bytes()));
        }
        // Client resumes: all 100 frames, in production order, each with a
        // correct header.
        let mut expected = 0u32;
        while expected < 100 {
            let Some(Outbound::Data(packet)) = rx.recv().await else {
                panic!("queue ended early");
            };
            let header = crate::protocol::NetPacketHeader::decode(&packet).unwrap();
            assert_eq!(header.kind, PacketKind::Video);
            let mut at = crate::protocol::NetPacketHeader::LEN;
            if expected == 0 {
                // First packet carries the injected init header run.
                assert_eq!(header.size as usize, b"VIDEOHDR".len());
                let body = crate::protocol::NetPacketHeader::decode(&packet[at + header.size as usize..]).unwrap();
                at = at + header.size as usize + crate::protocol::NetPacketHeader::LEN;
                assert_eq!(body.size, 4);
            }
            assert_eq!(&packet[at..at + 4], &expected.to_be_bytes());
            expected += 1;
        }
    }

    #[tokio::test]
    async fn last_authorized_leave_stops_encoders() {
        let fixture = Fixture::new();
        let (first, _rx1) = fixture.session(Some(true));
        let (second, _rx2) = fixture.session(Some(true));
        first.handle_message(&login_message()).unwrap();
        second.handle_message(&login_message()).unwrap();
        assert_eq!(fixture.encoders.starts.load(Ordering::SeqCst), 1);

        first.close(true);
        assert_eq!(fixture.encoders.stops.load(Ordering::SeqCst), 0);
        second.close(true);
        assert_eq!(fixture.encoders.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.hub.authorized_count(), 0);
    }

    #[tokio::test]
    async fn session_cap_rejects_the_ninth_client() {
        let fixture = Fixture::new();
        let mut sessions = Vec::new();
        for _ in 0..crate::config::MAX_CLIENTS {
            sessions.push(fixture.session(None));
        }
        // One more does not fit.
        let factory: AuthFactory = Arc::new(|_| {
            Arc::new(StubAuth {
                session: Weak::new(),
                outcome: None,
                logins: Arc::new(AtomicUsize::new(0)),
                logouts: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn AuthClient>
        });
        let (ninth, _rx) = ClientSession::new(
            999,
            "10.0.0.99:5000".into(),
            Arc::downgrade(&fixture.hub),
            ReplayRouter::disabled(),
            factory,
        );
        assert!(!fixture.hub.join(&ninth));
        assert_eq!(fixture.hub.session_count(), crate::config::MAX_CLIENTS);
    }
}
