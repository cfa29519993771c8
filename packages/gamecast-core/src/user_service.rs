//! User verification service client.
//!
//! Asynchronous JSON-RPC 2.0 over HTTP POST. Each session owns one client;
//! requests queue in a FIFO with at most one in flight. `login` must
//! precede any `keepalive`; `logout` is a notification (no request id) and
//! cancels the keep-alive timer. Transport failures retry a bounded number
//! of times before surfacing as an authentication failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::session::{AuthClient, ClientSession};

/// Bounded reconnection: up to three retries, seven seconds apart.
pub const MAX_RETRIES: usize = 3;
pub const RETRY_INTERVAL: Duration = Duration::from_secs(7);

/// Login payload forwarded to the user service. `verification_type` is
/// opaque and passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub version: u64,
    pub username: String,
    pub verification_type: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Login,
    KeepAlive,
    Logout,
}

struct Inner {
    endpoint: String,
    http: reqwest::Client,
    session: Weak<ClientSession>,
    username: Mutex<String>,
    session_id: Mutex<String>,
    queue: Mutex<VecDeque<(Method, Value)>>,
    retries: AtomicUsize,
    next_request_id: AtomicU64,
    keepalive_timer: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
}

pub struct UserServiceClient {
    inner: Arc<Inner>,
}

impl UserServiceClient {
    pub fn new(endpoint: String, session: Weak<ClientSession>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                endpoint,
                http: reqwest::Client::new(),
                session,
                username: Mutex::new(String::new()),
                session_id: Mutex::new(String::new()),
                queue: Mutex::new(VecDeque::new()),
                retries: AtomicUsize::new(0),
                next_request_id: AtomicU64::new(0),
                keepalive_timer: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn trigger_keepalive(&self) {
        Inner::keepalive(&self.inner);
    }
}

impl AuthClient for UserServiceClient {
    fn login(&self, verification: Verification) {
        *self.inner.username.lock() = verification.username.clone();
        let params = json!({
            "version": verification.version,
            "username": verification.username,
            "type": verification.verification_type,
            "data": String::from_utf8_lossy(&verification.data),
        });
        Inner::enqueue(&self.inner, Method::Login, params);
    }

    fn logout(&self) {
        // Logout supersedes any scheduled keepalive.
        if let Some(timer) = self.inner.keepalive_timer.lock().take() {
            timer.cancel();
        }
        let session_id = self.inner.session_id.lock().clone();
        if session_id.is_empty() {
            // Never logged in; nothing to tell the service.
            self.inner.closed.cancel();
            return;
        }
        let params = json!({ "session_id": session_id });
        Inner::enqueue(&self.inner, Method::Logout, params);
    }

    fn username(&self) -> String {
        self.inner.username.lock().clone()
    }
}

impl Drop for UserServiceClient {
    fn drop(&mut self) {
        // Stop periodic work but let a pending best-effort logout finish;
        // the bounded retry policy caps how long the drain task can live.
        if let Some(timer) = self.inner.keepalive_timer.lock().take() {
            timer.cancel();
        }
    }
}

impl Inner {
    /// Queues a request; starts the drain task when the queue was idle.
    fn enqueue(this: &Arc<Self>, method: Method, params: Value) {
        {
            let mut queue = this.queue.lock();
            queue.push_back((method, params));
            if queue.len() > 1 {
                return;
            }
        }
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            inner.drain().await;
        });
    }

    fn keepalive(this: &Arc<Self>) {
        let session_id = this.session_id.lock().clone();
        if session_id.is_empty() {
            log::debug!("[UserService] keepalive without login, skipped");
            return;
        }
        let params = json!({ "session_id": session_id });
        Self::enqueue(this, Method::KeepAlive, params);
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let front = { self.queue.lock().front().cloned() };
            let Some((method, params)) = front else {
                break;
            };
            self.perform(method, params).await;
            self.queue.lock().pop_front();
        }
    }

    fn request_body(&self, method: Method, params: Value) -> Value {
        let name = match method {
            Method::Login => "login",
            Method::KeepAlive => "keepalive",
            Method::Logout => "logout",
        };
        let mut body = json!({
            "jsonrpc": "2.0",
            "method": name,
            "params": params,
        });
        // A logout is a notification and carries no id.
        if method != Method::Logout {
            body["id"] = json!(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        }
        body
    }

    /// Sends one request, retrying transport failures with a fixed delay.
    async fn perform(self: &Arc<Self>, method: Method, params: Value) {
        let body = self.request_body(method, params);
        loop {
            if self.closed.is_cancelled() {
                return;
            }
            let response = self
                .http
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    self.handle_response(method, response).await;
                    return;
                }
                Err(e) => {
                    let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
                    log::error!(
                        "[UserService] {} connect error ({}/{}): {}",
                        self.endpoint,
                        attempt,
                        MAX_RETRIES,
                        e
                    );
                    if attempt > MAX_RETRIES {
                        self.retries.store(0, Ordering::SeqCst);
                        self.notify_failure(method);
                        return;
                    }
                    tokio::select! {
                        _ = self.closed.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn handle_response(self: &Arc<Self>, method: Method, response: reqwest::Response) {
        if method == Method::Logout {
            // Best effort; nothing to parse.
            self.retries.store(0, Ordering::SeqCst);
            return;
        }

        let parsed: Result<Value, _> = match response.error_for_status() {
            Ok(response) => response.json().await,
            Err(e) => Err(e),
        };
        let result = match parsed {
            Ok(value) => {
                self.retries.store(0, Ordering::SeqCst);
                extract_result(&value)
            }
            Err(e) => {
                log::error!("[UserService] {} bad response: {}", self.endpoint, e);
                None
            }
        };

        match method {
            Method::Login => {
                let authorized = match result {
                    Some((session_id, interval)) if !session_id.is_empty() => {
                        *self.session_id.lock() = session_id;
                        self.schedule_keepalive(interval);
                        true
                    }
                    _ => false,
                };
                if let Some(session) = self.session.upgrade() {
                    session.notify_login_result(authorized);
                }
            }
            Method::KeepAlive => {
                let kept_alive = match result {
                    Some((session_id, interval)) => {
                        // The service must echo our session id back.
                        let matches = *self.session_id.lock() == session_id;
                        if matches {
                            self.schedule_keepalive(interval);
                        }
                        matches
                    }
                    None => false,
                };
                if let Some(session) = self.session.upgrade() {
                    session.notify_keepalive_result(kept_alive);
                }
            }
            Method::Logout => {}
        }
    }

    fn notify_failure(&self, method: Method) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match method {
            Method::Login => session.notify_login_result(false),
            Method::KeepAlive => session.notify_keepalive_result(false),
            Method::Logout => {}
        }
    }

    fn schedule_keepalive(self: &Arc<Self>, interval_s: u64) {
        if interval_s == 0 {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.keepalive_timer.lock().replace(token.clone()) {
            previous.cancel();
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = inner.closed.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(interval_s)) => {
                    Inner::keepalive(&inner);
                }
            }
        });
    }
}

/// Pulls `(session_id, interval)` out of a JSON-RPC response.
fn extract_result(value: &Value) -> Option<(String, u64)> {
    let result = value.get("result")?.as_object()?;
    let session_id = result.get("session_id")?.as_str()?.to_string();
    let interval = result.get("interval")?.as_i64()?;
    Some((session_id, interval.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderRunMode;
    use crate::hub::{EncoderControl, StreamHub};
    use crate::protocol::PROTOCOL_VERSION;
    use crate::replay::ReplayRouter;
    use crate::session::{AuthFactory, Outbound, SessionCloseCode, SessionState};
    use bytes::Bytes;
    use std::net::SocketAddr;

    struct NullEncoders;

    impl EncoderControl for NullEncoders {
        fn start(&self) {}
        fn stop(&self) {}
        fn audio_header(&self) -> Bytes {
            Bytes::new()
        }
        fn video_header(&self) -> Bytes {
            Bytes::new()
        }
        fn audio_codec_id(&self) -> u32 {
            1
        }
        fn video_codec_id(&self) -> u32 {
            1
        }
        fn produce_keyframe(&self) {}
    }

    /// Minimal JSON-RPC endpoint: answers every POST with `response` and
    /// records request bodies.
    async fn mock_service(response: &'static str) -> (SocketAddr, Arc<Mutex<Vec<Value>>>) {
        use axum::routing::post;
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let app = axum::Router::new().route(
            "/",
            post(move |body: String| {
                let captured = Arc::clone(&captured);
                async move {
                    if let Ok(value) = serde_json::from_str::<Value>(&body) {
                        captured.lock().push(value);
                    }
                    ([("content-type", "application/json")], response)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, seen)
    }

    struct Fixture {
        hub: Arc<StreamHub>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                hub: StreamHub::new(
                    EncoderRunMode::OnFirstAuthorized,
                    Arc::new(NullEncoders) as Arc<dyn EncoderControl>,
                ),
            }
        }

        fn session(
            &self,
            endpoint: String,
        ) -> (
            Arc<ClientSession>,
            tokio::sync::mpsc::UnboundedReceiver<Outbound>,
        ) {
            let factory: AuthFactory = Arc::new(move |weak| {
                UserServiceClient::new(endpoint.clone(), weak) as Arc<dyn AuthClient>
            });
            let id = self.hub.next_session_id();
            let (session, rx) = ClientSession::new(
                id,
                format!("10.1.0.{}:6000", id),
                Arc::downgrade(&self.hub),
                ReplayRouter::disabled(),
                factory,
            );
            assert!(self.hub.join(&session));
            (session, rx)
        }
    }

    fn verification() -> Verification {
        Verification {
            version: PROTOCOL_VERSION,
            username: "nobody".into(),
            verification_type: 0,
            data: b"wrong".to_vec(),
        }
    }

    async fn settle(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn accepted_login_authorizes_the_session() {
        let (addr, seen) =
            mock_service(r#"{"result":{"session_id":"s1","interval":30}}"#).await;
        let fixture = Fixture::new();
        let (session, _rx) = fixture.session(format!("http://{}/", addr));

        let client = UserServiceClient::new(
            format!("http://{}/", addr),
            Arc::downgrade(&session),
        );
        client.login(verification());

        settle(|| session.state() == SessionState::Authorized).await;
        assert_eq!(fixture.hub.authorized_count(), 1);

        let requests = seen.lock();
        assert_eq!(requests[0]["method"], "login");
        assert_eq!(requests[0]["jsonrpc"], "2.0");
        assert_eq!(requests[0]["params"]["username"], "nobody");
        assert!(requests[0]["id"].is_number());
    }

    #[tokio::test]
    async fn null_result_rejects_login_and_closes_with_try_again_later() {
        let (addr, _seen) = mock_service(r#"{"result":null}"#).await;
        let fixture = Fixture::new();
        let (session, mut rx) = fixture.session(format!("http://{}/", addr));

        let client = UserServiceClient::new(
            format!("http://{}/", addr),
            Arc::downgrade(&session),
        );
        client.login(verification());

        settle(|| session.state() == SessionState::Failed).await;
        // Session disappears from the registry and the client is told to
        // try again later.
        assert_eq!(fixture.hub.session_count(), 0);
        let mut saw_close = false;
        while let Ok(item) = rx.try_recv() {
            if item == Outbound::Close(SessionCloseCode::TryAgainLater) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn keepalive_must_echo_the_same_session_id() {
        let (addr, _seen) =
            mock_service(r#"{"result":{"session_id":"other","interval":30}}"#).await;
        let fixture = Fixture::new();
        let (session, _rx) = fixture.session(format!("http://{}/", addr));

        let client = UserServiceClient::new(
            format!("http://{}/", addr),
            Arc::downgrade(&session),
        );
        // Pretend a login already bound "s1".
        *client.inner.session_id.lock() = "s1".into();
        session.force_state(SessionState::Authorized);

        client.trigger_keepalive();
        settle(|| session.state() == SessionState::Failed).await;
    }

    #[tokio::test]
    async fn logout_is_a_notification_and_cancels_keepalive() {
        let (addr, seen) =
            mock_service(r#"{"result":{"session_id":"s1","interval":1}}"#).await;
        let fixture = Fixture::new();
        let (session, _rx) = fixture.session(format!("http://{}/", addr));

        let client = UserServiceClient::new(
            format!("http://{}/", addr),
            Arc::downgrade(&session),
        );
        client.login(verification());
        settle(|| session.state() == SessionState::Authorized).await;

        client.logout();
        settle(|| {
            seen.lock()
                .iter()
                .any(|request| request["method"] == "logout")
        })
        .await;

        let requests = seen.lock();
        let logout = requests
            .iter()
            .find(|request| request["method"] == "logout")
            .unwrap();
        assert!(logout.get("id").is_none());
        assert_eq!(logout["params"]["session_id"], "s1");
        assert!(client.inner.keepalive_timer.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_login_failure() {
        let fixture = Fixture::new();
        // Nothing listens on this port.
        let (session, _rx) = fixture.session("http://127.0.0.1:9/".into());
        let client =
            UserServiceClient::new("http://127.0.0.1:9/".into(), Arc::downgrade(&session));
        client.login(verification());

        // Three retries at seven-second spacing, then failure surfaces.
        settle(|| session.state() == SessionState::Failed).await;
    }
}
