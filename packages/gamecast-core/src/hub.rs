//! Session manager: accepts sessions, enforces the client cap, fans
//! packets out to authorized sessions, and drives encoder lifecycle on
//! first-join / last-leave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{EncoderRunMode, MAX_CLIENTS};
use crate::framer::PacketSink;
use crate::session::ClientSession;

/// Narrow encoder interface the hub and sessions need; implemented by the
/// engine. Keeps the hub free of encoder internals and breaks the
/// session-manager-engine cycle.
pub trait EncoderControl: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Framed audio init-header run (empty until captured).
    fn audio_header(&self) -> Bytes;
    /// Framed video init-header run (empty until captured).
    fn video_header(&self) -> Bytes;
    fn audio_codec_id(&self) -> u32;
    fn video_codec_id(&self) -> u32;
    /// One-shot forced IDR on the next video frame.
    fn produce_keyframe(&self);
}

/// Both registries live under one mutex: the authorized set is always a
/// subset of the session set and the cap checks must see both atomically.
#[derive(Default)]
struct Registries {
    sessions: HashMap<u64, Arc<ClientSession>>,
    authorized: HashSet<u64>,
}

pub struct StreamHub {
    max_clients: usize,
    mode: EncoderRunMode,
    registries: Mutex<Registries>,
    encoders: Arc<dyn EncoderControl>,
    next_id: AtomicU64,
}

impl StreamHub {
    pub fn new(mode: EncoderRunMode, encoders: Arc<dyn EncoderControl>) -> Arc<Self> {
        Arc::new(Self {
            max_clients: MAX_CLIENTS,
            mode,
            registries: Mutex::new(Registries::default()),
            encoders,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn encoders(&self) -> &Arc<dyn EncoderControl> {
        &self.encoders
    }

    /// Admits a new session. A session that would exceed the cap is
    /// rejected; the caller closes it with restart semantics.
    pub fn join(&self, session: &Arc<ClientSession>) -> bool {
        let mut registries = self.registries.lock();
        if registries.sessions.len() >= self.max_clients {
            log::warn!(
                "[Hub] Session cap reached ({}), rejecting {}",
                self.max_clients,
                session.remote()
            );
            return false;
        }
        registries
            .sessions
            .insert(session.id(), Arc::clone(session));
        true
    }

    /// Promotes a session after successful login. Starting the encoders on
    /// the first authorized session happens outside the registry lock.
    pub fn add_authorized(&self, session: &Arc<ClientSession>) -> bool {
        let (inserted, first) = {
            let mut registries = self.registries.lock();
            if !registries.sessions.contains_key(&session.id()) {
                (false, false)
            } else if registries.authorized.len() >= self.max_clients {
                (false, false)
            } else {
                let first = registries.authorized.is_empty();
                registries.authorized.insert(session.id());
                (true, first)
            }
        };
        if inserted && first && self.mode == EncoderRunMode::OnFirstAuthorized {
            log::info!("[Hub] First authorized session, starting encoders");
            self.encoders.start();
        }
        inserted
    }

    /// Detaches a session. Stopping the encoders on the last authorized
    /// leave happens outside the registry lock.
    pub fn leave(&self, session: &Arc<ClientSession>) {
        let last_authorized = {
            let mut registries = self.registries.lock();
            registries.sessions.remove(&session.id());
            registries.authorized.remove(&session.id()) && registries.authorized.is_empty()
        };
        if last_authorized && self.mode == EncoderRunMode::OnFirstAuthorized {
            log::info!("[Hub] Last authorized session left, stopping encoders");
            self.encoders.stop();
        }
    }

    pub fn session_count(&self) -> usize {
        self.registries.lock().sessions.len()
    }

    pub fn authorized_count(&self) -> usize {
        self.registries.lock().authorized.len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.registries.lock().sessions.contains_key(&id)
    }

    /// Closes every session. `restart` selects the close semantics the
    /// clients see (reconnect later vs. going away).
    pub fn stop(&self, restart: bool) {
        let sessions: Vec<Arc<ClientSession>> = {
            let registries = self.registries.lock();
            registries.sessions.values().cloned().collect()
        };
        for session in sessions {
            session.close(restart);
        }
    }
}

impl PacketSink for StreamHub {
    /// Fans the packet out to every authorized session. `Bytes` clones are
    /// refcount bumps, so the single-recipient case merely skips the bump.
    fn send(&self, packet: Bytes) -> usize {
        let recipients: Vec<Arc<ClientSession>> = {
            let registries = self.registries.lock();
            registries
                .authorized
                .iter()
                .filter_map(|id| registries.sessions.get(id).cloned())
                .collect()
        };
        let count = recipients.len();
        if count == 1 {
            recipients[0].write(packet);
        } else {
            for session in &recipients {
                session.write(packet.clone());
            }
        }
        count
    }
}
