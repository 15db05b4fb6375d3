//! # Call Sessions and the Session Registry
//!
//! One `CallSession` holds everything the bridge knows about a phone call:
//! the metadata registered ahead of the audio connection, the TTL window,
//! the outbound audio sink bound when the connection arrives, and the
//! playback state the scheduler and barge-in fight over.
//!
//! ## Session Lifecycle:
//! 1. **Registered**: metadata arrives over HTTP before (or at) connect time
//! 2. **Connected**: the audio connection binds its output sink
//! 3. **Active**: utterances flow, responses play
//! 4. **Closed**: explicit hang-up, transport close/error, or TTL expiry
//!
//! ## Playback state:
//! Cancellation is a single atomic generation token rather than a flag plus
//! a cancellable timer handle: starting playback bumps the token and
//! captures it, and the frame loop asks "is my captured token still
//! current" before every frame. An interrupt bumps the token, which makes
//! "stop" win over "finish naturally" no matter how the two race at a frame
//! boundary. The `playing` flag is kept purely as status for the HTTP
//! surface and only changes together with a token transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Channel the connection handler drains onto the TCP socket. Frames sent
/// here end up on the wire for the caller to hear.
pub type AudioSink = mpsc::Sender<Vec<u8>>;

/// Call metadata registered by the PBX/upstream ahead of the audio
/// connection, keyed by `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub session_id: String,

    /// Dialed number the call came in on
    #[serde(rename = "DID")]
    pub did: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_phone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
}

/// Per-call state for the lifetime of one phone call.
pub struct CallSession {
    pub session_id: String,
    pub metadata: CallMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Outbound audio sink; set once per connection, replaced on reconnect.
    /// A session with no sink can never start playing.
    sink: Mutex<Option<AudioSink>>,

    /// Playback generation token. The current value names the only frame
    /// loop allowed to emit; every bump orphans whatever loop ran before.
    playback_gen: AtomicU64,

    /// Status flag for observability; the token above is the source of
    /// truth for cancellation.
    playing: AtomicBool,
}

impl CallSession {
    fn new(metadata: CallMetadata, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            session_id: metadata.session_id.clone(),
            metadata,
            created_at,
            expires_at: created_at + ttl,
            sink: Mutex::new(None),
            playback_gen: AtomicU64::new(0),
            playing: AtomicBool::new(false),
        }
    }

    /// A session is expired once `now` has passed `expires_at`.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Bind this connection's output sink, replacing any previous one
    /// (reconnect case).
    pub fn bind_sink(&self, sink: AudioSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    pub fn clear_sink(&self) {
        *self.sink.lock().unwrap() = None;
    }

    pub fn sink(&self) -> Option<AudioSink> {
        self.sink.lock().unwrap().clone()
    }

    /// Claim playback for a new frame loop.
    ///
    /// Orphans any in-flight loop (its token goes stale), marks the session
    /// playing, and returns the fresh token the new loop must present at
    /// every frame boundary. Returns `None` when no sink is bound.
    pub fn begin_playback(&self) -> Option<u64> {
        let sink = self.sink.lock().unwrap();
        sink.as_ref()?;

        let token = self.playback_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.playing.store(true, Ordering::SeqCst);
        Some(token)
    }

    /// Is `token` still the live playback generation?
    pub fn playback_token_current(&self, token: u64) -> bool {
        self.playback_gen.load(Ordering::SeqCst) == token
    }

    /// Called by a frame loop at exit, for any reason. Only the loop that
    /// still owns the current token may clear the playing flag; an orphaned
    /// loop exiting late must not stomp on its successor.
    pub fn end_playback(&self, token: u64) {
        if self.playback_token_current(token) {
            self.playing.store(false, Ordering::SeqCst);
        }
    }

    /// Cancel any in-flight playback. Idempotent: interrupting a session
    /// that is not playing changes nothing observable.
    pub fn interrupt_playback(&self) {
        self.playback_gen.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Owner of the `session_id → CallSession` map.
///
/// ## Concurrency:
/// The map is shared by every connection worker, the metadata HTTP
/// handlers, and the sweep timer. All map mutation (`create`, `delete`,
/// the lazy expiry inside `get`, `sweep_expired`) goes through this one
/// lock; a session's own fields carry their own synchronization, so
/// touching one call never blocks another.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or replace) a session from registered metadata.
    pub fn create(&self, metadata: CallMetadata, ttl: Duration) -> Arc<CallSession> {
        let session = Arc::new(CallSession::new(metadata, ttl));
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session.session_id.clone(), Arc::clone(&session));
        debug!(
            session_id = %session.session_id,
            expires_at = %session.expires_at,
            "session registered"
        );
        session
    }

    /// Look a session up, lazily deleting it when expired.
    ///
    /// A session past its TTL must never appear alive between sweeps, so
    /// expiry is enforced here too, not only in the periodic sweep.
    pub fn get(&self, session_id: &str) -> Option<Arc<CallSession>> {
        {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(session_id) {
                Some(session) if !session.is_expired() => return Some(Arc::clone(session)),
                Some(_) => {}
                None => return None,
            }
        }

        let mut sessions = self.sessions.write().unwrap();
        // Re-check under the write lock; a concurrent create may have
        // replaced the expired entry with a fresh one
        if let Some(session) = sessions.get(session_id) {
            if session.is_expired() {
                sessions.remove(session_id);
                debug!(session_id, "expired session removed on lookup");
            }
        }
        None
    }

    /// Delete a session. Idempotent: deleting twice reports `false` the
    /// second time and is not an error.
    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.write().unwrap().remove(session_id).is_some()
    }

    /// Periodic backstop for calls whose connection never cleanly closed.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired());
        let removed = before - sessions.len();

        if removed > 0 {
            info!(removed, "swept expired sessions");
        }
        removed
    }

    /// Number of live (non-expired) sessions.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions.values().filter(|s| !s.is_expired()).count()
    }

    /// Snapshot of live sessions for the HTTP surface.
    pub fn active_sessions(&self) -> Vec<Arc<CallSession>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .filter(|s| !s.is_expired())
            .cloned()
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(session_id: &str) -> CallMetadata {
        CallMetadata {
            session_id: session_id.to_string(),
            did: "18005550100".to_string(),
            caller_id: None,
            caller_phone: None,
            caller_name: None,
        }
    }

    #[test]
    fn test_create_and_get() {
        let registry = SessionRegistry::new();
        registry.create(metadata("abc123"), Duration::from_secs(60));

        let session = registry.get("abc123").expect("session should exist");
        assert_eq!(session.metadata.did, "18005550100");
        assert!(!session.is_expired());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_get_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get("nobody").is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.create(metadata("abc123"), Duration::from_secs(60));

        assert!(registry.delete("abc123"));
        assert!(!registry.delete("abc123"));
    }

    #[test]
    fn test_expired_session_vanishes_without_sweep() {
        let registry = SessionRegistry::new();
        registry.create(metadata("shortlived"), Duration::from_secs(1));

        assert!(registry.get("shortlived").is_some());
        std::thread::sleep(Duration::from_millis(1100));
        // No sweep ran; lazy expiry inside get must still hide it
        assert!(registry.get("shortlived").is_none());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let registry = SessionRegistry::new();
        registry.create(metadata("gone"), Duration::from_secs(0));
        registry.create(metadata("alive"), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.get("alive").is_some());
        assert_eq!(registry.sweep_expired(), 0);
    }

    #[test]
    fn test_playback_requires_sink() {
        let registry = SessionRegistry::new();
        let session = registry.create(metadata("abc123"), Duration::from_secs(60));

        assert!(session.begin_playback().is_none());
        assert!(!session.is_playing());

        let (tx, _rx) = mpsc::channel(4);
        session.bind_sink(tx);
        let token = session.begin_playback().expect("sink is bound");
        assert!(session.is_playing());
        assert!(session.playback_token_current(token));
    }

    #[test]
    fn test_interrupt_orphans_token_and_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.create(metadata("abc123"), Duration::from_secs(60));
        let (tx, _rx) = mpsc::channel(4);
        session.bind_sink(tx);

        let token = session.begin_playback().unwrap();
        session.interrupt_playback();
        assert!(!session.playback_token_current(token));
        assert!(!session.is_playing());

        // No-op on a non-playing session
        session.interrupt_playback();
        assert!(!session.is_playing());
    }

    #[test]
    fn test_stale_loop_cannot_clear_successor() {
        let registry = SessionRegistry::new();
        let session = registry.create(metadata("abc123"), Duration::from_secs(60));
        let (tx, _rx) = mpsc::channel(4);
        session.bind_sink(tx);

        let first = session.begin_playback().unwrap();
        let second = session.begin_playback().unwrap();
        assert!(!session.playback_token_current(first));

        // The orphaned loop exits late; the live loop stays marked playing
        session.end_playback(first);
        assert!(session.is_playing());

        session.end_playback(second);
        assert!(!session.is_playing());
    }
}
