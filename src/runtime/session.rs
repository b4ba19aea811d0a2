//! Suspension sessions and the finish rendezvous
//!
//! Each long-running chain root owns a stack of open sessions. A session
//! captures the envelope at `pause:start` and holds the resolver for the
//! deferred continuation handed back to the suspended walk. The `end` phase
//! needs one more rendezvous: it must not return until the resumed walk has
//! fully settled, so it registers a finisher under a serializable
//! correlation token carried in the envelope's options bag. Whoever settles
//! the chain notifies the finisher through [`SessionTable::notify_finish`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::envelope::Envelope;
use super::scope::ScopeId;

/// Options key the finish correlation token travels under.
pub const FINISH_TOKEN_KEY: &str = "finish_token";

/// One open suspension.
pub struct Session {
    /// The envelope as of `start`, amended by `run` and `end`.
    pub captured: Arc<Mutex<Envelope>>,
    /// Resolves the deferred continuation the suspended walk is parked on.
    pub resolve: oneshot::Sender<Envelope>,
}

#[derive(Default)]
struct SessionInner {
    stacks: HashMap<ScopeId, Vec<Session>>,
    finishers: HashMap<Uuid, oneshot::Sender<Envelope>>,
}

/// All open sessions and finish waiters, keyed by chain root.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<SessionInner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session capturing `envelope`. Returns the shared captured slot
    /// and the receiver the suspended walk parks on.
    pub fn open(&self, key: ScopeId, envelope: Envelope) -> (Arc<Mutex<Envelope>>, oneshot::Receiver<Envelope>) {
        let (resolve, rx) = oneshot::channel();
        let captured = Arc::new(Mutex::new(envelope));
        self.inner.lock().stacks.entry(key).or_default().push(Session {
            captured: Arc::clone(&captured),
            resolve,
        });
        debug!(key, "opened suspension session");
        (captured, rx)
    }

    /// The innermost open session's captured slot, if any.
    pub fn top_captured(&self, key: ScopeId) -> Option<Arc<Mutex<Envelope>>> {
        self.inner
            .lock()
            .stacks
            .get(&key)
            .and_then(|stack| stack.last())
            .map(|session| Arc::clone(&session.captured))
    }

    /// Pop the innermost open session.
    pub fn close(&self, key: ScopeId) -> Option<Session> {
        let mut inner = self.inner.lock();
        let stack = inner.stacks.get_mut(&key)?;
        let session = stack.pop();
        if stack.is_empty() {
            inner.stacks.remove(&key);
        }
        session
    }

    /// Register a finish waiter under a fresh correlation token.
    pub fn register_finisher(&self) -> (Uuid, oneshot::Receiver<Envelope>) {
        let (tx, rx) = oneshot::channel();
        let token = Uuid::new_v4();
        self.inner.lock().finishers.insert(token, tx);
        (token, rx)
    }

    /// If the envelope carries a finish token, strip it and hand the
    /// envelope to the matching waiter. Returns whether a waiter was
    /// notified.
    pub fn notify_finish(&self, envelope: &mut Envelope) -> bool {
        let token = envelope
            .options
            .get(FINISH_TOKEN_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok());
        let Some(token) = token else {
            return false;
        };
        envelope.options.remove(FINISH_TOKEN_KEY);
        let Some(waiter) = self.inner.lock().finishers.remove(&token) else {
            return false;
        };
        debug!(%token, "notifying finish waiter");
        waiter.send(envelope.clone()).is_ok()
    }
}
