//! In-memory registry of live sessions.
//!
//! The registry is the source of truth for "is this session live right
//! now". Entries are sharded in a [`DashMap`], so operations on different
//! sessions never contend on one lock. Each entry is a [`SessionHandle`]:
//! a read view of the session's state (a `watch` channel written only by
//! its supervisor) plus a command channel to that supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::session::{SessionError, SessionId, SessionKey, SessionState, SessionStatus};

/// Command channel capacity per session. Commands are rare.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Why a supervisor is being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopKind {
    /// Explicit disconnect: unlink the device and delete credentials.
    Logout,
    /// Process shutdown: close the connection, keep credentials.
    Shutdown,
    /// A newer registration for the same key took over.
    Replaced,
    /// Pairing did not finish in time.
    IdleTimeout,
}

impl StopKind {
    /// Termination reason recorded for this kind of stop.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Logout => "logged out",
            Self::Shutdown => "shutdown",
            Self::Replaced => "replaced by a new session",
            Self::IdleTimeout => "pairing timed out",
        }
    }
}

/// Commands accepted by a session supervisor.
#[derive(Debug)]
pub enum SessionCommand {
    /// Tear the session down and acknowledge on `done`.
    Stop {
        /// Why.
        kind: StopKind,
        /// Signalled after teardown completes.
        done: oneshot::Sender<()>,
    },
}

/// Registry entry for one live session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    generation: u64,
    state: watch::Sender<SessionState>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Registration generation; distinguishes a replaced entry from its successor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Writer side of the state channel. Only the supervisor and the
    /// reaper's QR expiry write through it.
    pub(crate) fn state(&self) -> &watch::Sender<SessionState> {
        &self.state
    }

    /// Ask the supervisor to stop and wait up to `timeout` for teardown.
    ///
    /// Returns `true` if the session is torn down when this returns.
    pub async fn stop(&self, kind: StopKind, timeout: Duration) -> bool {
        let (done, ack) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Stop { kind, done })
            .await
            .is_err()
        {
            // Supervisor already exited.
            return self.status().is_terminal();
        }
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => self.status().is_terminal(),
            Err(_) => {
                warn!(session_id = %self.id, ?kind, "supervisor did not stop in time");
                false
            }
        }
    }

    /// Request a stop without waiting. Returns `false` if the request
    /// could not be queued.
    pub fn request_stop(&self, kind: StopKind) -> bool {
        let (done, _ack) = oneshot::channel();
        self.commands
            .try_send(SessionCommand::Stop { kind, done })
            .is_ok()
    }
}

/// A freshly registered session, ready for its supervisor.
#[derive(Debug)]
pub struct Registration {
    /// The new registry entry.
    pub handle: Arc<SessionHandle>,
    /// Receiver end of the command channel, owned by the supervisor.
    pub commands: mpsc::Receiver<SessionCommand>,
    /// Entry this registration displaced, which must be stopped before
    /// the new supervisor starts.
    pub replaced: Option<Arc<SessionHandle>>,
}

/// Map of live sessions keyed by [`SessionId`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    generation: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyConnected`] if a live entry for the
    /// same key is `connected`. Any other existing entry is displaced and
    /// returned in [`Registration::replaced`].
    pub fn create(&self, key: SessionKey) -> Result<Registration, SessionError> {
        let id = key.session_id();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(SessionState::new(key, Utc::now()));
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            generation,
            state,
            commands: commands_tx,
        });

        let replaced = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                let status = existing.get().status();
                if status == SessionStatus::Connected {
                    return Err(SessionError::AlreadyConnected(id));
                }
                debug!(session_id = %id, %status, "replacing existing registry entry");
                Some(existing.insert(Arc::clone(&handle)))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                None
            }
        };

        info!(session_id = %id, generation, "session registered");
        Ok(Registration {
            handle,
            commands: commands_rx,
            replaced,
        })
    }

    /// Look up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Current state of a live session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is not live.
    pub fn state(&self, id: &SessionId) -> Result<SessionState, SessionError> {
        self.get(id)
            .map(|handle| handle.snapshot())
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Remove an entry unconditionally.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    /// Remove `handle`'s entry only if it has not been replaced since.
    pub fn remove_if_current(&self, handle: &SessionHandle) -> bool {
        self.sessions
            .remove_if(handle.id(), |_, current| {
                current.generation() == handle.generation()
            })
            .is_some()
    }

    /// Hand `handle`'s slot back to the entry it displaced.
    ///
    /// Only applies while `handle` is still current. A `previous` entry
    /// that has already terminated is not restored; the slot is cleared
    /// instead. Returns whether `previous` is live again.
    pub fn reinstate(&self, handle: &SessionHandle, previous: Arc<SessionHandle>) -> bool {
        match self.sessions.entry(handle.id().clone()) {
            Entry::Occupied(mut slot) if slot.get().generation() == handle.generation() => {
                if previous.status().is_terminal() {
                    slot.remove();
                    false
                } else {
                    slot.insert(previous);
                    true
                }
            }
            _ => false,
        }
    }

    /// States of every live session of a tenant, ordered by name.
    pub fn list_by_tenant(&self, tenant_id: &str) -> Vec<SessionState> {
        let mut states: Vec<SessionState> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().tenant_id() == tenant_id)
            .map(|entry| entry.value().snapshot())
            .collect();
        states.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        states
    }

    /// Every live handle.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
