//! Connection supervisor: one Tokio task per session.
//!
//! The supervisor owns its session's state. It opens the transport, reacts
//! to transport events strictly in arrival order, reconnects with bounded
//! linear backoff on transient closes, and tears the session down on
//! explicit stop, permanent close, or an exhausted reconnect budget.
//!
//! Every transition is mirrored to the relational store, the hint cache
//! and the event broadcaster. Those writes are best-effort: a failure is
//! logged and the state machine carries on.

pub mod backoff;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use self::backoff::ReconnectPolicy;

use crate::auth::{AuthBlob, AuthStore};
use crate::broadcast::{CoreEvent, EventBroadcaster, EventScope, QrEvent, StatusEvent};
use crate::hints::{HintCache, SessionHint};
use crate::ingest::IngestionPipeline;
use crate::registry::{Registration, SessionCommand, SessionHandle, SessionRegistry, StopKind};
use crate::session::{QrArtifact, SessionId, SessionState, SessionStatus};
use crate::store::{AuditEntry, AuditKind, MessageStore, SessionRow};
use crate::transport::{CloseReason, Transport, TransportError, TransportEvent};

/// Shared collaborators of every supervisor.
pub struct SupervisorContext {
    /// Chat-network adapter.
    pub transport: Arc<dyn Transport>,
    /// Credential store.
    pub auth: Arc<dyn AuthStore>,
    /// Relational store for session rows and audit entries.
    pub store: Arc<dyn MessageStore>,
    /// Optional restart hints.
    pub hints: Option<Arc<dyn HintCache>>,
    /// Live event fan-out.
    pub events: EventBroadcaster,
    /// Registry the session is listed in.
    pub registry: Arc<SessionRegistry>,
    /// Message ingestion.
    pub pipeline: Arc<IngestionPipeline>,
    /// Reconnect policy.
    pub policy: ReconnectPolicy,
}

impl std::fmt::Debug for SupervisorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorContext")
            .field("policy", &self.policy)
            .field("hints", &self.hints.is_some())
            .finish_non_exhaustive()
    }
}

/// Why the supervisor's main loop ended.
enum Exit {
    /// A stop command arrived.
    Stopped {
        kind: StopKind,
        done: Option<oneshot::Sender<()>>,
    },
    /// The transport closed for a non-transient reason.
    Closed(CloseReason),
    /// Too many transient closes in a row.
    Exhausted(CloseReason),
    /// The transport refused to open the session.
    OpenFailed(TransportError),
}

impl Exit {
    fn reason(&self) -> String {
        match self {
            Self::Stopped { kind, .. } => kind.reason().to_owned(),
            Self::Closed(reason) => reason.to_string(),
            Self::Exhausted(reason) => format!("reconnect attempts exhausted (last close: {reason})"),
            Self::OpenFailed(e) => format!("transport open failed: {e}"),
        }
    }
}

/// Outcome of pumping one transport connection.
enum Pump {
    Exit(Exit),
    Closed(CloseReason),
}

/// Spawn the supervisor task for a fresh registration.
pub fn spawn(ctx: Arc<SupervisorContext>, registration: Registration) -> JoinHandle<()> {
    let supervisor = Supervisor {
        ctx,
        handle: registration.handle,
        commands: registration.commands,
    };
    tokio::spawn(supervisor.run())
}

struct Supervisor {
    ctx: Arc<SupervisorContext>,
    handle: Arc<SessionHandle>,
    commands: mpsc::Receiver<SessionCommand>,
}

impl Supervisor {
    fn id(&self) -> &SessionId {
        self.handle.id()
    }

    async fn run(mut self) {
        info!(session_id = %self.id(), "supervisor started");
        let exit = self.drive().await;
        self.teardown(exit).await;
    }

    async fn drive(&mut self) -> Exit {
        loop {
            self.transition(SessionStatus::Connecting, |_| {}).await;
            let auth = self.load_credentials().await;

            let opened = tokio::select! {
                biased;
                cmd = self.commands.recv() => return on_command(cmd),
                opened = self.ctx.transport.open(self.handle.id(), auth) => opened,
            };

            let close = match opened {
                Ok(events) => match self.pump(events).await {
                    Pump::Exit(exit) => return exit,
                    Pump::Closed(reason) => reason,
                },
                Err(e) if e.is_transient() => {
                    warn!(session_id = %self.id(), error = %e, "transport open failed, will retry");
                    CloseReason::Other {
                        code: None,
                        message: e.to_string(),
                    }
                }
                Err(e) => return Exit::OpenFailed(e),
            };

            if !close.is_transient() {
                return Exit::Closed(close);
            }

            let attempt = self
                .handle
                .state()
                .borrow()
                .reconnect_attempts
                .saturating_add(1);
            if !self.ctx.policy.allows(attempt) {
                return Exit::Exhausted(close);
            }

            let delay = self.ctx.policy.delay(attempt);
            warn!(
                session_id = %self.id(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason = %close,
                "connection closed, reconnecting"
            );
            self.transition(SessionStatus::Reconnecting, |state| {
                state.reconnect_attempts = attempt;
                state.qr = None;
            })
            .await;

            tokio::select! {
                biased;
                cmd = self.commands.recv() => return on_command(cmd),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Process events of one open connection until it closes or a command arrives.
    async fn pump(&mut self, mut events: mpsc::Receiver<TransportEvent>) -> Pump {
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => return Pump::Exit(on_command(cmd)),
                event = events.recv() => match event {
                    None => return Pump::Closed(CloseReason::ConnectionLost),
                    Some(TransportEvent::Closed(reason)) => return Pump::Closed(reason),
                    Some(event) => self.handle_event(event).await,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        let now = Utc::now();
        match event {
            TransportEvent::Connecting => {
                if self.handle.status() == SessionStatus::QrReady {
                    self.transition(SessionStatus::Connecting, |state| state.qr = None)
                        .await;
                }
            }
            TransportEvent::Qr(code) => {
                let artifact = QrArtifact::new(code, now);
                let published = artifact.clone();
                if self
                    .transition(SessionStatus::QrReady, move |state| {
                        state.qr = Some(artifact);
                    })
                    .await
                {
                    self.ctx.events.publish(
                        EventScope::session(self.id()),
                        CoreEvent::Qr(QrEvent {
                            session_id: self.id().clone(),
                            code: published.code,
                            issued_at: published.issued_at,
                        }),
                    );
                }
            }
            TransportEvent::Connected { phone } => {
                let connected = self
                    .transition(SessionStatus::Connected, |state| {
                        if phone.is_some() {
                            state.phone = phone;
                        }
                        state.reconnect_attempts = 0;
                        state.qr = None;
                    })
                    .await;
                if connected {
                    info!(session_id = %self.id(), "session connected");
                }
            }
            TransportEvent::CredentialsUpdated(blob) => self.save_credentials(blob).await,
            TransportEvent::Message(raw) => {
                self.handle.state().send_modify(|state| state.touch(now));
                if let Err(e) = self.ctx.pipeline.ingest(self.id(), raw).await {
                    debug!(session_id = %self.id(), error = %e, "ingestion deferred");
                }
            }
            TransportEvent::Receipt(receipt) => {
                if let Err(e) = self.ctx.pipeline.apply_receipt(self.id(), receipt).await {
                    debug!(session_id = %self.id(), error = %e, "receipt deferred");
                }
            }
            TransportEvent::Closed(_) => {}
        }
    }

    /// Apply `update` and move to `next` atomically, then mirror the new
    /// state outward. Returns `false` if the transition table forbids it.
    async fn transition(
        &self,
        next: SessionStatus,
        update: impl FnOnce(&mut SessionState),
    ) -> bool {
        let now = Utc::now();
        let mut rejected = None;
        let applied = self.handle.state().send_if_modified(|state| {
            if !state.status.can_transition_to(next) {
                rejected = Some(state.status);
                return false;
            }
            update(state);
            state.transition(next, now).is_ok()
        });

        if let Some(from) = rejected {
            debug!(session_id = %self.id(), %from, to = %next, "ignoring illegal transition");
        }
        if applied {
            let snapshot = self.handle.snapshot();
            self.mirror(&snapshot).await;
        }
        applied
    }

    /// Persist, hint and publish a state snapshot.
    async fn mirror(&self, state: &SessionState) {
        let row = SessionRow {
            id: self.id().clone(),
            tenant_id: state.key.tenant_id.clone(),
            name: state.key.name.clone(),
            status: state.status,
            phone: state.phone.clone(),
            reason: state.reason.clone(),
            reconnect_attempts: state.reconnect_attempts,
            created_at: state.created_at,
            last_activity_at: state.last_activity_at,
        };
        if let Err(e) = self.ctx.store.record_session(&row).await {
            warn!(session_id = %self.id(), error = %e, "failed to persist session status");
        }

        if let Some(hints) = &self.ctx.hints {
            if state.status.is_terminal() {
                hints.remove(self.id()).await;
            } else {
                hints
                    .put(
                        self.id(),
                        SessionHint {
                            status: state.status,
                            phone: state.phone.clone(),
                            updated_at: state.status_since,
                        },
                    )
                    .await;
            }
        }

        self.ctx.events.publish(
            EventScope::session(self.id()),
            CoreEvent::Status(StatusEvent {
                session_id: self.id().clone(),
                status: state.status,
                reason: state.reason.clone(),
                phone: state.phone.clone(),
                reconnect_attempts: state.reconnect_attempts,
                at: state.status_since,
            }),
        );
    }

    async fn load_credentials(&self) -> Option<AuthBlob> {
        match self.ctx.auth.load(self.id()).await {
            Ok(Some(credential)) => {
                debug!(session_id = %self.id(), rotation = credential.rotation, "credentials loaded");
                Some(credential.blob)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "unable to load credentials, pairing afresh");
                None
            }
        }
    }

    async fn save_credentials(&self, blob: AuthBlob) {
        match self.ctx.auth.save(self.id(), blob).await {
            Ok(rotation) => debug!(session_id = %self.id(), rotation, "credentials rotated"),
            Err(e) => error!(session_id = %self.id(), error = %e, "failed to save credentials"),
        }
    }

    async fn teardown(self, exit: Exit) {
        let id = self.id().clone();
        let reason = exit.reason();
        self.ctx.registry.remove_if_current(&self.handle);

        let (logout, forget_credentials) = match &exit {
            Exit::Stopped { kind, .. } => (*kind == StopKind::Logout, *kind == StopKind::Logout),
            Exit::Closed(close) | Exit::Exhausted(close) => (false, close.invalidates_credentials()),
            Exit::OpenFailed(_) => (false, false),
        };

        let closed = if logout {
            self.ctx.transport.logout(&id).await
        } else {
            self.ctx.transport.close(&id).await
        };
        if let Err(e) = closed {
            debug!(session_id = %id, error = %e, "transport close during teardown failed");
        }
        if forget_credentials {
            if let Err(e) = self.ctx.auth.delete(&id).await {
                error!(session_id = %id, error = %e, "failed to delete credentials");
            }
        }

        let terminal_reason = reason.clone();
        self.transition(SessionStatus::Terminated, move |state| {
            state.reason = Some(terminal_reason);
            state.qr = None;
        })
        .await;

        let audit_kind = match &exit {
            Exit::Stopped {
                kind: StopKind::Shutdown,
                ..
            } => None,
            Exit::Stopped {
                kind: StopKind::Logout,
                ..
            } => Some(AuditKind::Logout),
            _ => Some(AuditKind::SessionTerminated),
        };
        if let Some(kind) = audit_kind {
            let entry = AuditEntry {
                kind,
                tenant_id: id.tenant_id().to_owned(),
                session_id: Some(id.clone()),
                detail: reason.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = self.ctx.store.append_audit(&entry).await {
                warn!(session_id = %id, error = %e, "failed to append audit entry");
            }
        }

        info!(session_id = %id, reason = %reason, "session terminated");
        if let Exit::Stopped {
            done: Some(done), ..
        } = exit
        {
            let _ = done.send(());
        }
    }
}

fn on_command(command: Option<SessionCommand>) -> Exit {
    match command {
        Some(SessionCommand::Stop { kind, done }) => Exit::Stopped {
            kind,
            done: Some(done),
        },
        // Every handle is gone; nobody can reach this session any more.
        None => Exit::Stopped {
            kind: StopKind::Shutdown,
            done: None,
        },
    }
}
