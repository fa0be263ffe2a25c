//! The [`Switchboard`] facade: session operations, background tasks, shutdown.
//!
//! Callers create sessions, read status and QR challenges, send messages
//! and subscribe to events through this type. Each session runs its own
//! supervisor task; sends go straight to the transport from the caller's
//! task so slow sessions never queue behind each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::auth::AuthStore;
use crate::broadcast::{CoreEvent, EventBroadcaster, EventScope, StatusEvent, Subscription};
use crate::hints::HintCache;
use crate::ingest::IngestionPipeline;
use crate::message::{Direction, Message, MessageKind, MessagePayload, MessageStatus};
use crate::reaper::{self, ReapReport, ReaperConfig};
use crate::registry::{SessionHandle, SessionRegistry, StopKind};
use crate::retry::{self, DeadLetter, FailedIngestion, RetryPolicy, RetryQueue, SweepReport};
use crate::session::{
    PeerAddress, QrArtifact, SessionError, SessionId, SessionKey, SessionState, SessionStatus,
    ValidationError,
};
use crate::store::{AuditEntry, AuditKind, MessageStore, SessionRow};
use crate::supervisor::{self, ReconnectPolicy, SupervisorContext};
use crate::transport::{OutboundPayload, Transport};

/// Runtime settings of the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchboardConfig {
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Failed-ingestion redelivery.
    pub retry: RetryPolicy,
    /// Stalled pairing and QR expiry.
    pub reaper: ReaperConfig,
    /// Bound on a single send.
    pub send_timeout: Duration,
    /// Bound on shutdown and on a single session stop.
    pub shutdown_timeout: Duration,
    /// Broadcast channel capacity.
    pub event_capacity: usize,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            retry: RetryPolicy::default(),
            reaper: ReaperConfig::default(),
            send_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
            event_capacity: crate::broadcast::DEFAULT_CAPACITY,
        }
    }
}

/// Builder for [`Switchboard`].
pub struct SwitchboardBuilder {
    transport: Arc<dyn Transport>,
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn AuthStore>,
    hints: Option<Arc<dyn HintCache>>,
    config: SwitchboardConfig,
}

impl std::fmt::Debug for SwitchboardBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchboardBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SwitchboardBuilder {
    /// Override the runtime settings.
    #[must_use]
    pub fn config(mut self, config: SwitchboardConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a hint cache.
    #[must_use]
    pub fn hints(mut self, hints: Arc<dyn HintCache>) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Assemble the core. Background tasks start with [`Switchboard::start`].
    pub fn build(self) -> Switchboard {
        let events = EventBroadcaster::new(self.config.event_capacity);
        let retry = Arc::new(RetryQueue::new(self.config.retry));
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&self.store),
            events.clone(),
            retry,
        ));
        let ctx = Arc::new(SupervisorContext {
            transport: self.transport,
            auth: self.auth,
            store: self.store,
            hints: self.hints,
            events,
            registry: Arc::new(SessionRegistry::new()),
            pipeline,
            policy: self.config.reconnect,
        });
        let (shutdown_tx, _) = watch::channel(false);

        Switchboard {
            ctx,
            config: self.config,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }
}

/// Session orchestration core.
pub struct Switchboard {
    ctx: Arc<SupervisorContext>,
    config: SwitchboardConfig,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("sessions", &self.ctx.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Switchboard {
    /// Start building a core around its three required collaborators.
    pub fn builder(
        transport: Arc<dyn Transport>,
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn AuthStore>,
    ) -> SwitchboardBuilder {
        SwitchboardBuilder {
            transport,
            store,
            auth,
            hints: None,
            config: SwitchboardConfig::default(),
        }
    }

    /// Spawn the idle reaper and the retry sweeper. Calling twice is a no-op.
    pub fn start(&self) {
        let Ok(mut background) = self.background.lock() else {
            warn!("background task list poisoned, not starting");
            return;
        };
        if !background.is_empty() {
            return;
        }
        background.push(tokio::spawn(reaper::run_reaper(
            Arc::clone(&self.ctx.registry),
            self.config.reaper,
            self.shutdown_tx.subscribe(),
        )));
        background.push(tokio::spawn(retry::run_retry_sweeper(
            Arc::clone(&self.ctx.pipeline),
            Arc::clone(&self.ctx.registry),
            self.shutdown_tx.subscribe(),
        )));
        info!("switchboard started");
    }

    /// The runtime settings.
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Register a session and start supervising it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] for bad identifiers,
    /// [`SessionError::AlreadyConnected`] if the session is live and connected,
    /// and [`SessionError::Timeout`] if a session being replaced does not stop
    /// within the shutdown timeout. In that case the old session stays live.
    pub async fn create_session(
        &self,
        tenant_id: &str,
        session_name: &str,
    ) -> Result<SessionId, SessionError> {
        let key = SessionKey::new(tenant_id, session_name)?;
        let mut registration = self.ctx.registry.create(key)?;

        if let Some(old) = registration.replaced.take() {
            let timeout = self.config.shutdown_timeout;
            if !old.stop(StopKind::Replaced, timeout).await {
                // The old supervisor still owns the connection; its teardown
                // would close it under a new one.
                let kept = self.ctx.registry.reinstate(&registration.handle, old);
                warn!(
                    session_id = %registration.handle.id(),
                    kept,
                    "replaced session did not stop in time, not starting a new one"
                );
                return Err(SessionError::Timeout(timeout));
            }
        }

        let id = registration.handle.id().clone();
        supervisor::spawn(Arc::clone(&self.ctx), registration);
        Ok(id)
    }

    /// Current QR challenge, unless none is pending or it has expired.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is not live.
    pub fn qr_artifact(&self, id: &SessionId) -> Result<Option<QrArtifact>, SessionError> {
        let handle = self.live(id)?;
        let ttl = self.config.reaper.qr_ttl;
        let now = Utc::now();
        let qr = handle.state().borrow().qr.clone();
        Ok(qr.filter(|qr| !qr.is_expired(ttl, now)))
    }

    /// Current QR challenge rendered as SVG.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is not live.
    pub fn qr_svg(&self, id: &SessionId) -> Result<Option<String>, SessionError> {
        let Some(qr) = self.qr_artifact(id)? else {
            return Ok(None);
        };
        match qr.render_svg() {
            Ok(svg) => Ok(Some(svg)),
            Err(e) => {
                warn!(session_id = %id, error = %e, "QR challenge could not be rendered");
                Ok(None)
            }
        }
    }

    /// Status of a session: live state first, then hints, then the store.
    ///
    /// Hints and rows only prove the session exists. Without a running
    /// supervisor it is reported at rest, whatever was last recorded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no source knows the session.
    pub async fn status(&self, id: &SessionId) -> Result<SessionStatus, SessionError> {
        if let Some(handle) = self.ctx.registry.get(id) {
            return Ok(handle.status());
        }
        if let Some(hints) = &self.ctx.hints {
            if let Some(hint) = hints.get(id).await {
                return Ok(hint.status.at_rest());
            }
        }
        match self.ctx.store.session_row(id).await? {
            Some(row) => Ok(row.status.at_rest()),
            None => Err(SessionError::NotFound(id.clone())),
        }
    }

    /// Full live state of a session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is not live.
    pub fn session(&self, id: &SessionId) -> Result<SessionState, SessionError> {
        self.ctx.registry.state(id)
    }

    /// Watch a live session's state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is not live.
    pub fn watch(&self, id: &SessionId) -> Result<watch::Receiver<SessionState>, SessionError> {
        Ok(self.live(id)?.watch())
    }

    /// Live sessions of a tenant.
    pub fn list_sessions(&self, tenant_id: &str) -> Vec<SessionState> {
        self.ctx.registry.list_by_tenant(tenant_id)
    }

    /// Whether a session is live.
    pub fn is_live(&self, id: &SessionId) -> bool {
        self.ctx.registry.get(id).is_some()
    }

    /// Log out and tear down a session, deleting its credentials.
    ///
    /// A session that is not live but has a persisted row only has its
    /// credentials removed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the session is unknown.
    pub async fn disconnect(&self, id: &SessionId) -> Result<(), SessionError> {
        let Some(handle) = self.ctx.registry.get(id) else {
            if self.ctx.store.session_row(id).await?.is_none() {
                return Err(SessionError::NotFound(id.clone()));
            }
            self.forget_credentials(id).await;
            self.audit(AuditKind::Logout, id, "credentials removed while offline")
                .await;
            return Ok(());
        };

        if handle
            .stop(StopKind::Logout, self.config.shutdown_timeout)
            .await
        {
            return Ok(());
        }

        warn!(session_id = %id, "forcing teardown of unresponsive session");
        self.force_terminate(&handle, "forced disconnect").await;
        if let Err(e) = self.ctx.transport.logout(id).await {
            debug!(session_id = %id, error = %e, "logout after forced teardown failed");
        }
        self.forget_credentials(id).await;
        self.audit(AuditKind::Logout, id, "forced disconnect").await;
        Ok(())
    }

    /// Persisted sessions that are not live but still have credentials.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the session rows cannot be read.
    pub async fn resumable_sessions(&self) -> Result<Vec<SessionRow>, SessionError> {
        let mut resumable = Vec::new();
        for row in self.ctx.store.list_sessions(None).await? {
            if self.is_live(&row.id) {
                continue;
            }
            match self.ctx.auth.exists(&row.id).await {
                Ok(true) => resumable.push(row),
                Ok(false) => {}
                Err(e) => warn!(session_id = %row.id, error = %e, "cannot check credentials"),
            }
        }
        Ok(resumable)
    }

    /// Re-enter `connecting` for every resumable session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the session rows cannot be read.
    /// Individual sessions that fail to resume are logged and skipped.
    pub async fn resume_all(&self) -> Result<Vec<SessionId>, SessionError> {
        let mut resumed = Vec::new();
        for row in self.resumable_sessions().await? {
            match self.create_session(&row.tenant_id, &row.name).await {
                Ok(id) => resumed.push(id),
                Err(e) => warn!(session_id = %row.id, error = %e, "resume failed"),
            }
        }
        info!(count = resumed.len(), "sessions resumed");
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Validation errors for a malformed peer or empty text;
    /// [`SessionError::NotConnected`] or [`SessionError::Timeout`] (both
    /// transient) when the session cannot send right now.
    pub async fn send_text(
        &self,
        id: &SessionId,
        peer: &str,
        text: &str,
        acting_user: Option<&str>,
    ) -> Result<Message, SessionError> {
        let peer = PeerAddress::parse(peer)?;
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyBody.into());
        }
        let outbound = OutboundPayload::Text {
            text: text.to_owned(),
        };
        let payload = MessagePayload::Text {
            text: text.to_owned(),
        };
        self.send(id, &peer, outbound, MessageKind::Text, payload, acting_user)
            .await
    }

    /// Send a media message.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text); additionally rejects non-media
    /// kinds and empty bodies.
    pub async fn send_media(
        &self,
        id: &SessionId,
        peer: &str,
        kind: MessageKind,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<Message, SessionError> {
        let peer = PeerAddress::parse(peer)?;
        if !kind.is_media() {
            return Err(ValidationError::UnsupportedMediaKind(kind.to_string()).into());
        }
        if bytes.is_empty() {
            return Err(ValidationError::EmptyBody.into());
        }
        let payload = MessagePayload::Media {
            caption: caption.map(str::to_owned),
            mime_type: None,
            file_name: None,
            url: None,
            size_bytes: u64::try_from(bytes.len()).ok(),
        };
        let outbound = OutboundPayload::Media {
            kind,
            bytes,
            caption: caption.map(str::to_owned),
        };
        self.send(id, &peer, outbound, kind, payload, None).await
    }

    async fn send(
        &self,
        id: &SessionId,
        peer: &PeerAddress,
        outbound: OutboundPayload,
        kind: MessageKind,
        payload: MessagePayload,
        acting_user: Option<&str>,
    ) -> Result<Message, SessionError> {
        let status = match self.ctx.registry.get(id) {
            Some(handle) => handle.status(),
            // The row only tells unknown sessions apart from stopped ones.
            None => match self.ctx.store.session_row(id).await? {
                Some(row) => row.status.at_rest(),
                None => return Err(SessionError::NotFound(id.clone())),
            },
        };
        if status != SessionStatus::Connected {
            return Err(SessionError::NotConnected {
                id: id.clone(),
                status,
            });
        }

        let timeout = self.config.send_timeout;
        let ack = tokio::time::timeout(timeout, self.ctx.transport.send(id, peer, &outbound))
            .await
            .map_err(|_| SessionError::Timeout(timeout))??;

        let message = Message {
            tenant_id: id.tenant_id().to_owned(),
            session_id: id.clone(),
            protocol_message_id: ack.message_id,
            direction: Direction::Outbound,
            peer: peer.to_string(),
            kind,
            payload,
            status: MessageStatus::Sent,
            sent_at: ack.timestamp.unwrap_or_else(Utc::now),
            delivered_at: None,
            read_at: None,
            acting_user: acting_user.map(str::to_owned),
        };

        // The network already has the message; a store failure is queued
        // for retry and must not turn the send into an error.
        match self.ctx.pipeline.record_outbound(message.clone()).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                debug!(session_id = %id, error = %e, "outbound record deferred");
                Ok(message)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events and operator surfaces
    // -----------------------------------------------------------------------

    /// Subscribe to events in `scope`.
    pub fn subscribe(&self, scope: EventScope) -> Subscription {
        self.ctx.events.subscribe(scope)
    }

    /// Most recent dead-lettered ingestion entries, newest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.ctx.pipeline.retry_queue().dead_letters()
    }

    /// Total dead-lettered entries since start.
    pub fn dead_letter_count(&self) -> u64 {
        self.ctx.pipeline.retry_queue().dead_letter_count()
    }

    /// Entries waiting for redelivery.
    pub fn pending_retries(&self) -> Vec<FailedIngestion> {
        self.ctx.pipeline.retry_queue().pending()
    }

    /// Run a retry sweep immediately.
    pub async fn retry_now(&self) -> SweepReport {
        retry::sweep(&self.ctx.pipeline, &self.ctx.registry, Utc::now()).await
    }

    /// Run a reaper sweep immediately.
    pub fn reap_now(&self) -> ReapReport {
        reaper::reap_once(&self.ctx.registry, &self.config.reaper, Utc::now())
    }

    /// Recent audit entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] if the audit log cannot be read.
    pub async fn audit_log(
        &self,
        tenant_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, SessionError> {
        Ok(self.ctx.store.audit_entries(tenant_id, limit).await?)
    }

    /// The relational store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.ctx.store
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop background tasks and close every live session, keeping
    /// credentials. Bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) {
        info!("switchboard shutting down");
        let _ = self.shutdown_tx.send(true);
        let timeout = self.config.shutdown_timeout;

        let background: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut stops = JoinSet::new();
        for handle in self.ctx.registry.handles() {
            stops.spawn(async move {
                if !handle.stop(StopKind::Shutdown, timeout).await {
                    warn!(session_id = %handle.id(), "session did not close before shutdown deadline");
                }
            });
        }

        let drained = tokio::time::timeout(timeout, async {
            for task in background {
                let _ = task.await;
            }
            while stops.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!("switchboard stopped"),
            Err(_) => {
                warn!(
                    remaining = self.ctx.registry.len(),
                    "shutdown deadline reached, abandoning remaining sessions"
                );
                stops.abort_all();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn live(&self, id: &SessionId) -> Result<Arc<SessionHandle>, SessionError> {
        self.ctx
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Terminate a session whose supervisor stopped responding.
    async fn force_terminate(&self, handle: &SessionHandle, reason: &str) {
        self.ctx.registry.remove_if_current(handle);
        let now = Utc::now();
        handle.state().send_modify(|state| {
            state.reason = Some(reason.to_owned());
            state.qr = None;
            if let Err(e) = state.transition(SessionStatus::Terminated, now) {
                debug!(error = %e, "session already terminated");
            }
        });

        let state = handle.snapshot();
        let row = SessionRow {
            id: handle.id().clone(),
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
            warn!(session_id = %handle.id(), error = %e, "failed to persist forced termination");
        }
        if let Some(hints) = &self.ctx.hints {
            hints.remove(handle.id()).await;
        }
        self.ctx.events.publish(
            EventScope::session(handle.id()),
            CoreEvent::Status(StatusEvent {
                session_id: handle.id().clone(),
                status: state.status,
                reason: state.reason,
                phone: state.phone,
                reconnect_attempts: state.reconnect_attempts,
                at: state.status_since,
            }),
        );
    }

    async fn forget_credentials(&self, id: &SessionId) {
        if let Err(e) = self.ctx.auth.delete(id).await {
            warn!(session_id = %id, error = %e, "failed to delete credentials");
        }
    }

    async fn audit(&self, kind: AuditKind, id: &SessionId, detail: &str) {
        let entry = AuditEntry {
            kind,
            tenant_id: id.tenant_id().to_owned(),
            session_id: Some(id.clone()),
            detail: detail.to_owned(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.ctx.store.append_audit(&entry).await {
            warn!(session_id = %id, error = %e, "failed to append audit entry");
        }
    }
}
