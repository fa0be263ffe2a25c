//! Scoped publish/subscribe fan-out for live session events.
//!
//! One Tokio broadcast channel carries every event; each [`Subscription`]
//! filters by its [`EventScope`]. A tenant-level subscriber sees events of
//! every session under that tenant. Delivery is best-effort: subscribers
//! that fall behind skip events, and publishing with nobody listening is
//! not an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::message::Message;
use crate::session::{SessionId, SessionStatus};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Who an event concerns, and who a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Tenant.
    pub tenant_id: String,
    /// Session, or `None` for the whole tenant.
    pub session_id: Option<SessionId>,
}

impl EventScope {
    /// Scope covering every session of a tenant.
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: None,
        }
    }

    /// Scope covering a single session.
    pub fn session(session_id: &SessionId) -> Self {
        Self {
            tenant_id: session_id.tenant_id().to_owned(),
            session_id: Some(session_id.clone()),
        }
    }

    /// Whether an event published to `other` is visible in `self`.
    pub fn contains(&self, other: &EventScope) -> bool {
        self.tenant_id == other.tenant_id
            && match &self.session_id {
                None => true,
                Some(id) => other.session_id.as_ref() == Some(id),
            }
    }
}

/// Session status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Session.
    pub session_id: SessionId,
    /// New status.
    pub status: SessionStatus,
    /// Termination reason, if any.
    pub reason: Option<String>,
    /// Phone identity, if known.
    pub phone: Option<String>,
    /// Reconnect attempts so far.
    pub reconnect_attempts: u32,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// A fresh pairing challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrEvent {
    /// Session.
    pub session_id: SessionId,
    /// Raw challenge string.
    pub code: String,
    /// When the challenge was issued.
    pub issued_at: DateTime<Utc>,
}

/// Events published by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum CoreEvent {
    /// Session status changed.
    Status(StatusEvent),
    /// New QR challenge available.
    Qr(QrEvent),
    /// A message was stored (inbound or outbound).
    NewMessage(Box<Message>),
}

impl CoreEvent {
    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Qr(_) => "qr",
            Self::NewMessage(_) => "newMessage",
        }
    }
}

/// An event together with the scope it was published to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Published {
    /// Publication scope.
    pub scope: EventScope,
    /// The event.
    pub event: CoreEvent,
}

/// Fan-out hub for [`CoreEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Arc<Published>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers were live.
    pub fn publish(&self, scope: EventScope, event: CoreEvent) -> usize {
        let kind = event.kind();
        match self.tx.send(Arc::new(Published { scope, event })) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(event = kind, "no subscribers for event");
                0
            }
        }
    }

    /// Register interest in `scope`.
    pub fn subscribe(&self, scope: EventScope) -> Subscription {
        Subscription {
            scope,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live, scope-filtered view of the event stream.
#[derive(Debug)]
pub struct Subscription {
    scope: EventScope,
    rx: broadcast::Receiver<Arc<Published>>,
}

impl Subscription {
    /// The scope this subscription filters on.
    pub fn scope(&self) -> &EventScope {
        &self.scope
    }

    /// Wait for the next event in scope. Returns `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Arc<Published>> {
        loop {
            match self.rx.recv().await {
                Ok(published) if self.scope.contains(&published.scope) => return Some(published),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, tenant = %self.scope.tenant_id, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a [`Stream`] of in-scope events; lag gaps are skipped.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Published>> {
        let scope = self.scope;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(published) if scope.contains(&published.scope) => Some(published),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged, events dropped");
                None
            }
        })
    }
}
