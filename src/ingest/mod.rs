//! Message ingestion: normalize, resolve contacts, upsert, publish.
//!
//! Ingestion never fails the caller's event loop. A store failure parks
//! the event in the [`RetryQueue`] and returns [`IngestError::Deferred`];
//! the retry sweeper replays it later through [`IngestionPipeline::process`].

pub mod normalize;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::broadcast::{CoreEvent, EventBroadcaster, EventScope};
use crate::contacts::ContactResolver;
use crate::message::{Direction, Message, Receipt};
use crate::retry::RetryQueue;
use crate::session::{PeerAddress, SessionId};
use crate::store::{MessageStore, StoreError};
use crate::transport::RawMessage;

use self::normalize::NormalizeError;

/// Errors surfaced by ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Persistence failed; the event was queued for retry.
    #[error("ingestion of {protocol_message_id} deferred: {source}")]
    Deferred {
        /// Protocol id of the deferred event.
        protocol_message_id: String,
        /// Underlying store failure.
        source: StoreError,
    },

    /// The event cannot be stored at all and was dropped.
    #[error("malformed event dropped: {0}")]
    Malformed(#[from] NormalizeError),
}

/// A unit of ingestion work, as parked in the retry queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum PendingEvent {
    /// Raw message from the transport.
    Message(RawMessage),
    /// Delivery/read receipt.
    Receipt(Receipt),
    /// Outbound message acknowledged by the transport.
    Outbound(Box<Message>),
}

impl PendingEvent {
    /// Protocol id of the message this event concerns.
    pub fn protocol_message_id(&self) -> &str {
        match self {
            Self::Message(raw) => &raw.id,
            Self::Receipt(receipt) => &receipt.message_id,
            Self::Outbound(message) => &message.protocol_message_id,
        }
    }
}

/// Failure of a single processing attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Event is unusable.
    #[error(transparent)]
    Malformed(#[from] NormalizeError),
    /// Store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normalizes and persists message events.
pub struct IngestionPipeline {
    store: Arc<dyn MessageStore>,
    contacts: ContactResolver,
    events: EventBroadcaster,
    retry: Arc<RetryQueue>,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("pending_retries", &self.retry.len())
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Create a pipeline writing to `store` and parking failures in `retry`.
    pub fn new(
        store: Arc<dyn MessageStore>,
        events: EventBroadcaster,
        retry: Arc<RetryQueue>,
    ) -> Self {
        Self {
            contacts: ContactResolver::new(Arc::clone(&store)),
            store,
            events,
            retry,
        }
    }

    /// The retry queue failures are parked in.
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    /// The store messages are written to.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Ingest a raw message seen on `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Deferred`] if the store failed (the event is
    /// queued for retry) or [`IngestError::Malformed`] if it was dropped.
    pub async fn ingest(
        &self,
        session_id: &SessionId,
        raw: RawMessage,
    ) -> Result<Message, IngestError> {
        match self.store_message(session_id, &raw).await {
            Ok(message) => Ok(message),
            Err(e) => Err(self.defer(session_id, PendingEvent::Message(raw), e)),
        }
    }

    /// Apply a delivery/read receipt. Returns `None` for unknown messages.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Deferred`] if the store failed.
    pub async fn apply_receipt(
        &self,
        session_id: &SessionId,
        receipt: Receipt,
    ) -> Result<Option<Message>, IngestError> {
        match self.store_receipt(session_id, &receipt).await {
            Ok(message) => Ok(message),
            Err(e) => Err(self.defer(session_id, PendingEvent::Receipt(receipt), e)),
        }
    }

    /// Record an outbound message the transport has acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Deferred`] if the store failed.
    pub async fn record_outbound(&self, message: Message) -> Result<Message, IngestError> {
        let session_id = message.session_id.clone();
        match self.store_outbound(&message).await {
            Ok(stored) => Ok(stored),
            Err(e) => Err(self.defer(&session_id, PendingEvent::Outbound(Box::new(message)), e)),
        }
    }

    /// Run one processing attempt without retry bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the attempt failed.
    pub async fn process(
        &self,
        session_id: &SessionId,
        event: &PendingEvent,
    ) -> Result<(), ProcessError> {
        match event {
            PendingEvent::Message(raw) => self.store_message(session_id, raw).await.map(drop),
            PendingEvent::Receipt(receipt) => {
                self.store_receipt(session_id, receipt).await.map(drop)
            }
            PendingEvent::Outbound(message) => self.store_outbound(message).await.map(drop),
        }
    }

    async fn store_message(
        &self,
        session_id: &SessionId,
        raw: &RawMessage,
    ) -> Result<Message, ProcessError> {
        let now = Utc::now();
        let message = normalize::normalize(session_id, raw, now)?;

        if message.direction == Direction::Inbound {
            match PeerAddress::parse(&message.peer) {
                Ok(peer) => {
                    let display_name = if peer.is_group() {
                        None
                    } else {
                        raw.push_name.as_deref()
                    };
                    self.contacts
                        .resolve(&message.tenant_id, &peer, display_name, now)
                        .await?;
                }
                Err(_) => trace!(peer = %message.peer, "peer is not a contact address"),
            }
        }

        let stored = self.store.upsert_message(&message).await?;
        debug!(
            session_id = %session_id,
            protocol_message_id = %stored.protocol_message_id,
            kind = %stored.kind,
            direction = stored.direction.as_str(),
            "message ingested"
        );
        self.publish(&stored);
        Ok(stored)
    }

    async fn store_receipt(
        &self,
        session_id: &SessionId,
        receipt: &Receipt,
    ) -> Result<Option<Message>, ProcessError> {
        let updated = self
            .store
            .apply_receipt(session_id.tenant_id(), receipt, receipt.at(Utc::now()))
            .await?;
        match &updated {
            Some(message) => trace!(
                session_id = %session_id,
                protocol_message_id = %message.protocol_message_id,
                status = message.status.as_str(),
                "receipt applied"
            ),
            None => debug!(
                session_id = %session_id,
                protocol_message_id = %receipt.message_id,
                "receipt for unknown message ignored"
            ),
        }
        Ok(updated)
    }

    async fn store_outbound(&self, message: &Message) -> Result<Message, ProcessError> {
        let stored = self.store.upsert_message(message).await?;
        self.publish(&stored);
        Ok(stored)
    }

    fn publish(&self, message: &Message) {
        self.events.publish(
            EventScope::session(&message.session_id),
            CoreEvent::NewMessage(Box::new(message.clone())),
        );
    }

    fn defer(&self, session_id: &SessionId, event: PendingEvent, error: ProcessError) -> IngestError {
        match error {
            ProcessError::Malformed(e) => {
                warn!(session_id = %session_id, error = %e, "dropping malformed event");
                IngestError::Malformed(e)
            }
            ProcessError::Store(source) => {
                let protocol_message_id = event.protocol_message_id().to_owned();
                warn!(
                    session_id = %session_id,
                    protocol_message_id = %protocol_message_id,
                    error = %source,
                    "ingestion failed, queued for retry"
                );
                self.retry
                    .enqueue(session_id, event, &source.to_string(), Utc::now());
                IngestError::Deferred {
                    protocol_message_id,
                    source,
                }
            }
        }
    }
}
