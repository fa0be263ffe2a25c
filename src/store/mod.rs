//! Relational persistence for sessions, messages, contacts, and the audit log.
//!
//! The core writes through the [`MessageStore`] trait. Every write is an
//! upsert keyed on the record's natural key so replays from the transport
//! or the retry queue are harmless. [`sqlite::SqliteStore`] is the
//! production implementation.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contacts::Contact;
use crate::message::{Message, Receipt};
use crate::session::{SessionId, SessionStatus};

pub use self::sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to apply.
    #[error("migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded.
    #[error("invalid {field} value: {value:?}")]
    InvalidValue {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// Payload JSON could not be encoded or decoded.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Persisted session status row: a best-effort restart hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    /// Session id (`tenant:name`).
    pub id: SessionId,
    /// Owning tenant.
    pub tenant_id: String,
    /// Session name.
    pub name: String,
    /// Last persisted status. `Terminated` is stored as `Disconnected`.
    pub status: SessionStatus,
    /// Phone identity, once known.
    pub phone: Option<String>,
    /// Termination reason, if any.
    pub reason: Option<String>,
    /// Reconnect attempts at the time of the write.
    pub reconnect_attempts: u32,
    /// When the session was first registered.
    pub created_at: DateTime<Utc>,
    /// Last transition or message seen.
    pub last_activity_at: DateTime<Utc>,
}

/// Category of an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A session was terminated by the supervisor.
    SessionTerminated,
    /// A session was explicitly logged out.
    Logout,
    /// An ingestion entry exhausted its retries.
    DeadLetter,
}

impl AuditKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionTerminated => "session_terminated",
            Self::Logout => "logout",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "session_terminated" => Ok(Self::SessionTerminated),
            "logout" => Ok(Self::Logout),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(StoreError::InvalidValue {
                field: "audit kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// What happened.
    pub kind: AuditKind,
    /// Tenant concerned.
    pub tenant_id: String,
    /// Session concerned, if any.
    pub session_id: Option<SessionId>,
    /// Free-form detail (reason, error, protocol id).
    pub detail: String,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Persistence contract used by the pipeline, supervisor and facade.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or merge a message keyed on `(tenant_id, protocol_message_id)`.
    ///
    /// An existing row keeps its payload; status only moves forward and
    /// delivery timestamps keep their earliest value. Returns the merged row.
    async fn upsert_message(&self, message: &Message) -> Result<Message, StoreError>;

    /// Apply a delivery/read receipt. Returns `None` if the message is unknown.
    async fn apply_receipt(
        &self,
        tenant_id: &str,
        receipt: &Receipt,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError>;

    /// Fetch a message by its protocol id.
    async fn message(
        &self,
        tenant_id: &str,
        protocol_message_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Number of stored messages for a tenant.
    async fn message_count(&self, tenant_id: &str) -> Result<u64, StoreError>;

    /// Insert or refresh a contact keyed on `(tenant_id, address)`.
    /// Returns the stored row.
    async fn upsert_contact(&self, contact: &Contact) -> Result<Contact, StoreError>;

    /// Fetch a contact.
    async fn contact(&self, tenant_id: &str, address: &str)
        -> Result<Option<Contact>, StoreError>;

    /// Write the latest status of a session.
    async fn record_session(&self, row: &SessionRow) -> Result<(), StoreError>;

    /// Read the persisted row of a session.
    async fn session_row(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError>;

    /// List persisted sessions, optionally for one tenant.
    async fn list_sessions(&self, tenant_id: Option<&str>) -> Result<Vec<SessionRow>, StoreError>;

    /// Append to the audit log.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Most recent audit entries, newest first.
    async fn audit_entries(
        &self,
        tenant_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError>;
}
