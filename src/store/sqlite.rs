//! SQLite-backed [`MessageStore`].
//!
//! Writes go straight through the pool; WAL mode lets sessions persist
//! concurrently without a shared writer task.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, trace};

use super::{AuditEntry, AuditKind, MessageStore, SessionRow, StoreError};
use crate::contacts::Contact;
use crate::message::{Direction, Message, MessageKind, MessagePayload, MessageStatus, Receipt};
use crate::session::{SessionId, SessionStatus};

/// Schema applied on connect.
const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// Pool size for file-backed databases.
const MAX_CONNECTIONS: u32 = 8;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MESSAGE_COLUMNS: &str = "tenant_id, session_id, protocol_message_id, direction, peer, \
     kind, payload, status, sent_at, delivered_at, read_at, acting_user";

const SESSION_COLUMNS: &str =
    "id, tenant_id, name, status, phone, reason, reconnect_attempts, created_at, last_activity_at";

const CONTACT_COLUMNS: &str =
    "tenant_id, address, display_name, is_group, first_seen_at, last_seen_at";

/// SQLite implementation of [`MessageStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or migrated.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let db = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self::new(db);
        store.migrate().await?;
        info!(path = %path.display(), "message store opened");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use
    /// unless the schema is already in place.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Apply the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.db)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.db.close().await;
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn upsert_message(&self, message: &Message) -> Result<Message, StoreError> {
        let payload = serde_json::to_string(&message.payload)?;
        let sql = format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}, status_rank) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT (tenant_id, protocol_message_id) DO UPDATE SET \
               status = CASE WHEN excluded.status_rank > messages.status_rank \
                             THEN excluded.status ELSE messages.status END, \
               status_rank = MAX(messages.status_rank, excluded.status_rank), \
               delivered_at = COALESCE(MIN(messages.delivered_at, excluded.delivered_at), \
                                       messages.delivered_at, excluded.delivered_at), \
               read_at = COALESCE(MIN(messages.read_at, excluded.read_at), \
                                  messages.read_at, excluded.read_at), \
               acting_user = COALESCE(messages.acting_user, excluded.acting_user) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&message.tenant_id)
            .bind(message.session_id.as_str())
            .bind(&message.protocol_message_id)
            .bind(message.direction.as_str())
            .bind(&message.peer)
            .bind(message.kind.as_str())
            .bind(&payload)
            .bind(message.status.as_str())
            .bind(message.sent_at.timestamp_millis())
            .bind(message.delivered_at.map(|t| t.timestamp_millis()))
            .bind(message.read_at.map(|t| t.timestamp_millis()))
            .bind(&message.acting_user)
            .bind(message.status.rank())
            .fetch_one(&self.db)
            .await?;

        trace!(
            tenant = %message.tenant_id,
            protocol_message_id = %message.protocol_message_id,
            "message upserted"
        );
        message_from_row(&row)
    }

    async fn apply_receipt(
        &self,
        tenant_id: &str,
        receipt: &Receipt,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let rank = receipt.status.rank();
        let at = at.timestamp_millis();
        let sql = format!(
            "UPDATE messages SET \
               status = CASE WHEN ?1 > status_rank THEN ?2 ELSE status END, \
               status_rank = MAX(status_rank, ?1), \
               delivered_at = CASE WHEN ?1 >= ?3 THEN COALESCE(delivered_at, ?4) \
                                   ELSE delivered_at END, \
               read_at = CASE WHEN ?1 >= ?5 THEN COALESCE(read_at, ?4) ELSE read_at END \
             WHERE tenant_id = ?6 AND protocol_message_id = ?7 \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(rank)
            .bind(receipt.status.as_str())
            .bind(MessageStatus::Delivered.rank())
            .bind(at)
            .bind(MessageStatus::Read.rank())
            .bind(tenant_id)
            .bind(&receipt.message_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn message(
        &self,
        tenant_id: &str,
        protocol_message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE tenant_id = ?1 AND protocol_message_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(protocol_message_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn message_count(&self, tenant_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_one(&self.db)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<Contact, StoreError> {
        let sql = format!(
            "INSERT INTO contacts ({CONTACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (tenant_id, address) DO UPDATE SET \
               display_name = COALESCE(excluded.display_name, contacts.display_name), \
               last_seen_at = MAX(contacts.last_seen_at, excluded.last_seen_at) \
             RETURNING {CONTACT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&contact.tenant_id)
            .bind(&contact.address)
            .bind(&contact.display_name)
            .bind(contact.is_group)
            .bind(contact.first_seen_at.timestamp_millis())
            .bind(contact.last_seen_at.timestamp_millis())
            .fetch_one(&self.db)
            .await?;
        contact_from_row(&row)
    }

    async fn contact(
        &self,
        tenant_id: &str,
        address: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let sql =
            format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND address = ?2");
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(address)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn record_session(&self, row: &SessionRow) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT (id) DO UPDATE SET \
               status = excluded.status, \
               phone = COALESCE(excluded.phone, sessions.phone), \
               reason = excluded.reason, \
               reconnect_attempts = excluded.reconnect_attempts, \
               last_activity_at = excluded.last_activity_at"
        );
        sqlx::query(&sql)
            .bind(row.id.as_str())
            .bind(&row.tenant_id)
            .bind(&row.name)
            .bind(row.status.persisted_str())
            .bind(&row.phone)
            .bind(&row.reason)
            .bind(i64::from(row.reconnect_attempts))
            .bind(row.created_at.timestamp_millis())
            .bind(row.last_activity_at.timestamp_millis())
            .execute(&self.db)
            .await?;
        trace!(session_id = %row.id, status = row.status.persisted_str(), "session row written");
        Ok(())
    }

    async fn session_row(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self, tenant_id: Option<&str>) -> Result<Vec<SessionRow>, StoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE ?1 IS NULL OR tenant_id = ?1 ORDER BY tenant_id, name"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (kind, tenant_id, session_id, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(entry.kind.as_str())
        .bind(&entry.tenant_id)
        .bind(entry.session_id.as_ref().map(SessionId::as_str))
        .bind(&entry.detail)
        .bind(entry.created_at.timestamp_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn audit_entries(
        &self,
        tenant_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, tenant_id, session_id, detail, created_at FROM audit_log \
             WHERE ?1 IS NULL OR tenant_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(tenant_id)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                let session_id: Option<String> = row.try_get("session_id")?;
                Ok(AuditEntry {
                    kind: AuditKind::parse(row.try_get("kind")?)?,
                    tenant_id: row.try_get("tenant_id")?,
                    session_id: session_id.as_deref().map(parse_session_id).transpose()?,
                    detail: row.try_get("detail")?,
                    created_at: millis(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
    let direction: &str = row.try_get("direction")?;
    let kind: &str = row.try_get("kind")?;
    let status: &str = row.try_get("status")?;
    let payload: &str = row.try_get("payload")?;
    let delivered_at: Option<i64> = row.try_get("delivered_at")?;
    let read_at: Option<i64> = row.try_get("read_at")?;

    Ok(Message {
        tenant_id: row.try_get("tenant_id")?,
        session_id: parse_session_id(row.try_get("session_id")?)?,
        protocol_message_id: row.try_get("protocol_message_id")?,
        direction: Direction::parse(direction).ok_or_else(|| invalid("direction", direction))?,
        peer: row.try_get("peer")?,
        kind: MessageKind::parse(kind).ok_or_else(|| invalid("kind", kind))?,
        payload: serde_json::from_str::<MessagePayload>(payload)?,
        status: MessageStatus::parse(status).ok_or_else(|| invalid("status", status))?,
        sent_at: millis(row.try_get("sent_at")?)?,
        delivered_at: delivered_at.map(millis).transpose()?,
        read_at: read_at.map(millis).transpose()?,
        acting_user: row.try_get("acting_user")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRow, StoreError> {
    let status: &str = row.try_get("status")?;
    let attempts: i64 = row.try_get("reconnect_attempts")?;
    Ok(SessionRow {
        id: parse_session_id(row.try_get("id")?)?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        status: SessionStatus::parse(status).ok_or_else(|| invalid("session status", status))?,
        phone: row.try_get("phone")?,
        reason: row.try_get("reason")?,
        reconnect_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        created_at: millis(row.try_get("created_at")?)?,
        last_activity_at: millis(row.try_get("last_activity_at")?)?,
    })
}

fn contact_from_row(row: &SqliteRow) -> Result<Contact, StoreError> {
    Ok(Contact {
        tenant_id: row.try_get("tenant_id")?,
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        is_group: row.try_get("is_group")?,
        first_seen_at: millis(row.try_get("first_seen_at")?)?,
        last_seen_at: millis(row.try_get("last_seen_at")?)?,
    })
}

fn parse_session_id(value: &str) -> Result<SessionId, StoreError> {
    SessionId::parse(value).map_err(|_| invalid("session id", value))
}

fn millis(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(value).ok_or_else(|| invalid("timestamp", &value.to_string()))
}

fn invalid(field: &'static str, value: &str) -> StoreError {
    StoreError::InvalidValue {
        field,
        value: value.to_owned(),
    }
}
