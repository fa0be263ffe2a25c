//! Tests for `src/store/sqlite.rs`.

use chrono::{Duration, TimeZone, Utc};

use switchboard::contacts::Contact;
use switchboard::message::{Direction, Message, MessageKind, MessagePayload, MessageStatus};
use switchboard::session::{SessionId, SessionStatus};
use switchboard::store::{AuditEntry, AuditKind, MessageStore, SessionRow, SqliteStore};

use crate::support::fresh_store;

fn message(id: &str, status: MessageStatus, text: &str) -> Message {
    let session_id = SessionId::parse("t1:default").expect("valid id");
    Message {
        tenant_id: "t1".to_owned(),
        session_id,
        protocol_message_id: id.to_owned(),
        direction: Direction::Outbound,
        peer: "201001234567@s.whatsapp.net".to_owned(),
        kind: MessageKind::Text,
        payload: MessagePayload::Text {
            text: text.to_owned(),
        },
        status,
        sent_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time"),
        delivered_at: None,
        read_at: None,
        acting_user: None,
    }
}

fn session_row(name: &str, status: SessionStatus) -> SessionRow {
    let id = SessionId::parse(&format!("t1:{name}")).expect("valid id");
    SessionRow {
        id,
        tenant_id: "t1".to_owned(),
        name: name.to_owned(),
        status,
        phone: None,
        reason: None,
        reconnect_attempts: 0,
        created_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time"),
        last_activity_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time"),
    }
}

#[tokio::test]
async fn upsert_keeps_first_payload_and_advances_status() {
    let store = fresh_store().await;
    let first = store
        .upsert_message(&message("m1", MessageStatus::Sent, "original"))
        .await
        .expect("insert");
    assert_eq!(first.status, MessageStatus::Sent);

    let mut replay = message("m1", MessageStatus::Delivered, "replayed");
    let delivered_at = Utc.timestamp_opt(1_700_000_050, 0).single().expect("valid time");
    replay.delivered_at = Some(delivered_at);
    let merged = store.upsert_message(&replay).await.expect("merge");

    assert_eq!(merged.payload.text(), Some("original"));
    assert_eq!(merged.status, MessageStatus::Delivered);
    assert_eq!(merged.delivered_at, Some(delivered_at));

    let stale = store
        .upsert_message(&message("m1", MessageStatus::Pending, "stale"))
        .await
        .expect("merge");
    assert_eq!(stale.status, MessageStatus::Delivered);
    assert_eq!(store.message_count("t1").await.expect("count"), 1);
}

#[tokio::test]
async fn earliest_delivery_time_wins() {
    let store = fresh_store().await;
    let early = Utc.timestamp_opt(1_700_000_010, 0).single().expect("valid time");
    let late = early
        .checked_add_signed(Duration::seconds(30))
        .expect("in range");

    let mut first = message("m1", MessageStatus::Delivered, "x");
    first.delivered_at = Some(late);
    store.upsert_message(&first).await.expect("insert");

    let mut second = message("m1", MessageStatus::Delivered, "x");
    second.delivered_at = Some(early);
    let merged = store.upsert_message(&second).await.expect("merge");
    assert_eq!(merged.delivered_at, Some(early));
}

#[tokio::test]
async fn payload_round_trips_through_json_column() {
    let store = fresh_store().await;
    let mut system = message("s1", MessageStatus::Delivered, "");
    system.kind = MessageKind::System;
    system.payload = MessagePayload::System {
        shape: Some("pollCreationMessage".to_owned()),
        raw: serde_json::json!({ "pollCreationMessage": { "name": "lunch?" } }),
    };
    store.upsert_message(&system).await.expect("insert");

    let loaded = store
        .message("t1", "s1")
        .await
        .expect("query")
        .expect("stored");
    assert_eq!(loaded, system);
}

#[tokio::test]
async fn contact_upsert_keeps_name_and_extends_sightings() {
    let store = fresh_store().await;
    let first_seen = Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid time");
    let contact = Contact {
        tenant_id: "t1".to_owned(),
        address: "201001234567@s.whatsapp.net".to_owned(),
        display_name: Some("Alice".to_owned()),
        is_group: false,
        first_seen_at: first_seen,
        last_seen_at: first_seen,
    };
    store.upsert_contact(&contact).await.expect("insert");

    let later = first_seen
        .checked_add_signed(Duration::hours(1))
        .expect("in range");
    let sighting = Contact {
        display_name: None,
        first_seen_at: later,
        last_seen_at: later,
        ..contact.clone()
    };
    let stored = store.upsert_contact(&sighting).await.expect("update");

    assert_eq!(stored.display_name.as_deref(), Some("Alice"));
    assert_eq!(stored.first_seen_at, first_seen);
    assert_eq!(stored.last_seen_at, later);
}

#[tokio::test]
async fn session_rows_upsert_and_list_by_tenant() {
    let store = fresh_store().await;
    let mut row = session_row("b", SessionStatus::Connecting);
    store.record_session(&row).await.expect("insert");
    row.status = SessionStatus::Connected;
    row.phone = Some("15550001111".to_owned());
    store.record_session(&row).await.expect("update");

    row.status = SessionStatus::Terminated;
    row.phone = None;
    row.reason = Some("logged out".to_owned());
    store.record_session(&row).await.expect("terminate");

    store
        .record_session(&session_row("a", SessionStatus::Connecting))
        .await
        .expect("insert");
    let mut other = session_row("a", SessionStatus::Connecting);
    other.id = SessionId::parse("t2:a").expect("valid id");
    other.tenant_id = "t2".to_owned();
    store.record_session(&other).await.expect("insert");

    let loaded = store
        .session_row(&row.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(loaded.status, SessionStatus::Disconnected);
    assert_eq!(loaded.phone.as_deref(), Some("15550001111"));
    assert_eq!(loaded.reason.as_deref(), Some("logged out"));

    let names: Vec<String> = store
        .list_sessions(Some("t1"))
        .await
        .expect("list")
        .into_iter()
        .map(|row| row.name)
        .collect();
    assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(store.list_sessions(None).await.expect("list").len(), 3);
}

#[tokio::test]
async fn audit_entries_are_newest_first_and_limited() {
    let store = fresh_store().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    for (n, kind) in [AuditKind::SessionTerminated, AuditKind::Logout, AuditKind::DeadLetter]
        .into_iter()
        .enumerate()
    {
        store
            .append_audit(&AuditEntry {
                kind,
                tenant_id: "t1".to_owned(),
                session_id: Some(id.clone()),
                detail: format!("entry {n}"),
                created_at: Utc::now(),
            })
            .await
            .expect("append");
    }
    store
        .append_audit(&AuditEntry {
            kind: AuditKind::Logout,
            tenant_id: "t2".to_owned(),
            session_id: None,
            detail: "other tenant".to_owned(),
            created_at: Utc::now(),
        })
        .await
        .expect("append");

    let entries = store.audit_entries(Some("t1"), 2).await.expect("query");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, AuditKind::DeadLetter);
    assert_eq!(entries[1].kind, AuditKind::Logout);
    assert_eq!(entries[0].session_id.as_ref(), Some(&id));

    assert_eq!(store.audit_entries(None, 10).await.expect("query").len(), 4);
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("nested").join("switchboard.db");

    let store = SqliteStore::connect(&path).await.expect("connect");
    store
        .upsert_message(&message("m1", MessageStatus::Sent, "persisted"))
        .await
        .expect("insert");
    store.close().await;

    let reopened = SqliteStore::connect(&path).await.expect("reconnect");
    let loaded = reopened
        .message("t1", "m1")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(loaded.payload.text(), Some("persisted"));
}
