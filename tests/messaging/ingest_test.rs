//! Tests for the ingestion pipeline: normalization, idempotence, receipts, contacts.

use std::sync::Arc;

use serde_json::json;

use switchboard::broadcast::{CoreEvent, EventBroadcaster, EventScope};
use switchboard::ingest::{IngestError, IngestionPipeline};
use switchboard::message::{Direction, MessageKind, MessagePayload, MessageStatus, Receipt};
use switchboard::retry::{RetryPolicy, RetryQueue};
use switchboard::session::SessionId;
use switchboard::store::{MessageStore, SqliteStore};
use switchboard::transport::{RawMessage, TransportEvent};

use crate::support::{eventually, fresh_store, harness, inbound_text, WAIT};

const PEER: &str = "201001234567@s.whatsapp.net";

struct Fixture {
    pipeline: IngestionPipeline,
    store: Arc<SqliteStore>,
    events: EventBroadcaster,
    session: SessionId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(fresh_store().await);
    let events = EventBroadcaster::new(64);
    let retry = Arc::new(RetryQueue::new(RetryPolicy::default()));
    let pipeline = IngestionPipeline::new(
        Arc::clone(&store) as Arc<dyn MessageStore>,
        events.clone(),
        retry,
    );
    Fixture {
        pipeline,
        store,
        events,
        session: SessionId::parse("t1:default").expect("valid id"),
    }
}

#[tokio::test]
async fn inbound_text_is_stored_published_and_contact_resolved() {
    let h = harness().await;
    let id = h.connected("t1", "default").await;
    let mut events = h.switchboard.subscribe(EventScope::session(&id));

    h.transport
        .push(TransportEvent::Message(inbound_text("m1", PEER, "hi")))
        .await;

    let message = loop {
        let published = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event")
            .expect("open");
        if let CoreEvent::NewMessage(message) = &published.event {
            break message.clone();
        }
    };
    assert_eq!(message.protocol_message_id, "m1");
    assert_eq!(message.payload.text(), Some("hi"));
    assert_eq!(message.direction, Direction::Inbound);
    assert_eq!(message.status, MessageStatus::Delivered);
    assert_eq!(message.peer, PEER);

    let stored = h
        .store
        .message("t1", "m1")
        .await
        .expect("query")
        .expect("stored");
    assert_eq!(stored.payload.text(), Some("hi"));
    assert_eq!(h.store.message_count("t1").await.expect("count"), 1);

    let contact = h
        .store
        .contact("t1", PEER)
        .await
        .expect("query")
        .expect("contact");
    assert_eq!(contact.display_name.as_deref(), Some("Alice"));
    assert!(!contact.is_group);
}

#[tokio::test]
async fn redelivered_message_is_stored_once() {
    let f = fixture().await;
    let raw = inbound_text("m1", PEER, "hi");

    f.pipeline.ingest(&f.session, raw.clone()).await.expect("first");
    f.pipeline.ingest(&f.session, raw).await.expect("second");

    assert_eq!(f.store.message_count("t1").await.expect("count"), 1);
}

#[tokio::test]
async fn same_protocol_id_in_other_tenant_is_distinct() {
    let f = fixture().await;
    let other = SessionId::parse("t2:default").expect("valid id");

    f.pipeline
        .ingest(&f.session, inbound_text("m1", PEER, "hi"))
        .await
        .expect("t1");
    f.pipeline
        .ingest(&other, inbound_text("m1", PEER, "hi"))
        .await
        .expect("t2");

    assert_eq!(f.store.message_count("t1").await.expect("count"), 1);
    assert_eq!(f.store.message_count("t2").await.expect("count"), 1);
}

#[tokio::test]
async fn receipts_only_move_status_forward() {
    let f = fixture().await;
    let mut raw = inbound_text("out-1", PEER, "sent from phone");
    raw.from_me = true;
    let stored = f.pipeline.ingest(&f.session, raw).await.expect("ingest");
    assert_eq!(stored.direction, Direction::Outbound);
    assert_eq!(stored.status, MessageStatus::Sent);

    let read = Receipt {
        message_id: "out-1".to_owned(),
        status: MessageStatus::Read,
        timestamp: Some(1_700_000_100),
    };
    let updated = f
        .pipeline
        .apply_receipt(&f.session, read)
        .await
        .expect("receipt")
        .expect("known message");
    assert_eq!(updated.status, MessageStatus::Read);
    assert!(updated.read_at.is_some());

    let late = Receipt {
        message_id: "out-1".to_owned(),
        status: MessageStatus::Delivered,
        timestamp: Some(1_700_000_050),
    };
    let after = f
        .pipeline
        .apply_receipt(&f.session, late)
        .await
        .expect("receipt")
        .expect("known message");
    assert_eq!(after.status, MessageStatus::Read);
}

#[tokio::test]
async fn receipt_for_unknown_message_is_ignored() {
    let f = fixture().await;
    let receipt = Receipt {
        message_id: "nope".to_owned(),
        status: MessageStatus::Read,
        timestamp: None,
    };
    let result = f
        .pipeline
        .apply_receipt(&f.session, receipt)
        .await
        .expect("no error");
    assert!(result.is_none());
    assert!(f.pipeline.retry_queue().is_empty());
}

#[tokio::test]
async fn device_suffix_is_stripped_from_sender() {
    let f = fixture().await;
    let raw = inbound_text("m1", "201001234567:17@s.whatsapp.net", "hi");
    let stored = f.pipeline.ingest(&f.session, raw).await.expect("ingest");
    assert_eq!(stored.peer, PEER);
}

#[tokio::test]
async fn group_messages_create_group_contacts_without_names() {
    let f = fixture().await;
    let group = "120363025246125486@g.us";
    f.pipeline
        .ingest(&f.session, inbound_text("g1", group, "hello group"))
        .await
        .expect("ingest");

    let contact = f
        .store
        .contact("t1", group)
        .await
        .expect("query")
        .expect("contact");
    assert!(contact.is_group);
    assert!(contact.display_name.is_none());
}

#[tokio::test]
async fn repeat_sightings_advance_last_seen() {
    let f = fixture().await;
    let group = "120363025246125486@g.us";
    f.pipeline
        .ingest(&f.session, inbound_text("g1", group, "first"))
        .await
        .expect("ingest");
    let first = f
        .store
        .contact("t1", group)
        .await
        .expect("query")
        .expect("contact");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    f.pipeline
        .ingest(&f.session, inbound_text("g2", group, "second"))
        .await
        .expect("ingest");
    let second = f
        .store
        .contact("t1", group)
        .await
        .expect("query")
        .expect("contact");

    assert_eq!(second.first_seen_at, first.first_seen_at);
    assert!(
        second.last_seen_at > first.last_seen_at,
        "last_seen_at should move: {} -> {}",
        first.last_seen_at,
        second.last_seen_at
    );
}

#[tokio::test]
async fn wrapped_and_media_content_is_classified() {
    let f = fixture().await;

    let mut ephemeral = inbound_text("e1", PEER, "");
    ephemeral.content = json!({
        "ephemeralMessage": { "message": { "extendedTextMessage": { "text": "vanishing" } } }
    });
    let stored = f.pipeline.ingest(&f.session, ephemeral).await.expect("ephemeral");
    assert_eq!(stored.kind, MessageKind::Text);
    assert_eq!(stored.payload.text(), Some("vanishing"));

    let mut image = inbound_text("i1", PEER, "");
    image.content = json!({
        "imageMessage": { "caption": "look", "mimetype": "image/jpeg", "fileLength": "2048" }
    });
    let stored = f.pipeline.ingest(&f.session, image).await.expect("image");
    assert_eq!(stored.kind, MessageKind::Image);
    match &stored.payload {
        MessagePayload::Media {
            caption,
            mime_type,
            size_bytes,
            ..
        } => {
            assert_eq!(caption.as_deref(), Some("look"));
            assert_eq!(mime_type.as_deref(), Some("image/jpeg"));
            assert_eq!(*size_bytes, Some(2048));
        }
        other => panic!("expected media payload, got {other:?}"),
    }
}

#[tokio::test]
async fn unmodelled_content_is_kept_as_system_message() {
    let f = fixture().await;
    let mut raw = inbound_text("loc1", PEER, "");
    raw.content = json!({ "locationMessage": { "degreesLatitude": 30.0 } });

    let stored = f.pipeline.ingest(&f.session, raw).await.expect("ingest");
    assert_eq!(stored.kind, MessageKind::System);
    match &stored.payload {
        MessagePayload::System { shape, raw } => {
            assert_eq!(shape.as_deref(), Some("locationMessage"));
            assert!(raw.get("locationMessage").is_some());
        }
        other => panic!("expected system payload, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_message_is_dropped_not_retried() {
    let f = fixture().await;
    let raw = RawMessage {
        id: String::new(),
        remote: PEER.to_owned(),
        from_me: false,
        push_name: None,
        timestamp: None,
        content: json!({ "conversation": "orphan" }),
    };

    let err = f.pipeline.ingest(&f.session, raw).await.expect_err("malformed");
    assert!(matches!(err, IngestError::Malformed(_)));
    assert!(f.pipeline.retry_queue().is_empty());
    assert_eq!(f.store.message_count("t1").await.expect("count"), 0);
}

#[tokio::test]
async fn events_do_not_leak_across_tenants() {
    let f = fixture().await;
    let mut t2 = f.events.subscribe(EventScope::tenant("t2"));
    let mut t1 = f.events.subscribe(EventScope::tenant("t1"));

    f.pipeline
        .ingest(&f.session, inbound_text("m1", PEER, "hi"))
        .await
        .expect("ingest");

    let seen = tokio::time::timeout(WAIT, t1.recv())
        .await
        .expect("t1 event")
        .expect("open");
    assert_eq!(seen.event.kind(), "newMessage");
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(50), t2.recv())
            .await
            .is_err(),
        "t2 must not see t1 traffic"
    );
}

#[tokio::test]
async fn message_activity_touches_session() {
    let h = harness().await;
    let id = h.connected("t1", "default").await;
    let before = h.switchboard.session(&id).expect("live").last_activity_at;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    h.transport
        .push(TransportEvent::Message(inbound_text("m2", PEER, "ping")))
        .await;

    let store = Arc::clone(&h.store);
    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.message("t1", "m2").await.ok().flatten().is_some() }
    })
    .await;
    assert!(h.switchboard.session(&id).expect("live").last_activity_at > before);
}
