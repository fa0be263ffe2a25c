//! Tests for `src/broadcast.rs`.

use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;

use switchboard::broadcast::{
    CoreEvent, EventBroadcaster, EventScope, QrEvent, StatusEvent, Subscription,
};
use switchboard::session::{SessionId, SessionStatus};
use switchboard::transport::TransportEvent;

use crate::support::{harness, inbound_text, WAIT};

fn status(id: &SessionId, status: SessionStatus) -> CoreEvent {
    CoreEvent::Status(StatusEvent {
        session_id: id.clone(),
        status,
        reason: None,
        phone: None,
        reconnect_attempts: 0,
        at: Utc::now(),
    })
}

async fn next(sub: &mut Subscription) -> CoreEvent {
    let published = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("broadcaster closed");
    published.event.clone()
}

#[tokio::test]
async fn subscribers_only_see_their_scope() {
    let events = EventBroadcaster::new(16);
    let a = SessionId::parse("t1:a").expect("valid id");
    let b = SessionId::parse("t1:b").expect("valid id");
    let other = SessionId::parse("t2:a").expect("valid id");

    let mut tenant = events.subscribe(EventScope::tenant("t1"));
    let mut session = events.subscribe(EventScope::session(&b));

    events.publish(EventScope::session(&a), status(&a, SessionStatus::Connecting));
    events.publish(EventScope::session(&other), status(&other, SessionStatus::Connecting));
    events.publish(EventScope::session(&b), status(&b, SessionStatus::Connected));

    let CoreEvent::Status(first) = next(&mut tenant).await else {
        panic!("expected status event");
    };
    assert_eq!(first.session_id, a);
    let CoreEvent::Status(second) = next(&mut tenant).await else {
        panic!("expected status event");
    };
    assert_eq!(second.session_id, b);

    let CoreEvent::Status(only) = next(&mut session).await else {
        panic!("expected status event");
    };
    assert_eq!(only.session_id, b);
    assert_eq!(only.status, SessionStatus::Connected);
}

#[tokio::test]
async fn publishing_without_subscribers_is_not_an_error() {
    let events = EventBroadcaster::new(4);
    let id = SessionId::parse("t1:a").expect("valid id");
    assert_eq!(
        events.publish(EventScope::session(&id), status(&id, SessionStatus::Connecting)),
        0
    );
    let _sub = events.subscribe(EventScope::tenant("t1"));
    assert_eq!(events.receiver_count(), 1);
    assert_eq!(
        events.publish(EventScope::session(&id), status(&id, SessionStatus::Connecting)),
        1
    );
}

#[tokio::test]
async fn lagging_subscriber_skips_ahead() {
    let events = EventBroadcaster::new(2);
    let id = SessionId::parse("t1:a").expect("valid id");
    let mut sub = events.subscribe(EventScope::tenant("t1"));

    for n in 0..5u32 {
        events.publish(
            EventScope::session(&id),
            CoreEvent::Status(StatusEvent {
                session_id: id.clone(),
                status: SessionStatus::Reconnecting,
                reason: None,
                phone: None,
                reconnect_attempts: n,
                at: Utc::now(),
            }),
        );
    }

    let CoreEvent::Status(event) = next(&mut sub).await else {
        panic!("expected status event");
    };
    assert_eq!(event.reconnect_attempts, 3);
}

#[tokio::test]
async fn stream_filters_and_ends_with_broadcaster() {
    let events = EventBroadcaster::new(8);
    let a = SessionId::parse("t1:a").expect("valid id");
    let other = SessionId::parse("t2:a").expect("valid id");
    let stream = events.subscribe(EventScope::tenant("t1")).into_stream();

    events.publish(EventScope::session(&other), status(&other, SessionStatus::Connecting));
    events.publish(
        EventScope::session(&a),
        CoreEvent::Qr(QrEvent {
            session_id: a.clone(),
            code: "2@abc".to_owned(),
            issued_at: Utc::now(),
        }),
    );
    drop(events);

    let collected: Vec<_> = tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("stream should end");
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].event.kind(), "qr");
}

#[tokio::test]
async fn session_lifecycle_is_published_in_order() {
    let h = harness().await;
    let mut tenant = h.switchboard.subscribe(EventScope::tenant("t1"));
    let mut elsewhere = h.switchboard.subscribe(EventScope::tenant("t2"));

    let id = h.create("t1", "default").await;
    h.transport.push(TransportEvent::Qr("2@pair".to_owned())).await;
    h.transport
        .push(TransportEvent::Connected {
            phone: Some("15550001111".to_owned()),
        })
        .await;
    h.transport
        .push(TransportEvent::Message(inbound_text(
            "m1",
            "201001234567@s.whatsapp.net",
            "hi",
        )))
        .await;

    let mut kinds = Vec::new();
    let mut connected_phone = None;
    loop {
        let event = next(&mut tenant).await;
        kinds.push(event.kind());
        match event {
            CoreEvent::Status(s) if s.status == SessionStatus::Connected => {
                assert_eq!(s.session_id, id);
                connected_phone = s.phone;
            }
            CoreEvent::NewMessage(message) => {
                assert_eq!(message.protocol_message_id, "m1");
                break;
            }
            _ => {}
        }
    }

    assert_eq!(connected_phone.as_deref(), Some("15550001111"));
    let qr_at = kinds.iter().position(|k| *k == "qr").expect("qr published");
    let message_at = kinds.len().saturating_sub(1);
    assert!(qr_at < message_at);

    let leaked = tokio::time::timeout(Duration::from_millis(50), elsewhere.recv()).await;
    assert!(leaked.is_err(), "other tenant must not see t1 events");
}
