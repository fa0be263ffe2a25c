//! Tests that one session's stalled writes leave other sessions running.

use switchboard::broadcast::{CoreEvent, EventScope};
use switchboard::session::SessionStatus;
use switchboard::store::MessageStore;
use switchboard::transport::{CloseReason, TransportEvent};

use crate::support::{eventually, harness, inbound_text, WAIT};

const PEER: &str = "201001234567@s.whatsapp.net";

#[tokio::test]
async fn held_store_writes_for_one_tenant_do_not_stall_another() {
    let h = harness().await;
    let stuck = h.connected("t1", "default").await;
    let flowing = h.connected("t2", "default").await;
    let mut flowing_events = h.switchboard.subscribe(EventScope::session(&flowing));
    let store = &h.store;

    h.store.hold("t1");
    h.transport
        .push_to(&stuck, TransportEvent::Message(inbound_text("a1", PEER, "waiting")))
        .await;
    eventually(|| async move { store.waiting() >= 1 }).await;

    h.transport
        .push_to(&flowing, TransportEvent::Message(inbound_text("b1", PEER, "moving")))
        .await;
    eventually(|| async move {
        store
            .message("t2", "b1")
            .await
            .expect("lookup")
            .is_some()
    })
    .await;

    h.transport
        .push_to(&flowing, TransportEvent::Closed(CloseReason::ConnectionLost))
        .await;
    let reconnecting = tokio::time::timeout(WAIT, async {
        loop {
            let published = flowing_events.recv().await.expect("open");
            if let CoreEvent::Status(status) = &published.event {
                if status.status == SessionStatus::Reconnecting {
                    break status.clone();
                }
            }
        }
    })
    .await
    .expect("flowing session changed status while the other was held");
    assert_eq!(reconnecting.session_id, flowing);

    assert!(h
        .store
        .message("t1", "a1")
        .await
        .expect("lookup")
        .is_none());
    assert_eq!(h.switchboard.status(&stuck).await.expect("status"), SessionStatus::Connected);

    h.store.release("t1");
    eventually(|| async move {
        store
            .message("t1", "a1")
            .await
            .expect("lookup")
            .is_some()
    })
    .await;
}
