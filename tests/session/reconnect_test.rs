//! Tests for bounded reconnection and close classification.

use std::time::Duration;

use switchboard::auth::{AuthBlob, AuthStore};
use switchboard::broadcast::{CoreEvent, EventScope};
use switchboard::session::{SessionId, SessionStatus};
use switchboard::store::AuditKind;
use switchboard::transport::{CloseReason, TransportError, TransportEvent};

use crate::support::{fast_config, harness, harness_with, wait_for_status};

fn closed(reason: CloseReason) -> Vec<TransportEvent> {
    vec![TransportEvent::Closed(reason)]
}

fn connected() -> Vec<TransportEvent> {
    vec![TransportEvent::Connected {
        phone: Some("15550001111".to_owned()),
    }]
}

#[tokio::test]
async fn transient_closes_within_budget_end_connected() {
    let h = harness().await;
    // max_attempts is 3: three transient closes, then success.
    h.transport.script(closed(CloseReason::ConnectionLost));
    h.transport.script(closed(CloseReason::TimedOut));
    h.transport.script(closed(CloseReason::ServiceUnavailable));
    h.transport.script(connected());

    let mut events = h.switchboard.subscribe(EventScope::tenant("t1"));
    let id = h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");

    let state = wait_for_status(&mut rx, SessionStatus::Connected).await;
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(h.transport.opens(), 4);

    let mut attempts = Vec::new();
    while let Ok(Some(published)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if let CoreEvent::Status(status) = &published.event {
            if status.status == SessionStatus::Reconnecting {
                attempts.push(status.reconnect_attempts);
            }
            if status.status == SessionStatus::Connected {
                break;
            }
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn one_close_past_budget_terminates() {
    let h = harness().await;
    for _ in 0..4 {
        h.transport.script(closed(CloseReason::ConnectionLost));
    }

    let id = h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(h.transport.opens(), 4);
    assert_eq!(state.reconnect_attempts, 3);
    assert!(state
        .reason
        .as_deref()
        .is_some_and(|reason| reason.contains("exhausted")));
    assert!(!h.switchboard.is_live(&id));

    let audit = h.switchboard.audit_log(Some("t1"), 10).await.expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::SessionTerminated);
}

#[tokio::test]
async fn attempt_counter_resets_after_connecting() {
    let h = harness().await;
    h.transport.script(closed(CloseReason::ConnectionLost));
    h.transport.script(closed(CloseReason::ConnectionLost));
    h.transport.script(vec![
        TransportEvent::Connected { phone: None },
        TransportEvent::Closed(CloseReason::RestartRequired),
    ]);

    let mut events = h.switchboard.subscribe(EventScope::tenant("t1"));
    h.switchboard.create_session("t1", "default").await.expect("create");
    h.transport.wait_for_opens(4).await;

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        let published = tokio::time::timeout(crate::support::WAIT, events.recv())
            .await
            .expect("status event")
            .expect("broadcaster open");
        if let CoreEvent::Status(status) = &published.event {
            if status.status == SessionStatus::Reconnecting {
                attempts.push(status.reconnect_attempts);
            }
        }
    }
    assert_eq!(attempts, vec![1, 2, 1]);
}

#[tokio::test]
async fn logged_out_close_terminates_and_forgets_credentials() {
    let h = harness().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    h.auth
        .save(&id, AuthBlob::new(b"creds".to_vec()))
        .await
        .expect("save");
    h.transport.script(closed(CloseReason::LoggedOut));

    h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(state.reason.as_deref(), Some("logged out"));
    assert_eq!(h.transport.opens(), 1);
    assert!(!h.auth.exists(&id).await.expect("exists"));
}

#[tokio::test]
async fn replaced_close_terminates_but_keeps_credentials() {
    let h = harness().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    h.auth
        .save(&id, AuthBlob::new(b"creds".to_vec()))
        .await
        .expect("save");
    h.transport.script(closed(CloseReason::Replaced));

    h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");

    wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(h.transport.opens(), 1);
    assert!(h.auth.exists(&id).await.expect("exists"));
}

#[tokio::test]
async fn transient_open_failure_is_retried() {
    let h = harness().await;
    h.transport
        .fail_next_open(TransportError::Unavailable("bridge starting".to_owned()));

    let id = h.switchboard.create_session("t1", "default").await.expect("create");
    h.transport.wait_for_opens(2).await;

    let state = h.switchboard.session(&id).expect("live");
    assert_eq!(state.status, SessionStatus::Connecting);
    assert_eq!(state.reconnect_attempts, 1);
}

#[tokio::test]
async fn rejected_open_terminates() {
    let h = harness().await;
    h.transport
        .fail_next_open(TransportError::Rejected("unknown session".to_owned()));

    let id = h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert!(state
        .reason
        .as_deref()
        .is_some_and(|reason| reason.contains("open failed")));
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test]
async fn disconnect_cancels_pending_backoff() {
    let mut config = fast_config();
    config.reconnect.base_delay = Duration::from_secs(30);
    config.reconnect.max_delay = Duration::from_secs(30);
    let h = harness_with(config).await;
    h.transport.script(closed(CloseReason::ConnectionLost));

    let id = h.switchboard.create_session("t1", "default").await.expect("create");
    let mut rx = h.switchboard.watch(&id).expect("live");
    wait_for_status(&mut rx, SessionStatus::Reconnecting).await;

    let started = std::time::Instant::now();
    h.switchboard.disconnect(&id).await.expect("disconnect");
    assert!(started.elapsed() < Duration::from_secs(5));

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(state.reason.as_deref(), Some("logged out"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.opens(), 1, "no reconnect after disconnect");
}
