//! Tests for session creation, pairing, replacement, disconnect and shutdown.

use switchboard::auth::{AuthBlob, AuthStore};
use std::time::Duration;

use switchboard::session::{SessionError, SessionId, SessionStatus};
use switchboard::store::{AuditKind, MessageStore};
use switchboard::transport::TransportEvent;

use crate::support::{eventually, fast_config, harness, harness_with, wait_for_status};

#[tokio::test]
async fn qr_challenge_is_exposed_while_pairing() {
    let h = harness().await;
    let id = h.create("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");

    h.transport.push(TransportEvent::Qr("2@pairing-code".to_owned())).await;
    wait_for_status(&mut rx, SessionStatus::QrReady).await;

    let qr = h
        .switchboard
        .qr_artifact(&id)
        .expect("live")
        .expect("qr should be pending");
    assert_eq!(qr.code, "2@pairing-code");

    let svg = h.switchboard.qr_svg(&id).expect("live").expect("svg");
    assert!(svg.contains("<svg"));
}

#[tokio::test]
async fn refreshed_qr_replaces_previous_challenge() {
    let h = harness().await;
    let id = h.create("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");

    h.transport.push(TransportEvent::Qr("first".to_owned())).await;
    wait_for_status(&mut rx, SessionStatus::QrReady).await;
    h.transport.push(TransportEvent::Qr("second".to_owned())).await;

    let state = tokio::time::timeout(
        crate::support::WAIT,
        rx.wait_for(|s| s.qr.as_ref().is_some_and(|qr| qr.code == "second")),
    )
    .await
    .expect("refreshed qr")
    .expect("state open")
    .clone();
    assert_eq!(state.status, SessionStatus::QrReady);
}

#[tokio::test]
async fn connect_clears_qr_and_records_phone() {
    let h = harness().await;
    let id = h.create("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");

    h.transport.push(TransportEvent::Qr("code".to_owned())).await;
    wait_for_status(&mut rx, SessionStatus::QrReady).await;
    h.transport
        .push(TransportEvent::Connected {
            phone: Some("15550001111".to_owned()),
        })
        .await;
    let state = wait_for_status(&mut rx, SessionStatus::Connected).await;

    assert!(state.qr.is_none());
    assert_eq!(state.phone.as_deref(), Some("15550001111"));
    assert_eq!(state.reconnect_attempts, 0);
    assert!(h.switchboard.qr_artifact(&id).expect("live").is_none());

    let store = std::sync::Arc::clone(&h.store);
    let row_id = id.clone();
    eventually(|| {
        let store = std::sync::Arc::clone(&store);
        let row_id = row_id.clone();
        async move {
            store
                .session_row(&row_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|row| row.status == SessionStatus::Connected)
        }
    })
    .await;
}

#[tokio::test]
async fn second_create_while_connected_is_rejected() {
    let h = harness().await;
    let id = h.connected("t1", "default").await;

    let err = h
        .switchboard
        .create_session("t1", "default")
        .await
        .expect_err("duplicate should fail");
    assert!(matches!(err, SessionError::AlreadyConnected(ref dup) if *dup == id));
    assert!(!err.is_transient());
    assert_eq!(
        h.switchboard.session(&id).expect("live").status,
        SessionStatus::Connected
    );
}

#[tokio::test]
async fn create_while_pairing_replaces_the_old_session() {
    let h = harness().await;
    let id = h.create("t1", "default").await;
    let mut old = h.switchboard.watch(&id).expect("live");

    h.create("t1", "default").await;

    let old_state = wait_for_status(&mut old, SessionStatus::Terminated).await;
    assert_eq!(old_state.reason.as_deref(), Some("replaced by a new session"));
    assert_eq!(h.transport.opens(), 2);
    assert!(h.transport.closes() >= 1);

    let current = h.switchboard.session(&id).expect("replacement is live");
    assert!(current.status.is_pairing());
}

#[tokio::test]
async fn replacement_waits_for_a_stuck_session_instead_of_racing_it() {
    let mut config = fast_config();
    config.shutdown_timeout = Duration::from_millis(100);
    let h = harness_with(config).await;
    let id = h.create("t1", "default").await;
    let mut old = h.switchboard.watch(&id).expect("live");

    let store = &h.store;
    let switchboard = &h.switchboard;
    let watched = &id;

    // Park the old supervisor inside a status write.
    h.store.hold("t1");
    h.transport.push(TransportEvent::Qr("2@stuck".to_owned())).await;
    eventually(|| async move { store.waiting() >= 1 }).await;

    let err = h
        .switchboard
        .create_session("t1", "default")
        .await
        .expect_err("old supervisor never acknowledged the stop");
    assert!(matches!(err, SessionError::Timeout(_)), "{err:?}");
    assert!(err.is_transient());
    assert_eq!(h.transport.opens(), 1);
    assert!(h.switchboard.is_live(&id));
    assert_eq!(h.transport.closes(), 0);

    h.store.release("t1");
    let old_state = wait_for_status(&mut old, SessionStatus::Terminated).await;
    assert_eq!(old_state.reason.as_deref(), Some("replaced by a new session"));
    eventually(|| async move { !switchboard.is_live(watched) }).await;

    h.create("t1", "default").await;
    assert_eq!(h.transport.opens(), 2);
    let current = h.switchboard.session(&id).expect("replacement is live");
    assert!(current.status.is_pairing());
}

#[tokio::test]
async fn invalid_identifiers_are_rejected() {
    let h = harness().await;
    let err = h
        .switchboard
        .create_session("bad tenant", "default")
        .await
        .expect_err("invalid tenant");
    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(h.transport.opens(), 0);
}

#[tokio::test]
async fn rotated_credentials_are_saved_and_reused_on_reconnect() {
    let h = harness().await;
    let id = h.connected("t1", "default").await;

    h.transport
        .push(TransportEvent::CredentialsUpdated(AuthBlob::new(
            b"creds-v1".to_vec(),
        )))
        .await;
    let auth = std::sync::Arc::clone(&h.auth);
    let cred_id = id.clone();
    eventually(|| {
        let auth = std::sync::Arc::clone(&auth);
        let cred_id = cred_id.clone();
        async move { auth.exists(&cred_id).await.unwrap_or(false) }
    })
    .await;

    h.transport
        .push(TransportEvent::Closed(
            switchboard::transport::CloseReason::ConnectionLost,
        ))
        .await;
    h.transport.wait_for_opens(2).await;

    let opened_with = h.transport.open_auth();
    assert!(opened_with[0].is_none());
    assert_eq!(
        opened_with[1].as_ref().map(AuthBlob::as_bytes),
        Some(b"creds-v1".as_slice())
    );
}

#[tokio::test]
async fn disconnect_logs_out_and_forgets_credentials() {
    let h = harness().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    h.auth
        .save(&id, AuthBlob::new(b"creds".to_vec()))
        .await
        .expect("save");
    h.connected("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");

    h.switchboard.disconnect(&id).await.expect("disconnect");

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(state.reason.as_deref(), Some("logged out"));
    assert_eq!(h.transport.logouts(), 1);
    assert!(!h.auth.exists(&id).await.expect("exists"));
    assert!(!h.switchboard.is_live(&id));
    assert_eq!(
        h.switchboard.status(&id).await.expect("persisted"),
        SessionStatus::Disconnected
    );

    let audit = h.switchboard.audit_log(Some("t1"), 10).await.expect("audit");
    assert!(audit.iter().any(|entry| entry.kind == AuditKind::Logout));
}

#[tokio::test]
async fn disconnect_unknown_session_is_not_found() {
    let h = harness().await;
    let id = SessionId::parse("t1:ghost").expect("valid id");
    let err = h.switchboard.disconnect(&id).await.expect_err("unknown");
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn shutdown_closes_sessions_but_keeps_credentials() {
    let h = harness().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    h.auth
        .save(&id, AuthBlob::new(b"creds".to_vec()))
        .await
        .expect("save");
    h.switchboard.start();
    h.connected("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");

    h.switchboard.shutdown().await;

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(state.reason.as_deref(), Some("shutdown"));
    assert_eq!(h.transport.logouts(), 0);
    assert!(h.transport.closes() >= 1);
    assert!(h.auth.exists(&id).await.expect("exists"));

    let audit = h.switchboard.audit_log(Some("t1"), 10).await.expect("audit");
    assert!(audit.is_empty(), "shutdown is not audited");
}

#[tokio::test]
async fn persisted_sessions_with_credentials_resume() {
    let h = harness().await;
    let id = SessionId::parse("t1:default").expect("valid id");
    h.auth
        .save(&id, AuthBlob::new(b"creds".to_vec()))
        .await
        .expect("save");
    h.connected("t1", "default").await;
    h.connected("t1", "other").await;
    h.switchboard.shutdown().await;
    h.auth
        .delete(&SessionId::parse("t1:other").expect("valid id"))
        .await
        .expect("delete");

    let resumable = h.switchboard.resumable_sessions().await.expect("rows");
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].id, id);

    let before = h.transport.opens();
    let resumed = h.switchboard.resume_all().await.expect("resume");
    assert_eq!(resumed, vec![id.clone()]);
    h.transport.wait_for_opens(before + 1).await;
    assert!(h
        .transport
        .open_auth()
        .last()
        .is_some_and(|auth| auth.is_some()));
    assert!(h.switchboard.is_live(&id));
}

#[tokio::test]
async fn list_sessions_is_scoped_to_tenant() {
    let h = harness().await;
    h.create("t1", "b").await;
    h.create("t1", "a").await;
    h.create("t2", "a").await;

    let names: Vec<String> = h
        .switchboard
        .list_sessions("t1")
        .into_iter()
        .map(|state| state.key.name)
        .collect();
    assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(h.switchboard.list_sessions("t3").len(), 0);
}
