//! Tests for `src/reaper.rs` driven through the orchestrator.

use std::time::Duration;

use switchboard::reaper::ReapReport;
use switchboard::session::SessionStatus;
use switchboard::store::AuditKind;
use switchboard::transport::TransportEvent;

use crate::support::{eventually, fast_config, harness, harness_with, wait_for_status};

#[tokio::test]
async fn stalled_pairing_is_retired() {
    let mut config = fast_config();
    config.reaper.connect_timeout = Duration::from_millis(20);
    let h = harness_with(config).await;

    let id = h.create("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");
    h.transport.push(TransportEvent::Qr("2@stall".to_owned())).await;
    wait_for_status(&mut rx, SessionStatus::QrReady).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    let report = h.switchboard.reap_now();
    assert_eq!(report.stalled, 1);

    let state = wait_for_status(&mut rx, SessionStatus::Terminated).await;
    assert_eq!(state.reason.as_deref(), Some("pairing timed out"));
    assert!(!h.switchboard.is_live(&id));

    let switchboard = &h.switchboard;
    eventually(|| async move {
        switchboard
            .audit_log(Some("t1"), 10)
            .await
            .expect("audit")
            .iter()
            .any(|entry| entry.kind == AuditKind::SessionTerminated)
    })
    .await;
}

#[tokio::test]
async fn connected_sessions_are_left_alone() {
    let mut config = fast_config();
    config.reaper.connect_timeout = Duration::from_millis(20);
    let h = harness_with(config).await;

    let id = h.connected("t1", "default").await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(h.switchboard.reap_now(), ReapReport::default());
    assert!(h.switchboard.is_live(&id));
    assert_eq!(
        h.switchboard.status(&id).await.expect("status"),
        SessionStatus::Connected
    );
}

#[tokio::test]
async fn expired_qr_is_cleared_but_session_kept() {
    let mut config = fast_config();
    config.reaper.qr_ttl = Duration::from_millis(20);
    let h = harness_with(config).await;

    let id = h.create("t1", "default").await;
    let mut rx = h.switchboard.watch(&id).expect("live");
    h.transport.push(TransportEvent::Qr("2@old".to_owned())).await;
    wait_for_status(&mut rx, SessionStatus::QrReady).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    // Already hidden from callers before the sweep runs.
    assert!(h.switchboard.qr_artifact(&id).expect("live").is_none());

    let report = h.switchboard.reap_now();
    assert_eq!(report.qr_cleared, 1);
    assert_eq!(report.stalled, 0);
    assert!(rx.borrow().qr.is_none());
    assert!(h.switchboard.is_live(&id));

    h.transport.push(TransportEvent::Qr("2@new".to_owned())).await;
    let switchboard = &h.switchboard;
    let watched = &id;
    eventually(|| async move {
        switchboard
            .qr_artifact(watched)
            .expect("live")
            .is_some_and(|qr| qr.code == "2@new")
    })
    .await;
}

#[tokio::test]
async fn sweep_with_no_sessions_is_empty() {
    let h = harness().await;
    assert_eq!(h.switchboard.reap_now(), ReapReport::default());
}
