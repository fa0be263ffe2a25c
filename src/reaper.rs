//! Periodic sweep retiring stalled pairings and stale QR challenges.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::{SessionRegistry, StopKind};

/// Reaper timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// How often the reaper runs.
    pub interval: Duration,
    /// Longest a session may stay in `connecting`/`qr_ready`.
    pub connect_timeout: Duration,
    /// Lifetime of a QR challenge.
    pub qr_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(300),
            qr_ttl: Duration::from_secs(60),
        }
    }
}

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions asked to stop because pairing stalled.
    pub stalled: u32,
    /// QR challenges cleared.
    pub qr_cleared: u32,
}

/// Run one sweep over every live session.
pub fn reap_once(
    registry: &SessionRegistry,
    config: &ReaperConfig,
    now: DateTime<Utc>,
) -> ReapReport {
    let mut report = ReapReport::default();

    for handle in registry.handles() {
        let stalled = handle
            .state()
            .borrow()
            .pairing_stalled(config.connect_timeout, now);
        if stalled {
            if handle.request_stop(StopKind::IdleTimeout) {
                report.stalled = report.stalled.saturating_add(1);
                info!(session_id = %handle.id(), "pairing stalled, retiring session");
            } else {
                warn!(session_id = %handle.id(), "could not queue stop for stalled session");
            }
            continue;
        }

        // Checked and cleared under the channel lock so a QR refreshed by
        // the supervisor in between is never dropped.
        let cleared = handle.state().send_if_modified(|state| match &state.qr {
            Some(qr) if qr.is_expired(config.qr_ttl, now) => {
                state.qr = None;
                true
            }
            _ => false,
        });
        if cleared {
            report.qr_cleared = report.qr_cleared.saturating_add(1);
            debug!(session_id = %handle.id(), "expired QR challenge cleared");
        }
    }

    report
}

/// Run the reaper until shutdown is signalled.
pub async fn run_reaper(
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval_secs = config.interval.as_secs();
    info!(interval_secs, "idle reaper started");

    let mut interval = tokio::time::interval(config.interval.max(Duration::from_millis(100)));
    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = reap_once(&registry, &config, Utc::now());
                if report != ReapReport::default() {
                    debug!(?report, "reaper sweep finished");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("idle reaper shutting down");
                    break;
                }
            }
        }
    }

    info!("idle reaper stopped");
}
