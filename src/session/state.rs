//! Session lifecycle status, transition table, and per-session state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qrcode::render::{svg, unicode};
use qrcode::types::QrError;
use qrcode::QrCode;
use serde::{Deserialize, Serialize};

use super::SessionKey;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered but not yet attempting to connect.
    Disconnected,
    /// Credentials loaded, transport opening.
    Connecting,
    /// Waiting for the user to scan a QR challenge.
    QrReady,
    /// Authenticated and live.
    Connected,
    /// Lost the connection, waiting out a backoff before reopening.
    Reconnecting,
    /// Torn down; the session is no longer live.
    Terminated,
}

impl SessionStatus {
    /// Returns the in-memory string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrReady => "qr_ready",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }

    /// Returns the string written to the `sessions` table.
    ///
    /// Terminated sessions are persisted as `disconnected`; the reason
    /// column tells them apart.
    pub fn persisted_str(&self) -> &'static str {
        match self {
            Self::Terminated => Self::Disconnected.as_str(),
            other => other.as_str(),
        }
    }

    /// Parse from a stored or wire value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disconnected" => Some(Self::Disconnected),
            "connecting" => Some(Self::Connecting),
            "qr_ready" => Some(Self::QrReady),
            "connected" => Some(Self::Connected),
            "reconnecting" => Some(Self::Reconnecting),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Whether the session is still waiting to finish pairing.
    pub fn is_pairing(&self) -> bool {
        matches!(self, Self::Connecting | Self::QrReady)
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Status to report for a session no supervisor is running.
    ///
    /// A persisted `connected` or `reconnecting` row outlives a crash, so
    /// anything short of `terminated` reads as `disconnected`.
    pub fn at_rest(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            Self::Disconnected
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::{Connected, Connecting, Disconnected, QrReady, Reconnecting, Terminated};

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Disconnected, Connecting) => true,
            (Connecting, QrReady | Connected | Reconnecting) => true,
            (QrReady, QrReady | Connecting | Connected | Reconnecting) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Reconnecting | QrReady | Connecting | Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// Status before the attempted change.
    pub from: SessionStatus,
    /// Requested status.
    pub to: SessionStatus,
}

/// A pairing challenge, held in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrArtifact {
    /// Raw challenge string from the transport.
    pub code: String,
    /// When the challenge was received.
    pub issued_at: DateTime<Utc>,
}

impl QrArtifact {
    /// Wrap a challenge received at `issued_at`.
    pub fn new(code: String, issued_at: DateTime<Utc>) -> Self {
        Self { code, issued_at }
    }

    /// Whether the challenge is older than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        match self.issued_at.checked_add_signed(ttl) {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    /// Render the challenge as an SVG image.
    ///
    /// # Errors
    ///
    /// Returns [`QrError`] if the code does not fit in a QR symbol.
    pub fn render_svg(&self) -> Result<String, QrError> {
        let code = QrCode::new(self.code.as_bytes())?;
        Ok(code
            .render::<svg::Color>()
            .min_dimensions(256, 256)
            .build())
    }

    /// Render the challenge as block characters for a terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QrError`] if the code does not fit in a QR symbol.
    pub fn render_terminal(&self) -> Result<String, QrError> {
        let code = QrCode::new(self.code.as_bytes())?;
        Ok(code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build())
    }
}

/// Runtime state of one session. Written only by its supervisor task,
/// except for QR expiry which the reaper may clear.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Owning identity.
    pub key: SessionKey,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Why the session was terminated, if it was.
    pub reason: Option<String>,
    /// Phone identity, known once connected.
    pub phone: Option<String>,
    /// Current pairing challenge, if any.
    pub qr: Option<QrArtifact>,
    /// Consecutive failed reconnect attempts since the last `connected`.
    pub reconnect_attempts: u32,
    /// When the session was registered.
    pub created_at: DateTime<Utc>,
    /// When the current status was entered.
    pub status_since: DateTime<Utc>,
    /// When the session entered the pairing states (`connecting`/`qr_ready`).
    pub pairing_since: Option<DateTime<Utc>>,
    /// Last transition or message seen.
    pub last_activity_at: DateTime<Utc>,
}

impl SessionState {
    /// Fresh state for a newly registered session.
    pub fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: SessionStatus::Disconnected,
            reason: None,
            phone: None,
            qr: None,
            reconnect_attempts: 0,
            created_at: now,
            status_since: now,
            pairing_since: None,
            last_activity_at: now,
        }
    }

    /// Move to `next`, updating timestamps.
    ///
    /// Self-transitions (e.g. a refreshed QR) keep `status_since`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the table forbids the change.
    pub fn transition(
        &mut self,
        next: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next.is_pairing() {
            if self.pairing_since.is_none() {
                self.pairing_since = Some(now);
            }
        } else {
            self.pairing_since = None;
        }
        if next != self.status {
            self.status_since = now;
        }
        self.status = next;
        self.last_activity_at = now;
        Ok(())
    }

    /// Record activity without changing status.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Whether the session has been pairing for longer than `timeout`.
    pub fn pairing_stalled(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let (Some(since), Ok(timeout)) = (self.pairing_since, chrono::Duration::from_std(timeout))
        else {
            return false;
        };
        since
            .checked_add_signed(timeout)
            .is_some_and(|deadline| now >= deadline)
    }
}
