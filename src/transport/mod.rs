//! Transport adapter seam: the chat-network protocol lives behind [`Transport`].
//!
//! The supervisor opens one event stream per session and reacts to
//! [`TransportEvent`]s; it never sees protocol details. The production
//! implementation is [`bridge::BridgeTransport`], which talks to a
//! protocol sidecar over HTTP.

pub mod bridge;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::AuthBlob;
use crate::message::{MessageKind, Receipt};
use crate::session::{PeerAddress, SessionId};

/// Errors from the transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request to the sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The network or sidecar is temporarily unavailable.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The network refused the request; retrying will not help.
    #[error("rejected by transport: {0}")]
    Rejected(String),

    /// No open connection for this session.
    #[error("session not open on transport: {0}")]
    NotOpen(SessionId),

    /// Response could not be understood.
    #[error("malformed transport response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Whether the failure is environmental and may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_decode() && !e.is_builder(),
            Self::Unavailable(_) | Self::NotOpen(_) => true,
            Self::Rejected(_) | Self::Malformed(_) => false,
        }
    }
}

/// Why a transport connection closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The socket dropped.
    ConnectionLost,
    /// Keepalive or handshake timed out.
    TimedOut,
    /// The network asked the client to restart the stream.
    RestartRequired,
    /// The network is temporarily unavailable.
    ServiceUnavailable,
    /// The device was logged out; credentials are void.
    LoggedOut,
    /// Another client took over this identity.
    Replaced,
    /// Credentials are unusable and must be discarded.
    BadSession,
    /// The account is banned or otherwise forbidden.
    Forbidden,
    /// Anything else.
    Other {
        /// Protocol status code, if any.
        code: Option<u16>,
        /// Human-readable detail.
        message: String,
    },
}

impl CloseReason {
    /// Map a protocol disconnect status code.
    pub fn from_code(code: u16, message: Option<String>) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::TimedOut,
            428 => Self::ConnectionLost,
            440 => Self::Replaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => Self::Other {
                code: Some(code),
                message: message.unwrap_or_default(),
            },
        }
    }

    /// Whether the supervisor should try to reconnect.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::LoggedOut | Self::Replaced | Self::BadSession | Self::Forbidden
        )
    }

    /// Whether saved credentials must be discarded.
    pub fn invalidates_credentials(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::BadSession)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::TimedOut => f.write_str("timed out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ServiceUnavailable => f.write_str("service unavailable"),
            Self::LoggedOut => f.write_str("logged out"),
            Self::Replaced => f.write_str("replaced by another client"),
            Self::BadSession => f.write_str("bad session"),
            Self::Forbidden => f.write_str("forbidden"),
            Self::Other {
                code: Some(code),
                message,
            } => write!(f, "closed ({code}): {message}"),
            Self::Other {
                code: None,
                message,
            } => write!(f, "closed: {message}"),
        }
    }
}

/// A raw message event as produced by the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Network-assigned message id.
    pub id: String,
    /// Chat the message belongs to.
    pub remote: String,
    /// Whether this session sent it (possibly from another device).
    #[serde(default)]
    pub from_me: bool,
    /// Sender display name, if the network provided one.
    #[serde(default)]
    pub push_name: Option<String>,
    /// Send time in unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Protocol content object.
    #[serde(default)]
    pub content: Value,
}

/// Events emitted by an open transport connection, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is being (re)established.
    Connecting,
    /// A pairing challenge to show the user.
    Qr(String),
    /// Authenticated; carries the phone identity.
    Connected {
        /// Phone identity of the linked account.
        phone: Option<String>,
    },
    /// The connection closed. No further events follow.
    Closed(CloseReason),
    /// Credential material rotated and must be saved.
    CredentialsUpdated(AuthBlob),
    /// A message was sent or received.
    Message(RawMessage),
    /// Delivery/read status changed for a known message.
    Receipt(Receipt),
}

/// Outbound content handed to the transport.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    /// Plain text.
    Text {
        /// Message body.
        text: String,
    },
    /// Media attachment.
    Media {
        /// Media kind (image, video, audio, document).
        kind: MessageKind,
        /// File contents.
        bytes: Vec<u8>,
        /// Optional caption.
        caption: Option<String>,
    },
}

/// Network acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    /// Network-assigned message id.
    pub message_id: String,
    /// Server timestamp, if reported.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Capability boundary to the chat network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `session_id` and return its event stream.
    ///
    /// `auth` is `None` for a fresh pairing. The stream ends after a
    /// [`TransportEvent::Closed`] or when [`close`](Self::close) is called.
    async fn open(
        &self,
        session_id: &SessionId,
        auth: Option<AuthBlob>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Send a message on an open connection.
    async fn send(
        &self,
        session_id: &SessionId,
        peer: &PeerAddress,
        payload: &OutboundPayload,
    ) -> Result<SendAck, TransportError>;

    /// Close the connection, keeping the linked device.
    async fn close(&self, session_id: &SessionId) -> Result<(), TransportError>;

    /// Unlink the device and close the connection.
    async fn logout(&self, session_id: &SessionId) -> Result<(), TransportError>;
}
