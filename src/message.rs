//! Canonical message records and delivery receipts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionId;

/// Which side of the conversation produced the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent by this session.
    Outbound,
}

impl Direction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Content kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Voice note or audio file.
    Audio,
    /// Arbitrary file.
    Document,
    /// Anything the pipeline does not model; raw content is preserved.
    System,
}

impl MessageKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::System => "system",
        }
    }

    /// Parse from a SQLite or caller-supplied value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Whether this kind carries a binary attachment.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Recorded but not yet acknowledged by the network.
    Pending,
    /// The network rejected or lost the message.
    Failed,
    /// Accepted by the network.
    Sent,
    /// Delivered to the recipient device.
    Delivered,
    /// Read by the recipient.
    Read,
}

impl MessageStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }

    /// Monotonic rank; a stored status is only ever replaced by a higher one.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Failed => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
        }
    }

    /// The further-progressed of two statuses.
    pub fn merge(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Text body.
    Text {
        /// Message text.
        text: String,
    },
    /// Media attachment metadata. The bytes themselves are not stored.
    Media {
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        /// MIME type reported by the network.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Original file name (documents).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        /// Remote media URL, if the network exposed one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Size in bytes, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    /// Unrecognized content kept verbatim for later inspection.
    System {
        /// Top-level content key that identified the shape, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape: Option<String>,
        /// Raw content as received.
        raw: Value,
    },
}

impl MessagePayload {
    /// Text body or caption, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Media { caption, .. } => caption.as_deref(),
            Self::System { .. } => None,
        }
    }
}

/// Canonical message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Owning tenant.
    pub tenant_id: String,
    /// Session the message travelled through.
    pub session_id: SessionId,
    /// Network-assigned id; unique per tenant.
    pub protocol_message_id: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Peer address (chat the message belongs to).
    pub peer: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Kind-specific content.
    pub payload: MessagePayload,
    /// Delivery status.
    pub status: MessageStatus,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
    /// When the message was delivered, if known.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the message was read, if known.
    pub read_at: Option<DateTime<Utc>>,
    /// User who triggered an outbound send, if human-initiated.
    pub acting_user: Option<String>,
}

/// A delivery or read receipt for a previously seen message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Network-assigned id of the message the receipt refers to.
    pub message_id: String,
    /// New status.
    pub status: MessageStatus,
    /// When the status changed (unix seconds), if reported.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Receipt {
    /// Receipt timestamp, falling back to `now`.
    pub fn at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(now)
    }
}
