//! Map raw protocol message content onto canonical message kinds.
//!
//! Only a small closed set of content shapes is recognized. Wrapper shapes
//! (ephemeral, view-once, document-with-caption) are unwrapped first.
//! Anything else becomes [`MessageKind::System`] with the raw content kept.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::message::{Direction, Message, MessageKind, MessagePayload, MessageStatus};
use crate::session::SessionId;
use crate::transport::RawMessage;

/// Wrapper keys whose `message` field holds the real content.
const WRAPPERS: [&str; 5] = [
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
];

/// Keys that ride along with any content and never name its shape.
const METADATA_KEYS: [&str; 3] = [
    "messageContextInfo",
    "senderKeyDistributionMessage",
    "contextInfo",
];

/// Maximum wrapper nesting followed before giving up.
const MAX_WRAPPER_DEPTH: usize = 3;

/// Raw message cannot be turned into a record at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// The network did not assign a message id.
    #[error("message has no protocol id")]
    MissingId,

    /// The chat address is empty.
    #[error("message has no chat address")]
    MissingRemote,
}

/// Build the canonical record for a raw message received on `session_id`.
///
/// # Errors
///
/// Returns [`NormalizeError`] when the id or chat address is missing.
pub fn normalize(
    session_id: &SessionId,
    raw: &RawMessage,
    now: DateTime<Utc>,
) -> Result<Message, NormalizeError> {
    if raw.id.trim().is_empty() {
        return Err(NormalizeError::MissingId);
    }
    if raw.remote.trim().is_empty() {
        return Err(NormalizeError::MissingRemote);
    }

    let (kind, payload) = classify(&raw.content);
    let sent_at = raw
        .timestamp
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(now);

    let (direction, status, delivered_at) = if raw.from_me {
        (Direction::Outbound, MessageStatus::Sent, None)
    } else {
        (Direction::Inbound, MessageStatus::Delivered, Some(now))
    };

    Ok(Message {
        tenant_id: session_id.tenant_id().to_owned(),
        session_id: session_id.clone(),
        protocol_message_id: raw.id.clone(),
        direction,
        peer: normalize_remote(&raw.remote),
        kind,
        payload,
        status,
        sent_at,
        delivered_at,
        read_at: None,
        acting_user: None,
    })
}

/// Strip a device suffix (`user:device@server`) from a chat address.
pub fn normalize_remote(remote: &str) -> String {
    match remote.split_once('@') {
        Some((user, server)) => {
            let user = user.split_once(':').map_or(user, |(base, _)| base);
            format!("{user}@{server}")
        }
        None => remote.to_owned(),
    }
}

/// Determine kind and payload of a content object.
pub fn classify(content: &Value) -> (MessageKind, MessagePayload) {
    let inner = unwrap_content(content);

    if let Some(text) = inner.get("conversation").and_then(Value::as_str) {
        return text_payload(text);
    }
    if let Some(text) = inner
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        return text_payload(text);
    }

    for (key, kind) in [
        ("imageMessage", MessageKind::Image),
        ("videoMessage", MessageKind::Video),
        ("audioMessage", MessageKind::Audio),
        ("documentMessage", MessageKind::Document),
    ] {
        if let Some(media) = inner.get(key).filter(|m| m.is_object()) {
            return (kind, media_payload(media));
        }
    }

    let shape = inner
        .as_object()
        .and_then(|obj| obj.keys().find(|key| !METADATA_KEYS.contains(&key.as_str())))
        .cloned();
    (
        MessageKind::System,
        MessagePayload::System {
            shape,
            raw: content.clone(),
        },
    )
}

fn unwrap_content(content: &Value) -> &Value {
    let mut current = content;
    for _ in 0..MAX_WRAPPER_DEPTH {
        let next = WRAPPERS
            .iter()
            .find_map(|key| current.get(key).and_then(|wrapper| wrapper.get("message")));
        match next {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

fn text_payload(text: &str) -> (MessageKind, MessagePayload) {
    (
        MessageKind::Text,
        MessagePayload::Text {
            text: text.to_owned(),
        },
    )
}

fn media_payload(media: &Value) -> MessagePayload {
    let string = |key: &str| media.get(key).and_then(Value::as_str).map(str::to_owned);
    // fileLength arrives as a number or a decimal string depending on the encoder.
    let size_bytes = media.get("fileLength").and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    MessagePayload::Media {
        caption: string("caption"),
        mime_type: string("mimetype"),
        file_name: string("fileName"),
        url: string("url"),
        size_bytes,
    }
}
