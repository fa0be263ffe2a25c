//! HTTP client for a multi-session protocol sidecar.
//!
//! The sidecar owns the actual chat-network sockets. Each session is
//! addressed under `/sessions/{id}/...`; events are fetched by HTTP
//! long-polling and forwarded into the session's event channel.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    CloseReason, OutboundPayload, RawMessage, SendAck, Transport, TransportError, TransportEvent,
};
use crate::auth::AuthBlob;
use crate::message::Receipt;
use crate::session::{PeerAddress, SessionId};

/// Default sidecar address.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3001";

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Long-poll timeout for the event stream.
const POLL_TIMEOUT_SECS: u64 = 60;

/// Delay after a non-200 poll response before polling again.
const POLL_ERROR_DELAY_SECS: u64 = 5;

/// Buffered events per session before the poller waits for the supervisor.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Event as serialized by the sidecar.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    Connecting,
    Qr {
        qr: String,
    },
    Open {
        #[serde(default)]
        phone: Option<String>,
    },
    Close {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        message: Option<String>,
    },
    Creds {
        data: String,
    },
    Message {
        message: RawMessage,
    },
    Receipt {
        receipt: Receipt,
    },
    /// Presence, typing and other sidecar events nothing here consumes.
    #[serde(other)]
    Ignored,
}

impl BridgeEvent {
    /// Decode one entry of an event batch on its own, so a bad entry
    /// costs only itself.
    fn decode(value: serde_json::Value) -> Result<Option<TransportEvent>, TransportError> {
        let event: Self = serde_json::from_value(value)
            .map_err(|e| TransportError::Malformed(format!("bridge event: {e}")))?;
        event.into_transport_event()
    }

    fn into_transport_event(self) -> Result<Option<TransportEvent>, TransportError> {
        Ok(Some(match self {
            Self::Connecting => TransportEvent::Connecting,
            Self::Qr { qr } => TransportEvent::Qr(qr),
            Self::Open { phone } => TransportEvent::Connected { phone },
            Self::Close {
                code: Some(code),
                message,
            } => TransportEvent::Closed(CloseReason::from_code(code, message)),
            Self::Close {
                code: None,
                message: None,
            } => TransportEvent::Closed(CloseReason::ConnectionLost),
            Self::Close {
                code: None,
                message: Some(message),
            } => TransportEvent::Closed(CloseReason::Other {
                code: None,
                message,
            }),
            Self::Creds { data } => TransportEvent::CredentialsUpdated(
                AuthBlob::from_base64(&data)
                    .map_err(|e| TransportError::Malformed(format!("credential blob: {e}")))?,
            ),
            Self::Message { message } => TransportEvent::Message(message),
            Self::Receipt { receipt } => TransportEvent::Receipt(receipt),
            Self::Ignored => return Ok(None),
        }))
    }
}

#[derive(Serialize)]
struct OpenRequest {
    auth: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    jid: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Deserialize)]
struct SendAckBody {
    id: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// [`Transport`] backed by the HTTP sidecar.
pub struct BridgeTransport {
    client: reqwest::Client,
    poll_client: reqwest::Client,
    base_url: Url,
    pollers: DashMap<SessionId, JoinHandle<()>>,
}

impl std::fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("base_url", &self.base_url.as_str())
            .field("open_sessions", &self.pollers.len())
            .finish()
    }
}

impl BridgeTransport {
    /// Create a transport pointing at the given sidecar base URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] if the URL cannot carry a path.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Malformed(format!("bridge URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::Malformed(format!(
                "bridge URL {base_url} cannot carry a path"
            )));
        }

        let client = build_client(request_timeout);
        let poll_client = build_client(Duration::from_secs(POLL_TIMEOUT_SECS));

        Ok(Self {
            client,
            poll_client,
            base_url,
            pollers: DashMap::new(),
        })
    }

    /// Check whether the sidecar answers its status endpoint.
    pub async fn health_check(&self) -> bool {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("status");
        }
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn session_url(&self, session_id: &SessionId, action: &str) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base URLs, so segments are always available.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["sessions", session_id.as_str(), action]);
        }
        url
    }

    fn stop_poller(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.pollers.remove(session_id) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn open(
        &self,
        session_id: &SessionId,
        auth: Option<AuthBlob>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.stop_poller(session_id);

        let body = OpenRequest {
            auth: auth.as_ref().map(AuthBlob::to_base64),
        };
        let resp = self
            .client
            .post(self.session_url(session_id, "open"))
            .json(&body)
            .send()
            .await?;
        check_response(session_id, resp).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poll_url = self.session_url(session_id, "events");
        let handle = tokio::spawn(poll_events(
            self.poll_client.clone(),
            poll_url,
            session_id.clone(),
            tx,
        ));
        self.pollers.insert(session_id.clone(), handle);

        info!(%session_id, resumed = auth.is_some(), "bridge session opened");
        Ok(rx)
    }

    async fn send(
        &self,
        session_id: &SessionId,
        peer: &PeerAddress,
        payload: &OutboundPayload,
    ) -> Result<SendAck, TransportError> {
        let body = match payload {
            OutboundPayload::Text { text } => SendRequest {
                jid: peer.to_string(),
                kind: "text",
                text: Some(text),
                data: None,
                caption: None,
            },
            OutboundPayload::Media {
                kind,
                bytes,
                caption,
            } => SendRequest {
                jid: peer.to_string(),
                kind: kind.as_str(),
                text: None,
                data: Some(AuthBlob::new(bytes.clone()).to_base64()),
                caption: caption.as_deref(),
            },
        };

        let resp = self
            .client
            .post(self.session_url(session_id, "send"))
            .json(&body)
            .send()
            .await?;
        let resp = check_response(session_id, resp).await?;
        let envelope: BridgeResponse<SendAckBody> = resp.json().await?;
        let ack = envelope.data.ok_or_else(|| {
            TransportError::Malformed(
                envelope
                    .error
                    .unwrap_or_else(|| "send response without message id".to_owned()),
            )
        })?;

        debug!(%session_id, peer = %peer, message_id = %ack.id, "message sent via bridge");
        Ok(SendAck {
            message_id: ack.id,
            timestamp: ack
                .timestamp
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
        })
    }

    async fn close(&self, session_id: &SessionId) -> Result<(), TransportError> {
        self.stop_poller(session_id);
        let resp = self
            .client
            .post(self.session_url(session_id, "close"))
            .send()
            .await?;
        match check_response(session_id, resp).await {
            Ok(_) | Err(TransportError::NotOpen(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self, session_id: &SessionId) -> Result<(), TransportError> {
        self.stop_poller(session_id);
        let resp = self
            .client
            .post(self.session_url(session_id, "logout"))
            .send()
            .await?;
        check_response(session_id, resp).await?;
        info!(%session_id, "bridge session logged out");
        Ok(())
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build HTTP client with timeouts, using default");
            reqwest::Client::default()
        })
}

/// Map non-success statuses onto transport error classes.
async fn check_response(
    session_id: &SessionId,
    resp: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    if status == reqwest::StatusCode::NOT_FOUND {
        Err(TransportError::NotOpen(session_id.clone()))
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(TransportError::Unavailable(detail))
    } else {
        Err(TransportError::Rejected(detail))
    }
}

/// Long-poll the sidecar for one session until the connection closes,
/// the receiver is dropped, or a network error occurs.
///
/// Reconnection is the supervisor's job: on a network error the poller
/// reports `ConnectionLost` and exits.
async fn poll_events(
    client: reqwest::Client,
    poll_url: Url,
    session_id: SessionId,
    tx: mpsc::Sender<TransportEvent>,
) {
    loop {
        match client.get(poll_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                let events = match resp.json::<BridgeResponse<Vec<serde_json::Value>>>().await {
                    Ok(envelope) => envelope.data.unwrap_or_default(),
                    Err(e) => {
                        warn!(%session_id, error = %e, "undecodable event batch, skipping");
                        tokio::time::sleep(Duration::from_secs(POLL_ERROR_DELAY_SECS)).await;
                        continue;
                    }
                };
                for value in events {
                    let event = match BridgeEvent::decode(value) {
                        Ok(Some(event)) => event,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(%session_id, error = %e, "dropping malformed bridge event");
                            continue;
                        }
                    };
                    let closed = matches!(event, TransportEvent::Closed(_));
                    if tx.send(event).await.is_err() {
                        // Receiver dropped: the supervisor has moved on.
                        return;
                    }
                    if closed {
                        return;
                    }
                }
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                warn!(%session_id, "bridge no longer knows this session");
                let _ = tx
                    .send(TransportEvent::Closed(CloseReason::ConnectionLost))
                    .await;
                return;
            }
            Ok(resp) => {
                debug!(%session_id, status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(Duration::from_secs(POLL_ERROR_DELAY_SECS)).await;
            }
            Err(e) if e.is_timeout() => {
                // Normal: long-poll timeout expired, just retry immediately.
                continue;
            }
            Err(e) => {
                warn!(%session_id, error = %e, "bridge event stream failed");
                let _ = tx
                    .send(TransportEvent::Closed(CloseReason::ConnectionLost))
                    .await;
                return;
            }
        }
    }
}
