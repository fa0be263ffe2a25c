//! Session identity, lifecycle status, and peer addressing.
//!
//! A session is one logical connection of a tenant to the chat network,
//! identified by `(tenant_id, name)`. The derived [`SessionId`] is stable
//! across restarts so saved credentials can be found again.

pub mod address;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::address::PeerAddress;
pub use self::state::{QrArtifact, SessionState, SessionStatus};

use crate::store::StoreError;
use crate::transport::TransportError;

/// Maximum length of a tenant id or session name.
const MAX_IDENT_LEN: usize = 64;

/// Separator between tenant and session name inside a [`SessionId`].
const ID_SEPARATOR: char = ':';

/// Input rejected before any work was attempted. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Tenant id is empty, too long, or contains unsupported characters.
    #[error("invalid tenant id: {0:?}")]
    InvalidTenant(String),

    /// Session name is empty, too long, or contains unsupported characters.
    #[error("invalid session name: {0:?}")]
    InvalidSessionName(String),

    /// Session id is not of the form `tenant:name`.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Peer address is not a normalized phone or group identifier.
    #[error("invalid peer address: {0:?}")]
    InvalidPeer(String),

    /// Message kind cannot be sent as media.
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(String),

    /// Outbound text or media body is empty.
    #[error("message body is empty")]
    EmptyBody,
}

/// Errors returned by the public session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A session with the same key is already connected.
    #[error("session already connected: {0}")]
    AlreadyConnected(SessionId),

    /// No live or persisted session with this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session exists but cannot send right now.
    #[error("session {id} is not connected (status: {status})")]
    NotConnected {
        /// Session id.
        id: SessionId,
        /// Status at the time of the call.
        status: SessionStatus,
    },

    /// The transport did not acknowledge within the send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The relational store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether the caller may retry the same operation later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected { .. } | Self::Timeout(_) | Self::Store(_) => true,
            Self::Transport(e) => e.is_transient(),
            Self::Validation(_) | Self::AlreadyConnected(_) | Self::NotFound(_) => false,
        }
    }
}

/// Owning identity of a session: the tenant plus a tenant-chosen name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Tenant the session belongs to.
    pub tenant_id: String,
    /// Tenant-chosen session name (e.g. "default").
    pub name: String,
}

impl SessionKey {
    /// Build a validated key.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if either part is empty, longer than 64
    /// characters, or contains anything other than ASCII letters, digits,
    /// `-` and `_`.
    pub fn new(tenant_id: &str, name: &str) -> Result<Self, ValidationError> {
        if !is_valid_ident(tenant_id) {
            return Err(ValidationError::InvalidTenant(tenant_id.to_owned()));
        }
        if !is_valid_ident(name) {
            return Err(ValidationError::InvalidSessionName(name.to_owned()));
        }
        Ok(Self {
            tenant_id: tenant_id.to_owned(),
            name: name.to_owned(),
        })
    }

    /// The stable session id derived from this key.
    pub fn session_id(&self) -> SessionId {
        SessionId(format!("{}{ID_SEPARATOR}{}", self.tenant_id, self.name))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.name)
    }
}

/// Stable session identifier of the form `tenant:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Parse and validate a session id.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSessionId`] if the value does not
    /// split into a valid tenant and session name.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        Self::key_of(value).map(|key| key.session_id())
    }

    /// Recover the [`SessionKey`] this id was derived from.
    pub fn key(&self) -> SessionKey {
        // Ids are only constructed from validated keys.
        match Self::key_of(&self.0) {
            Ok(key) => key,
            Err(_) => SessionKey {
                tenant_id: String::new(),
                name: self.0.clone(),
            },
        }
    }

    /// Tenant part of the id.
    pub fn tenant_id(&self) -> &str {
        self.0
            .split_once(ID_SEPARATOR)
            .map_or("", |(tenant, _)| tenant)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key_of(value: &str) -> Result<SessionKey, ValidationError> {
        let (tenant, name) = value
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| ValidationError::InvalidSessionId(value.to_owned()))?;
        SessionKey::new(tenant, name)
            .map_err(|_| ValidationError::InvalidSessionId(value.to_owned()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_valid_ident(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENT_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
