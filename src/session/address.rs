//! Normalized peer addresses.
//!
//! A peer is `<user>@<server>`: a phone-like run of digits for direct chats,
//! or `<digits>-<digits>` / `<digits>` on the group server for group chats.
//! Callers strip formatting before sending; anything else is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Server part used by group chats.
pub const GROUP_SERVER: &str = "g.us";

/// Shortest accepted numeric user part.
const MIN_USER_DIGITS: usize = 5;

/// Longest accepted numeric run in a user part.
const MAX_USER_DIGITS: usize = 24;

/// A validated peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    user: String,
    server: String,
}

impl PeerAddress {
    /// Parse a normalized address.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidPeer`] if the value is not of the
    /// form `<digits>[-<digits>]@<server>`.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidPeer(value.to_owned());

        let (user, server) = value.split_once('@').ok_or_else(invalid)?;
        if !is_valid_server(server) {
            return Err(invalid());
        }

        let valid_user = match user.split_once('-') {
            Some((head, tail)) => {
                server == GROUP_SERVER && is_digit_run(head) && is_digit_run(tail)
            }
            None => is_digit_run(user),
        };
        if !valid_user {
            return Err(invalid());
        }

        Ok(Self {
            user: user.to_owned(),
            server: server.to_owned(),
        })
    }

    /// User part (phone number or group id).
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Server part.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the address names a group chat.
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.to_string()
    }
}

fn is_digit_run(value: &str) -> bool {
    (MIN_USER_DIGITS..=MAX_USER_DIGITS).contains(&value.len())
        && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_valid_server(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.ends_with('.')
        && !value.contains("..")
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.')
}
