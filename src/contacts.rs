//! Lightweight contact/group records, created the first time a peer is seen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::PeerAddress;
use crate::store::{MessageStore, StoreError};

/// A peer (person or group) a tenant has exchanged messages with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Owning tenant.
    pub tenant_id: String,
    /// Normalized peer address.
    pub address: String,
    /// Display name pushed by the network, if any.
    pub display_name: Option<String>,
    /// Whether the address is a group.
    pub is_group: bool,
    /// First sighting.
    pub first_seen_at: DateTime<Utc>,
    /// Most recent sighting.
    pub last_seen_at: DateTime<Utc>,
}

/// Upserts contacts on inbound traffic.
///
/// Every sighting goes to the store: the upsert keeps the first sighting,
/// the newest `last_seen_at` and any known display name, so repeats are
/// harmless.
pub struct ContactResolver {
    store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for ContactResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactResolver").finish_non_exhaustive()
    }
}

impl ContactResolver {
    /// Create a resolver writing through `store`.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Record a sighting of `peer` for `tenant_id` and return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        peer: &PeerAddress,
        display_name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Contact, StoreError> {
        let contact = Contact {
            tenant_id: tenant_id.to_owned(),
            address: peer.to_string(),
            display_name: display_name.map(str::to_owned),
            is_group: peer.is_group(),
            first_seen_at: seen_at,
            last_seen_at: seen_at,
        };
        let stored = self.store.upsert_contact(&contact).await?;
        if stored.first_seen_at == seen_at {
            debug!(
                tenant = %tenant_id,
                address = %stored.address,
                is_group = stored.is_group,
                "contact resolved"
            );
        }
        Ok(stored)
    }
}
