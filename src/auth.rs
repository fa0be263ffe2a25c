//! Per-session credential material at rest.
//!
//! The supervisor only reads and writes credentials through [`AuthStore`].
//! [`FileAuthStore`] keeps one JSON document per session at
//! `<dir>/<tenant>/<name>.json` with owner-only permissions, rewritten
//! atomically on every rotation.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::session::{SessionId, SessionKey};

/// Opaque credential blob produced by the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthBlob(Vec<u8>);

impl AuthBlob {
    /// Wrap raw credential bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw credential bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as standard base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Decode from standard base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64.
    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(value).map(Self)
    }
}

impl fmt::Debug for AuthBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthBlob")
            .field("len", &self.0.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Saved credentials for one session.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Opaque credential blob.
    pub blob: AuthBlob,
    /// Number of saves since the credential was first created.
    pub rotation: u64,
    /// When the credential was last written.
    pub updated_at: DateTime<Utc>,
}

/// Errors from the auth store.
#[derive(Debug, thiserror::Error)]
pub enum AuthStoreError {
    /// Filesystem operation failed.
    #[error("credential I/O failed for {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Stored document could not be parsed.
    #[error("corrupt credential file {path}: {reason}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Stored file is readable by group or others.
    #[error("credential file {path} must be 0600, found {mode:o}")]
    InsecurePermissions {
        /// File involved.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },
}

/// Load/save contract for credential material.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Load saved credentials, if any.
    async fn load(&self, session_id: &SessionId) -> Result<Option<Credential>, AuthStoreError>;

    /// Persist a rotated credential blob; returns the new rotation counter.
    async fn save(&self, session_id: &SessionId, blob: AuthBlob) -> Result<u64, AuthStoreError>;

    /// Forget credentials permanently (logout).
    async fn delete(&self, session_id: &SessionId) -> Result<(), AuthStoreError>;

    /// Whether credentials are saved for this session.
    async fn exists(&self, session_id: &SessionId) -> Result<bool, AuthStoreError>;
}

/// On-disk document format.
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    rotation: u64,
    updated_at: DateTime<Utc>,
    blob: String,
}

/// Filesystem-backed [`AuthStore`].
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    dir: PathBuf,
}

impl FileAuthStore {
    /// Store credentials under `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the credential file for a session.
    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        let SessionKey { tenant_id, name } = session_id.key();
        self.dir.join(tenant_id).join(format!("{name}.json"))
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredCredential>, AuthStoreError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AuthStoreError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        validate_private_permissions(path).await?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| AuthStoreError::Corrupt {
                path: path.to_owned(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Credential>, AuthStoreError> {
        let path = self.path_for(session_id);
        let Some(stored) = self.read(&path).await? else {
            trace!(%session_id, "no saved credentials");
            return Ok(None);
        };
        let blob = AuthBlob::from_base64(&stored.blob).map_err(|e| AuthStoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(Credential {
            blob,
            rotation: stored.rotation,
            updated_at: stored.updated_at,
        }))
    }

    async fn save(&self, session_id: &SessionId, blob: AuthBlob) -> Result<u64, AuthStoreError> {
        let path = self.path_for(session_id);
        let previous = match self.read(&path).await {
            Ok(stored) => stored.map_or(0, |s| s.rotation),
            Err(AuthStoreError::Corrupt { .. }) => 0,
            Err(e) => return Err(e),
        };
        let rotation = previous.saturating_add(1);

        let doc = StoredCredential {
            rotation,
            updated_at: Utc::now(),
            blob: blob.to_base64(),
        };
        let body = serde_json::to_vec(&doc).map_err(|e| AuthStoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let parent = path.parent().unwrap_or(&self.dir).to_owned();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|source| AuthStoreError::Io {
                path: parent.clone(),
                source,
            })?;

        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        write_private(&tmp, &body).await?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AuthStoreError::Io { path, source });
        }

        debug!(%session_id, rotation, "credentials saved");
        Ok(rotation)
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), AuthStoreError> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%session_id, "credentials deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AuthStoreError::Io { path, source }),
        }
    }

    async fn exists(&self, session_id: &SessionId) -> Result<bool, AuthStoreError> {
        let path = self.path_for(session_id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| AuthStoreError::Io { path, source })
    }
}

async fn write_private(path: &Path, body: &[u8]) -> Result<(), AuthStoreError> {
    let io_err = |source| AuthStoreError::Io {
        path: path.to_owned(),
        source,
    };
    tokio::fs::write(path, body).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(io_err)?;
    }

    Ok(())
}

#[cfg(unix)]
async fn validate_private_permissions(path: &Path) -> Result<(), AuthStoreError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| AuthStoreError::Io {
            path: path.to_owned(),
            source,
        })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(AuthStoreError::InsecurePermissions {
            path: path.to_owned(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
async fn validate_private_permissions(_path: &Path) -> Result<(), AuthStoreError> {
    Ok(())
}
