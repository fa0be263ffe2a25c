//! Configuration loading and validation.
//!
//! Loads `config.toml` from `$SWITCHBOARD_CONFIG` or `~/.switchboard/`.
//! Every field has a default, so a missing file is not an error.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::orchestrator::SwitchboardConfig;
use crate::reaper::ReaperConfig;
use crate::retry::RetryPolicy;
use crate::session::SessionKey;
use crate::supervisor::ReconnectPolicy;
use crate::transport::bridge::DEFAULT_BRIDGE_URL;

/// Env var selecting the config file.
pub const CONFIG_ENV: &str = "SWITCHBOARD_CONFIG";

/// Env var overriding `bridge.base_url`.
pub const BRIDGE_URL_ENV: &str = "SWITCHBOARD_BRIDGE_URL";

/// Env var overriding `paths.database`.
pub const DATABASE_ENV: &str = "SWITCHBOARD_DATABASE";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Protocol sidecar connection.
    pub bridge: BridgeConfig,
    /// Reconnect and send behaviour.
    pub supervisor: SupervisorConfig,
    /// Failed-ingestion redelivery.
    pub retry: RetryConfig,
    /// Stalled pairing and QR expiry sweep.
    pub reaper: IdleReaperConfig,
    /// Event fan-out.
    pub events: EventsConfig,
    /// Restart hint cache.
    pub hints: HintsConfig,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout_secs: u64,
    /// Resume sessions with saved credentials on start.
    pub auto_resume: bool,
    /// Sessions opened by `serve` at startup.
    pub sessions: Vec<BootstrapSession>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            bridge: BridgeConfig::default(),
            supervisor: SupervisorConfig::default(),
            retry: RetryConfig::default(),
            reaper: IdleReaperConfig::default(),
            events: EventsConfig::default(),
            hints: HintsConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            auto_resume: false,
            sessions: Vec::new(),
        }
    }
}

/// Filesystem locations. Relative or missing values resolve under the
/// config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Credential directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,
    /// Log directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Database file under `root` unless configured.
    pub fn database(&self, root: &Path) -> PathBuf {
        resolve(root, self.database.as_deref(), "switchboard.db")
    }

    /// Credential directory under `root` unless configured.
    pub fn auth_dir(&self, root: &Path) -> PathBuf {
        resolve(root, self.auth_dir.as_deref(), "auth")
    }

    /// Log directory under `root` unless configured.
    pub fn logs_dir(&self, root: &Path) -> PathBuf {
        resolve(root, self.logs_dir.as_deref(), "logs")
    }
}

/// Sidecar connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the sidecar HTTP API.
    pub base_url: String,
    /// Timeout for non-polling requests.
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BRIDGE_URL.to_owned(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Reconnect backoff and send timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Linear backoff unit in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Consecutive transient closes tolerated.
    pub max_reconnect_attempts: u32,
    /// Send acknowledgement timeout.
    pub send_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl SupervisorConfig {
    /// Backoff policy for supervisors.
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Retry queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Sweep interval.
    pub interval_secs: u64,
    /// Failed replays before dead-lettering.
    pub max_attempts: u32,
    /// Linear backoff unit.
    pub base_delay_secs: u64,
    /// Dead letters kept in memory.
    pub dead_letter_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval_secs(),
            max_attempts: default_retry_max_attempts(),
            base_delay_secs: default_retry_base_delay_secs(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl RetryConfig {
    /// Runtime retry policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.interval_secs),
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            dead_letter_capacity: self.dead_letter_capacity,
        }
    }
}

/// Idle reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleReaperConfig {
    /// Sweep interval.
    pub interval_secs: u64,
    /// Longest time a session may spend pairing.
    pub connect_timeout_secs: u64,
    /// QR challenge lifetime.
    pub qr_ttl_secs: u64,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            qr_ttl_secs: default_qr_ttl_secs(),
        }
    }
}

impl IdleReaperConfig {
    /// Runtime reaper settings.
    pub fn to_reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            qr_ttl: Duration::from_secs(self.qr_ttl_secs),
        }
    }
}

/// Event fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it starts lagging.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::broadcast::DEFAULT_CAPACITY,
        }
    }
}

/// Hint cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HintsConfig {
    /// Whether to keep hints at all.
    pub enabled: bool,
    /// Hint lifetime.
    pub ttl_secs: u64,
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_hint_ttl_secs(),
        }
    }
}

/// A session opened at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSession {
    /// Tenant id.
    pub tenant: String,
    /// Session name.
    #[serde(default = "default_session_name")]
    pub name: String,
}

// Default value functions for serde

fn default_shutdown_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_reconnect_base_delay_ms() -> u64 {
    2_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_send_timeout_secs() -> u64 {
    15
}
fn default_retry_interval_secs() -> u64 {
    180
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_base_delay_secs() -> u64 {
    60
}
fn default_dead_letter_capacity() -> usize {
    1000
}
fn default_reaper_interval_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    300
}
fn default_qr_ttl_secs() -> u64 {
    60
}
fn default_hint_ttl_secs() -> u64 {
    86_400
}
fn default_session_name() -> String {
    "default".to_owned()
}

impl Config {
    /// Load configuration: explicit path, else `$SWITCHBOARD_CONFIG`,
    /// else `~/.switchboard/config.toml`; then apply env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if validation fails.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_owned(),
            None => match env(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => config_dir()?.join("config.toml"),
            },
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };

        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string without env overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(url) = env(BRIDGE_URL_ENV).filter(|v| !v.is_empty()) {
            self.bridge.base_url = url;
        }
        if let Some(db) = env(DATABASE_ENV).filter(|v| !v.is_empty()) {
            self.paths.database = Some(PathBuf::from(db));
        }
    }

    /// Check values that would otherwise fail at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.bridge.base_url)
            .with_context(|| format!("bridge.base_url is not a URL: {}", self.bridge.base_url))?;
        anyhow::ensure!(
            self.retry.interval_secs > 0,
            "retry.interval_secs must be positive"
        );
        anyhow::ensure!(
            self.reaper.interval_secs > 0,
            "reaper.interval_secs must be positive"
        );
        anyhow::ensure!(
            self.reaper.qr_ttl_secs > 0,
            "reaper.qr_ttl_secs must be positive"
        );
        anyhow::ensure!(
            self.supervisor.send_timeout_secs > 0,
            "supervisor.send_timeout_secs must be positive"
        );
        anyhow::ensure!(self.events.capacity > 0, "events.capacity must be positive");
        for session in &self.sessions {
            SessionKey::new(&session.tenant, &session.name).with_context(|| {
                format!("invalid [[sessions]] entry {}/{}", session.tenant, session.name)
            })?;
        }
        Ok(())
    }

    /// Runtime settings for the core.
    pub fn switchboard(&self) -> SwitchboardConfig {
        SwitchboardConfig {
            reconnect: self.supervisor.policy(),
            retry: self.retry.policy(),
            reaper: self.reaper.to_reaper(),
            send_timeout: Duration::from_secs(self.supervisor.send_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            event_capacity: self.events.capacity,
        }
    }

    /// Bridge request timeout.
    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.request_timeout_secs)
    }
}

/// Resolve the default config directory (`~/.switchboard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".switchboard"))
}

fn resolve(root: &Path, configured: Option<&Path>, default_name: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_owned(),
        Some(path) => root.join(path),
        None => root.join(default_name),
    }
}
