//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - The first TOML file found in the default paths
//! - Environment variables (`TANDEM__PORT`, `TANDEM__AUTH__JWT_SECRET`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tandem_core::{MemoryDirectory, RelationshipStatus, SwitchboardConfig};
use tandem_protocol::ClientIdentity;

/// Configuration file locations, in order of preference.
pub const CONFIG_PATHS: [&str; 3] = [
    "tandem.toml",
    "/etc/tandem/tandem.toml",
    "~/.config/tandem/tandem.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Users and contacts served by the built-in directory.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// WebSocket endpoint paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the direct-call endpoint.
    #[serde(default = "default_direct_path")]
    pub direct_path: String,

    /// Path of the random-call endpoint.
    #[serde(default = "default_random_path")]
    pub random_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval at which clients are expected to send `ping`, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close connections silent for this long, in milliseconds. 0 disables.
    #[serde(default)]
    pub timeout_ms: u64,

    /// How often silent connections are looked for, in milliseconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Upper bound on a contact-directory lookup, in milliseconds.
    #[serde(default = "default_directory_timeout")]
    pub directory_timeout_ms: u64,
}

/// Token verification configuration.
///
/// With `jwt_secret` set, tokens are verified as HS256 JWTs. Otherwise
/// only the fixed `tokens` table is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Required `iss` claim.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Required `aud` claim.
    #[serde(default)]
    pub audience: Option<String>,

    /// Accepted clock skew for `exp`/`nbf`, in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,

    /// Fixed tokens, for development.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One fixed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// The token string.
    pub token: String,
    /// Identity it resolves to.
    pub user: ClientIdentity,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Seed data for the built-in directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Known users.
    #[serde(default)]
    pub users: Vec<UserEntry>,

    /// Relationships between users.
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,
}

/// A directory user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Identity.
    pub id: ClientIdentity,
    /// Display name.
    pub name: String,
    /// Login email, matched against the JWT email claim.
    #[serde(default)]
    pub email: Option<String>,
}

/// A directed relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEntry {
    /// Requesting side.
    pub user: ClientIdentity,
    /// Requested side.
    pub friend: ClientIdentity,
    /// Relationship state.
    #[serde(default = "default_status")]
    pub status: RelationshipStatus,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TANDEM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TANDEM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_direct_path() -> String {
    "/ws/direct".to_string()
}

fn default_random_path() -> String {
    "/ws/random".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_reap_interval() -> u64 {
    5_000
}

fn default_directory_timeout() -> u64 {
    5_000
}

fn default_leeway() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_status() -> RelationshipStatus {
    RelationshipStatus::Accepted
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            direct_path: default_direct_path(),
            random_path: default_random_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: 0,
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            directory_timeout_ms: default_directory_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway(),
            tokens: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let candidate = Path::new(expanded.as_ref());
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading configuration file");
                builder = builder.add_source(
                    ::config::File::from(candidate).format(::config::FileFormat::Toml),
                );
                break;
            }
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TANDEM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Build the switchboard settings.
    #[must_use]
    pub fn switchboard(&self) -> SwitchboardConfig {
        SwitchboardConfig {
            directory_timeout: Duration::from_millis(self.presence.directory_timeout_ms),
            heartbeat_timeout: (self.heartbeat.timeout_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat.timeout_ms)),
        }
    }

    /// Build the in-memory directory from `[directory]`.
    #[must_use]
    pub fn directory(&self) -> MemoryDirectory {
        let directory = MemoryDirectory::new();
        for user in &self.directory.users {
            directory.add_user(user.id, user.name.clone(), user.email.clone());
        }
        for contact in &self.directory.contacts {
            directory.add_relationship(contact.user, contact.friend, contact.status);
        }
        directory
    }
}
