//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PARLEY_*)
//! - TOML configuration file

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use parley_core::{Channel, Identity, MemoryStore, RouterConfig};
use parley_protocol::UserId;
use serde::{Deserialize, Serialize};

/// Secret used when neither the config file nor the environment set one.
pub const DEV_JWT_SECRET: &str = "parley-dev-secret";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Users and channels loaded into the in-memory store at startup.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum size of one inbound frame in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message content length in characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Attempts per reaction or read-marker write before giving up.
    #[serde(default = "default_mutation_attempts")]
    pub mutation_attempts: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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

/// Token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

/// Seed data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<SeedUser>,

    #[serde(default)]
    pub channels: Vec<SeedChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: String,
    /// Members besides the creator.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub is_private: bool,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_jwt_secret() -> String {
    std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.to_string())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    parley_protocol::codec::MAX_FRAME_SIZE
}

fn default_max_rooms() -> usize {
    parley_core::rooms::DEFAULT_MAX_ROOMS_PER_CONNECTION
}

fn default_max_content_length() -> usize {
    parley_core::router::DEFAULT_MAX_CONTENT_LENGTH
}

fn default_mutation_attempts() -> usize {
    parley_core::mutation::DEFAULT_MUTATION_ATTEMPTS
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: default_max_rooms(),
            max_content_length: default_max_content_length(),
            mutation_attempts: default_mutation_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl LimitsConfig {
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_rooms_per_connection: self.max_rooms_per_connection,
            max_content_length: self.max_content_length,
            mutation_attempts: self.mutation_attempts,
        }
    }
}

impl SeedConfig {
    /// Load the seed users and channels into `store`.
    pub fn apply(&self, store: &MemoryStore) {
        for user in &self.users {
            store.insert_user(Identity {
                id: UserId::new(&user.id),
                username: user.username.clone(),
                email: user.email.clone(),
            });
        }

        for seed in &self.channels {
            let mut channel = Channel::new(
                seed.id.as_str(),
                seed.name.clone(),
                UserId::new(&seed.created_by),
            );
            if let Some(description) = &seed.description {
                channel = channel.with_description(description.clone());
            }
            if seed.is_private {
                channel = channel.private();
            }
            let created_at = channel.created_at;
            for member in &seed.members {
                channel.add_member(&UserId::new(member), created_at);
            }
            store.insert_channel(channel);
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
