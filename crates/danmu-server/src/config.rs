//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (DANMU_HOST, DANMU_PORT, DANMU_JWT_SECRET)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use danmu_core::{ContentLimits, PersistencePolicy, PipelineConfig, Principal, RelayConfig};
use danmu_protocol::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

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

    /// Outbound delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Credential configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Storage policy.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint; room and connection ids
    /// follow as two path segments.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound WebSocket message size in bytes. Must exceed the
    /// protocol frame limit so oversized danmu are answered, not dropped
    /// with the connection.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum danmu length in characters.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Largest accepted font size.
    #[serde(default = "default_max_fontsize")]
    pub max_fontsize: u32,

    /// Frames queued per connection before new ones are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How long a single socket write may take before the connection is
    /// dropped.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Sessions to load into the session cache at startup.
    #[serde(default)]
    pub principals: Vec<Principal>,
}

/// Storage policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Refuse to broadcast a danmu that could not be stored.
    #[serde(default = "default_true")]
    pub require_stored: bool,
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

// Default value functions
fn default_host() -> String {
    std::env::var("DANMU_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("DANMU_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_jwt_secret() -> String {
    std::env::var("DANMU_JWT_SECRET").unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws/danmu".to_string()
}

fn default_max_message_size() -> usize {
    2 * MAX_FRAME_SIZE // 128 KB
}

fn default_max_content_chars() -> usize {
    ContentLimits::default().max_content_chars
}

fn default_max_fontsize() -> u32 {
    ContentLimits::default().max_fontsize
}

fn default_outbound_queue() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    5_000 // 5 seconds
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
            delivery: DeliveryConfig::default(),
            auth: AuthConfig::default(),
            persistence: PersistenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_content_chars: default_max_content_chars(),
            max_fontsize: default_max_fontsize(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            principals: Vec::new(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            require_stored: true,
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "danmu.toml",
            "/etc/danmu/danmu.toml",
            "~/.config/danmu/danmu.toml",
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

    /// Check settings that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWT secret is empty, the transport message
    /// limit does not exceed the frame limit, or the WebSocket path is not
    /// absolute.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret is empty; set it in danmu.toml or DANMU_JWT_SECRET");
        }
        if self.limits.max_message_size <= MAX_FRAME_SIZE {
            bail!(
                "limits.max_message_size must exceed the {} byte frame limit: {}",
                MAX_FRAME_SIZE,
                self.limits.max_message_size
            );
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Route of the WebSocket endpoint, including its path parameters.
    #[must_use]
    pub fn websocket_route(&self) -> String {
        format!(
            "{}/:room/:conn",
            self.transport.websocket_path.trim_end_matches('/')
        )
    }

    /// Per-write timeout for outbound frames.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.send_timeout_ms)
    }

    /// Relay settings derived from this configuration.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        let policy = if self.persistence.require_stored {
            PersistencePolicy::RequireStored
        } else {
            PersistencePolicy::BestEffort
        };

        RelayConfig {
            outbound_capacity: self.limits.outbound_queue,
            pipeline: PipelineConfig {
                policy,
                limits: ContentLimits {
                    max_content_chars: self.limits.max_content_chars,
                    max_fontsize: self.limits.max_fontsize,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws/danmu");
        assert_eq!(config.limits.max_content_chars, 100);
        assert_eq!(config.delivery.send_timeout_ms, 5_000);
        assert!(config.persistence.require_stored);
        assert!(config.auth.principals.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_content_chars = 40

            [auth]
            jwt_secret = "s3cret"

            [[auth.principals]]
            id = 7
            role = "user"
            nickname = "alice"

            [persistence]
            require_stored = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_content_chars, 40);
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.auth.principals.len(), 1);
        assert_eq!(config.auth.principals[0].nickname.as_deref(), Some("alice"));
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr().unwrap().port(), 9000);

        let relay = config.relay_config();
        assert_eq!(relay.pipeline.policy, PersistencePolicy::BestEffort);
        assert_eq!(relay.pipeline.limits.max_content_chars, 40);
    }

    #[test]
    fn test_validate_requires_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = String::new();
        assert!(config.validate().is_err());

        config.auth.jwt_secret = "s3cret".into();
        assert!(config.validate().is_ok());

        config.transport.websocket_path = "ws".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_message_limit_exceeds_frame_limit() {
        let mut config = Config::default();
        config.auth.jwt_secret = "s3cret".into();
        assert!(config.limits.max_message_size > MAX_FRAME_SIZE);
        assert!(config.validate().is_ok());

        config.limits.max_message_size = 16 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_websocket_route() {
        let mut config = Config::default();
        assert_eq!(config.websocket_route(), "/ws/danmu/:room/:conn");

        config.transport.websocket_path = "/live/".into();
        assert_eq!(config.websocket_route(), "/live/:room/:conn");
    }
}
