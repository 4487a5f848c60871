//! Broker configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTOMP_CONFIG or --config)
//! 3. Environment variables

use rstomp_protocol::{DEFAULT_PORT, DEFAULT_WEBSOCKET_PORT, MAX_BODY_SIZE, MAX_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Buffer pool configuration.
    pub buffers: BufferConfig,
    /// Frame size limits.
    pub protocol: ProtocolConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSTOMP_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.buffers.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads credentials from the external secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffers.validate()?;
        self.tls.validate()?;
        if self.network.outbound_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "network.outbound_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.auth.required && self.auth.users.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth required but no users configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address for plain (or TLS) STOMP connections.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Address for STOMP over WebSocket. Disabled when unset.
    #[serde(with = "opt_socket_addr_serde")]
    pub websocket_bind_addr: Option<SocketAddr>,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Heart-beat interval the broker offers, in milliseconds (0 = none).
    pub heartbeat_ms: u64,
    /// MESSAGE frames buffered per connection before queues hold back.
    pub outbound_queue_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            websocket_bind_addr: Some(SocketAddr::from((
                Ipv4Addr::LOCALHOST,
                DEFAULT_WEBSOCKET_PORT,
            ))),
            idle_timeout_secs: 300,
            max_connections: 1000,
            heartbeat_ms: 10_000,
            outbound_queue_size: 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RSTOMP_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("RSTOMP_WS_BIND") {
            if addr.is_empty() || addr == "off" {
                self.websocket_bind_addr = None;
            } else if let Ok(parsed) = addr.parse() {
                self.websocket_bind_addr = Some(parsed);
            }
        }

        if let Ok(timeout) = std::env::var("RSTOMP_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("RSTOMP_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(hb) = std::env::var("RSTOMP_HEARTBEAT_MS") {
            if let Ok(ms) = hb.parse() {
                self.heartbeat_ms = ms;
            }
        }

        if let Ok(size) = std::env::var("RSTOMP_OUTBOUND_QUEUE_SIZE") {
            if let Ok(n) = size.parse() {
                self.outbound_queue_size = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of each pooled buffer in bytes.
    pub buffer_size: usize,
    /// Buffers allocated up front.
    pub preallocated: usize,
    /// Outstanding bytes above which checkouts fail (0 = unlimited).
    pub pain_threshold: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            preallocated: 64,
            pain_threshold: 256 * 1024 * 1024,
        }
    }
}

impl BufferConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("RSTOMP_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.buffer_size = n;
            }
        }

        if let Ok(count) = std::env::var("RSTOMP_BUFFER_PREALLOCATED") {
            if let Ok(n) = count.parse() {
                self.preallocated = n;
            }
        }

        if let Ok(threshold) = std::env::var("RSTOMP_BUFFER_PAIN_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.pain_threshold = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffers.buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.pain_threshold != 0 && self.pain_threshold < self.buffer_size {
            return Err(ConfigError::ValidationError(
                "buffers.pain_threshold is smaller than one buffer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Frame size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Maximum size of a frame's command line plus headers.
    pub max_header_size: usize,
    /// Maximum frame body size.
    pub max_body_size: usize,
    /// Payload size above which outbound WebSocket messages are fragmented.
    pub websocket_fragment_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_header_size: MAX_HEADER_SIZE,
            max_body_size: MAX_BODY_SIZE,
            websocket_fragment_size: 64 * 1024,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("RSTOMP_MAX_HEADER_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_header_size = n;
            }
        }

        if let Ok(size) = std::env::var("RSTOMP_MAX_BODY_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_body_size = n;
            }
        }

        if let Ok(size) = std::env::var("RSTOMP_WS_FRAGMENT_SIZE") {
            if let Ok(n) = size.parse() {
                self.websocket_fragment_size = n;
            }
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether CONNECT must carry valid credentials.
    pub required: bool,
    /// Login name to SHA-256 passcode hash (hex).
    /// Generate hashes with: `rstomp-cli hash-password <passcode>`
    pub users: BTreeMap<String, String>,
    /// Optional file of `login:hash` lines merged into `users`.
    pub secrets_file: Option<PathBuf>,
    /// Failed CONNECT attempts before the connection is closed.
    pub max_failed_logins: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: false,
            users: BTreeMap::new(),
            secrets_file: None,
            max_failed_logins: 5,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(auth) = std::env::var("RSTOMP_AUTH_REQUIRED") {
            self.required = env_flag(&auth);
        }

        // RSTOMP_AUTH_USER=login:sha256hex
        if let Ok(entry) = std::env::var("RSTOMP_AUTH_USER") {
            if let Some((login, hash)) = entry.split_once(':') {
                if !login.is_empty() && !hash.is_empty() {
                    self.users.insert(login.to_string(), hash.to_string());
                }
            }
        }

        if let Ok(path) = std::env::var("RSTOMP_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }

        if let Ok(max) = std::env::var("RSTOMP_AUTH_MAX_FAILED_LOGINS") {
            if let Ok(n) = max.parse() {
                self.max_failed_logins = n;
            }
        }
    }

    /// Merges `login:hash` lines from the secrets file into `users`.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for (lineno, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.split_once(':') {
                    Some((login, hash)) if !login.is_empty() && !hash.is_empty() => {
                        self.users
                            .insert(login.trim().to_string(), hash.trim().to_string());
                    }
                    _ => {
                        return Err(ConfigError::ParseError(
                            path.clone(),
                            format!("line {}: expected login:hash", lineno + 1),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns whether authentication is effectively disabled.
    pub fn is_disabled(&self) -> bool {
        !self.required
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve the STOMP listener over TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// CA certificate(s) for verifying client certs. Required with mTLS.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RSTOMP_TLS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("RSTOMP_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = env_flag(&require);
        }
        if let Ok(path) = std::env::var("RSTOMP_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RSTOMP_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("RSTOMP_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Addresses are strings in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_some(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
