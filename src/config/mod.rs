//! Broker configuration
//!
//! TOML file with `${VAR}` / `${VAR:-default}` substitution, overridable
//! through `STRATOMQ__`-prefixed environment variables (double underscore
//! separates nesting: `STRATOMQ__SERVER__BIND=0.0.0.0:1884`). Defaults
//! are usable without any file at all.
//!
//! On SIGHUP the reloadable subset (log level, limits) is re-read;
//! listener addresses, storage and cluster topology require a restart.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute `${VAR}` and `${VAR:-default}` in the raw file content.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration load/validation failure; exit code 1 territory.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Layer(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "parse error: {e}"),
            ConfigError::Layer(e) => write!(f, "config error: {e}"),
            ConfigError::Validation(msg) => write!(f, "validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Layer(e)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub cluster: Option<ClusterConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain TCP listener
    pub bind: SocketAddr,
    /// TLS listener (requires `tls`)
    pub tls_bind: Option<SocketAddr>,
    /// WebSocket listener
    pub ws_bind: Option<SocketAddr>,
    /// Secure WebSocket listener (requires `tls`)
    pub wss_bind: Option<SocketAddr>,
    pub ws_path: String,
    pub tls: Option<TlsSettings>,
    /// Seconds allowed for the graceful drain on SIGTERM
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().expect("static address"),
            tls_bind: None,
            ws_bind: None,
            wss_bind: None,
            ws_path: "/mqtt".to_string(),
            tls: None,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// TLS material locations.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsSettings {
    pub cert: String,
    pub key: String,
    pub ca_cert: Option<String>,
    pub require_client_cert: bool,
}

/// Resource limits. All reloadable on SIGHUP for new connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_packet_size: usize,
    /// Outbound QoS 1/2 window per client
    pub max_inflight: u16,
    /// Pending deliveries parked per attached client
    pub max_pending: usize,
    /// Offline queue entries per detached client (0 = unbounded)
    pub queue_quota: usize,
    /// Unreleased inbound QoS 2 publishes per client
    pub max_awaiting_rel: usize,
    /// Retransmit interval for unacked QoS 1/2
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Per-connection outbound channel depth
    pub outbound_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            max_inflight: 32,
            max_pending: 1000,
            queue_quota: 1000,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(30),
            outbound_channel_capacity: 1024,
        }
    }
}

/// Session behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Applied when a client sends keep-alive 0
    pub default_keep_alive: u16,
    /// Clamp; echoed via ServerKeepAlive when it bites
    pub max_keep_alive: u16,
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Inbound topic aliases we accept per connection
    pub max_topic_aliases: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 60,
            max_keep_alive: 65535,
            expiry_check_interval: Duration::from_secs(60),
            max_topic_aliases: 65535,
        }
    }
}

/// MQTT feature switches, advertised in the v5 CONNACK.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
    /// Our receive maximum, advertised to v5 clients
    pub receive_maximum: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
            receive_maximum: 65535,
        }
    }
}

/// Store selection and tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "fjall" (durable, default) or "memory"
    pub backend: String,
    pub path: PathBuf,
    /// Periodic purge of expired retained messages
    #[serde(with = "humantime_serde")]
    pub retained_sweep_interval: Duration,
    /// Record every routed envelope to the archive partition
    pub archive: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fjall".to_string(),
            path: PathBuf::from("./stratomq-data"),
            retained_sweep_interval: Duration::from_secs(60),
            archive: false,
        }
    }
}

/// Cluster membership and replication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Gossip cluster identity; nodes with different names ignore each other
    pub cluster_name: String,
    /// Stable node id; hostname when unset
    pub node_id: Option<String>,
    /// Gossip UDP bind address
    pub gossip_addr: SocketAddr,
    /// Address peers should gossip to (NAT / container setups)
    pub gossip_advertise: Option<SocketAddr>,
    /// Peer TCP bind address
    pub peer_addr: SocketAddr,
    pub peer_advertise: Option<SocketAddr>,
    /// Seed nodes, "host:gossip_port"
    pub seeds: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cluster_name: "stratomq".to_string(),
            node_id: None,
            gossip_addr: "0.0.0.0:7946".parse().expect("static address"),
            gossip_advertise: None,
            peer_addr: "0.0.0.0:7947".parse().expect("static address"),
            peer_advertise: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_millis(500),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

impl ClusterConfig {
    /// Stable node identity, falling back to the hostname.
    pub fn node_id(&self) -> String {
        if let Some(ref id) = self.node_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| format!("node-{}", std::process::id()))
    }

    pub fn gossip_advertise_addr(&self) -> SocketAddr {
        self.gossip_advertise.unwrap_or(self.gossip_addr)
    }

    pub fn peer_advertise_addr(&self) -> SocketAddr {
        self.peer_advertise.unwrap_or(self.peer_addr)
    }
}

impl Config {
    /// Load from a TOML file (may be absent), then env substitution, then
    /// `STRATOMQ__*` overrides, then validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let layered = builder
            .add_source(
                Environment::with_prefix("STRATOMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Env vars and defaults only; for containerized deployments.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse a TOML string directly (tests; no env layering).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "mqtt.max_qos must be 0, 1 or 2".to_string(),
            ));
        }
        if self.mqtt.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "mqtt.receive_maximum must be at least 1".to_string(),
            ));
        }
        match self.storage.backend.as_str() {
            "fjall" | "memory" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown storage backend '{other}' (expected \"fjall\" or \"memory\")"
                )))
            }
        }

        let needs_tls = self.server.tls_bind.is_some() || self.server.wss_bind.is_some();
        if needs_tls {
            match &self.server.tls {
                Some(tls) => {
                    if tls.cert.is_empty() || tls.key.is_empty() {
                        return Err(ConfigError::Validation(
                            "server.tls.cert and server.tls.key are required for TLS listeners"
                                .to_string(),
                        ));
                    }
                }
                None => {
                    return Err(ConfigError::Validation(
                        "server.tls is required when tls_bind or wss_bind is set".to_string(),
                    ))
                }
            }
        }

        if let Some(cluster) = &self.cluster {
            if cluster.enabled && cluster.cluster_name.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.cluster_name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
