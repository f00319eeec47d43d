use crate::cache::CacheConfig;
use crate::error::{GatewayError, Result};
use crate::rate_limit::types::{LimiterMode, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
/// (e.g. `GATEWAY__RATE_LIMIT__MODE=redis_lua`)
pub const ENV_PREFIX: &str = "GATEWAY";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-connection limits and keep-alive timings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Admission control configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Shared store; when absent counters and results stay in-process
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Message bus; when absent an in-process bus is used
    #[serde(default)]
    pub nats: Option<NatsConfig>,
    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Metrics endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upgrade endpoint path
    #[serde(default = "default_ws_path")]
    pub path: String,
}

/// Per-connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Largest inbound frame accepted
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Time allowed between inbound frames (pongs included)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Time allowed for a single outbound write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Keep-alive ping period, must be shorter than the read timeout
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

/// Redis deployment topology
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    #[default]
    Single,
    Sentinel,
    Cluster,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection topology
    #[serde(default)]
    pub mode: StoreMode,
    #[serde(default)]
    pub single: SingleNodeConfig,
    #[serde(default)]
    pub sentinel: SentinelConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Deadline applied to every store call, in milliseconds
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleNodeConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_master_name")]
    pub master_name: String,
    /// Sentinel addresses as `host:port`
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster seed addresses as `host:port`
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    /// Subject carrying inbound requests to workers
    #[serde(default = "default_subject_request")]
    pub subject_request: String,
    /// Subject carrying worker results back to the gateway
    #[serde(default = "default_subject_result")]
    pub subject_result: String,
    /// Queue group used by worker processes
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
    /// Connection name reported to the server
    #[serde(default = "default_nats_name")]
    pub name: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact format
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_message_bytes() -> usize {
    2048
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    50
}

fn default_op_timeout_ms() -> u64 {
    500
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_master_name() -> String {
    "mymaster".to_string()
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_subject_request() -> String {
    "translate.request".to_string()
}

fn default_subject_result() -> String {
    "translate.result".to_string()
}

fn default_queue_group() -> String {
    "translator-workers".to_string()
}

fn default_nats_name() -> String {
    "translate-gateway".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_ws_path(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            max_message_bytes: default_max_message_bytes(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for SingleNodeConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            master_name: default_master_name(),
            nodes: vec![],
            password: None,
            db: 0,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            single: SingleNodeConfig::default(),
            sentinel: SentinelConfig::default(),
            cluster: ClusterConfig::default(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Deadline for a single store call
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            subject_request: default_subject_request(),
            subject_result: default_subject_result(),
            queue_group: default_queue_group(),
            name: default_nats_name(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file layered with `GATEWAY__*` environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("rate_limit.whitelist"),
            )
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to read config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Subjects used on the bus, falling back to defaults without a NATS section
    pub fn subjects(&self) -> (String, String) {
        match &self.nats {
            Some(nats) => (nats.subject_request.clone(), nats.subject_result.clone()),
            None => (default_subject_request(), default_subject_result()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.server.path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Server path must start with '/': {}",
                self.server.path
            )));
        }

        if self.connection.outbound_queue == 0 {
            return Err(GatewayError::Config(
                "Outbound queue size must be > 0".to_string(),
            ));
        }

        if self.connection.ping_interval_secs == 0
            || self.connection.ping_interval_secs >= self.connection.read_timeout_secs
        {
            return Err(GatewayError::Config(
                "Ping interval must be > 0 and shorter than the read timeout".to_string(),
            ));
        }

        let limits = &self.rate_limit;
        if limits.limit == 0 {
            return Err(GatewayError::Config(
                "Rate limit must be > 0".to_string(),
            ));
        }
        if limits.window_ms == 0 {
            return Err(GatewayError::Config(
                "Rate limit window must be > 0".to_string(),
            ));
        }
        if limits.mode != LimiterMode::Memory && self.redis.is_none() {
            return Err(GatewayError::Config(format!(
                "Limiter mode '{}' requires a redis section",
                limits.mode
            )));
        }

        if let Some(redis) = &self.redis {
            match redis.mode {
                StoreMode::Single => {}
                StoreMode::Sentinel => {
                    if redis.sentinel.nodes.is_empty() || redis.sentinel.master_name.is_empty() {
                        return Err(GatewayError::Config(
                            "Sentinel mode requires master_name and at least one node".to_string(),
                        ));
                    }
                }
                StoreMode::Cluster => {
                    if redis.cluster.nodes.is_empty() {
                        return Err(GatewayError::Config(
                            "Cluster mode requires at least one node".to_string(),
                        ));
                    }
                }
            }
        }

        if let Some(nats) = &self.nats {
            if nats.subject_request.is_empty() || nats.subject_result.is_empty() {
                return Err(GatewayError::Config(
                    "NATS subjects cannot be empty".to_string(),
                ));
            }
            if nats.subject_request == nats.subject_result {
                return Err(GatewayError::Config(
                    "NATS request and result subjects must differ".to_string(),
                ));
            }
        }

        Ok(())
    }
}
