//! Configuration management for Conduit.
//!
//! This module provides the configuration system for connection managers,
//! their pools, the association cache and the broker client. It supports:
//! - Loading from YAML files
//! - Environment variable overrides (`CONDUIT__*`)
//! - Validation of pool sizes and resource names

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use conduit_core::config::AppConfig;
///
/// let config = AppConfig::from_file("conduit.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Connection managers, one per resource
    #[serde(default)]
    pub managers: Vec<ConnectionManagerConfig>,

    /// Connection association cache settings
    #[serde(default)]
    pub association: AssociationCacheConfig,

    /// Broker client settings
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering
    /// `CONDUIT__*` environment variables over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("CONDUIT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// Checks for:
    /// - No duplicate resource names
    /// - Valid pool sizing for every manager
    /// - A parseable log level
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for manager in &self.managers {
            if !seen.insert(manager.resource_name.as_str()) {
                return Err(ConfigError::DuplicateResourceName {
                    name: manager.resource_name.clone(),
                }
                .into());
            }
            manager.validate()?;
        }

        self.logging.parse_level()?;

        Ok(())
    }

    /// Gets a manager configuration by resource name.
    pub fn get_manager(&self, resource_name: &str) -> Option<&ConnectionManagerConfig> {
        self.managers
            .iter()
            .find(|m| m.resource_name == resource_name)
    }
}

// ============================================================================
// Connection managers
// ============================================================================

/// Transaction support level of a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSupport {
    /// Connections never take part in transactions
    #[default]
    None,
    /// Local transactions bridged as a single XA resource
    Local,
    /// Full XA enlistment
    Xa,
}

impl TransactionSupport {
    /// Returns true if connections of this manager are enlisted in transactions.
    pub fn is_transactional(&self) -> bool {
        !matches!(self, TransactionSupport::None)
    }
}

/// How connection requests are split across sub-pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// One sub-pool per (principal, criteria) pair
    ByPrincipalAndCriteria,
    /// One sub-pool per principal
    ByPrincipal,
    /// One sub-pool per request criteria
    ByCriteria,
    /// A single shared sub-pool
    #[default]
    Single,
}

/// Configuration of one connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionManagerConfig {
    /// Resource name (unique)
    pub resource_name: String,

    /// Transaction support level
    #[serde(default)]
    pub transaction_support: TransactionSupport,

    /// Reuse one connection for every allocation within a transaction
    #[serde(default)]
    pub track_connection_by_tx: bool,

    /// Extra checkout attempts after a blocking timeout
    #[serde(default)]
    pub allocation_retry: u32,

    /// Wait between checkout attempts in milliseconds
    #[serde(default = "default_allocation_retry_wait")]
    pub allocation_retry_wait_ms: u64,

    /// Sub-pool partitioning
    #[serde(default)]
    pub partition: PartitionStrategy,

    /// Keep transactional and non-transactional connections apart
    #[serde(default)]
    pub separate_transactional_pools: bool,

    /// Pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_allocation_retry_wait() -> u64 {
    5000
}

impl ConnectionManagerConfig {
    /// Creates a manager configuration with default settings.
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            transaction_support: TransactionSupport::default(),
            track_connection_by_tx: false,
            allocation_retry: 0,
            allocation_retry_wait_ms: default_allocation_retry_wait(),
            partition: PartitionStrategy::default(),
            separate_transactional_pools: false,
            pool: PoolConfig::default(),
        }
    }

    /// Returns the wait between allocation attempts as a Duration.
    pub fn allocation_retry_wait(&self) -> Duration {
        Duration::from_millis(self.allocation_retry_wait_ms)
    }

    /// Validates the manager configuration.
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.is_empty() {
            return Err(ConfigError::invalid_value("resource_name", "cannot be empty").into());
        }
        if self.track_connection_by_tx && !self.transaction_support.is_transactional() {
            return Err(ConfigError::invalid_value(
                format!("{}.track_connection_by_tx", self.resource_name),
                "requires local or xa transaction support",
            )
            .into());
        }
        self.pool
            .validate()
            .map_err(|e| ConfigError::invalid_value(format!("{}.pool", self.resource_name), e))?;
        Ok(())
    }
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open at all times
    #[serde(default)]
    pub min_size: usize,

    /// Upper bound on connections, idle and in use
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// How long a checkout waits for a connection in milliseconds
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout_ms: u64,

    /// Idle time after which a connection is evicted in milliseconds (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Fill new sub-pools to `min_size` as soon as they are created
    #[serde(default)]
    pub prefill: bool,

    /// Never evict below `min_size`
    #[serde(default)]
    pub strict_min: bool,

    /// Skip remaining idle connections when the match predicate errors
    #[serde(default)]
    pub use_fast_fail: bool,
}

fn default_max_size() -> usize {
    20
}

fn default_blocking_timeout() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    15 * 60 * 1000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            blocking_timeout_ms: default_blocking_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            prefill: false,
            strict_min: false,
            use_fast_fail: false,
        }
    }
}

impl PoolConfig {
    /// Returns the checkout blocking timeout as a Duration.
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    /// Returns the idle timeout, or `None` when eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.idle_timeout_ms))
        }
    }

    /// Validates the pool configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".to_string());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Association cache
// ============================================================================

/// Connection association cache settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssociationCacheConfig {
    /// Disconnect on context exit and reconnect on re-entry
    #[serde(default)]
    pub spec_compliant: bool,

    /// Close connections left open when a context exits
    #[serde(default)]
    pub debug: bool,
}

// ============================================================================
// Broker
// ============================================================================

/// Session acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge every message on delivery
    #[default]
    Auto,
    /// The application acknowledges explicitly
    Client,
    /// Lazy acknowledgement, duplicates tolerated
    DupsOk,
    /// Acknowledgements are part of the session's local transaction
    Transacted,
}

/// Broker client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Default acknowledgement mode for new sessions
    #[serde(default)]
    pub ack_mode: AckMode,

    /// Create XA sessions
    #[serde(default)]
    pub xa: bool,

    /// Timeout for requests to the broker in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_client_id() -> String {
    "conduit".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            ack_mode: AckMode::default(),
            xa: false,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl BrokerConfig {
    /// Returns the broker request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// Logging and metrics
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Optional log file path
    pub file: Option<PathBuf>,

    /// Whether to include file/line info
    #[serde(default)]
    pub file_line: bool,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file: None,
            file_line: false,
            module_levels: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }

    /// Builds an env-filter directive string from the level and module levels.
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.clone()];
        let mut modules: Vec<_> = self.module_levels.iter().collect();
        modules.sort();
        for (module, level) in modules {
            directives.push(format!("{}={}", module, level));
        }
        directives.join(",")
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConduitError;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.managers.is_empty());
        assert!(!config.association.spec_compliant);
        assert_eq!(config.broker.client_id, "conduit");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.min_size, 0);
        assert_eq!(pool.max_size, 20);
        assert_eq!(pool.blocking_timeout(), Duration::from_secs(30));
        assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_idle_timeout_zero_disables_eviction() {
        let pool = PoolConfig {
            idle_timeout_ms: 0,
            ..Default::default()
        };
        assert!(pool.idle_timeout().is_none());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
logging:
  level: debug
  format: json

managers:
  - resource_name: jdbc/orders
    transaction_support: xa
    track_connection_by_tx: true
    partition: by_principal_and_criteria
    pool:
      min_size: 2
      max_size: 10
      blocking_timeout_ms: 500
      prefill: true

association:
  spec_compliant: true

broker:
  client_id: orders-service
  ack_mode: client
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.managers.len(), 1);

        let orders = config.get_manager("jdbc/orders").unwrap();
        assert_eq!(orders.transaction_support, TransactionSupport::Xa);
        assert_eq!(orders.partition, PartitionStrategy::ByPrincipalAndCriteria);
        assert_eq!(orders.pool.max_size, 10);
        assert_eq!(orders.pool.blocking_timeout(), Duration::from_millis(500));
        assert!(orders.pool.prefill);
        assert_eq!(orders.allocation_retry_wait(), Duration::from_secs(5));

        assert!(config.association.spec_compliant);
        assert_eq!(config.broker.ack_mode, AckMode::Client);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_duplicate_names() {
        let mut config = AppConfig::default();
        config.managers.push(ConnectionManagerConfig::new("jms/queue"));
        config.managers.push(ConnectionManagerConfig::new("jms/queue"));

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConduitError::Config(ConfigError::DuplicateResourceName { .. })
        ));
    }

    #[test]
    fn test_validation_pool_sizes() {
        let mut manager = ConnectionManagerConfig::new("jdbc/a");
        manager.pool.min_size = 5;
        manager.pool.max_size = 2;
        assert!(manager.validate().is_err());

        manager.pool.min_size = 0;
        manager.pool.max_size = 0;
        assert!(manager.validate().is_err());
    }

    #[test]
    fn test_track_by_tx_requires_transactions() {
        let mut manager = ConnectionManagerConfig::new("jdbc/a");
        manager.track_connection_by_tx = true;
        assert!(manager.validate().is_err());

        manager.transaction_support = TransactionSupport::Local;
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_logging_parse_level() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert!(logging.parse_level().is_ok());

        let invalid = LoggingConfig {
            level: "invalid".to_string(),
            ..Default::default()
        };
        assert!(invalid.parse_level().is_err());
    }

    #[test]
    fn test_filter_directives() {
        let mut logging = LoggingConfig::default();
        logging
            .module_levels
            .insert("conduit_pool".to_string(), "trace".to_string());
        assert_eq!(logging.filter_directives(), "info,conduit_pool=trace");
    }
}
