use crate::network::DeviceClass;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the photo sync service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Kafka change feed configuration
    pub kafka: KafkaConfig,
    /// Upload queue configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Image compression configuration
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Polling fallback configuration
    #[serde(default)]
    pub polling: PollingConfig,
    /// Reconciliation windows
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Initial network conditions
    #[serde(default)]
    pub network: NetworkConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photo storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL objects are publicly served from
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Kafka change feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group prefix; each session gets its own group
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying row change notifications, keyed by business id
    #[serde(default = "default_change_topic")]
    pub change_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Subscribe handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Upload queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Fixed concurrency bound; adaptive (2-8) when unset
    pub max_concurrency: Option<usize>,
    /// Automatic retries per task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry failed transfers automatically
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    /// First retry delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Timeout for each network operation in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Completion notices buffered for slow sessions
    #[serde(default = "default_completion_buffer")]
    pub completion_buffer: usize,
}

/// Image compression configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Images at or below this size pass through untouched
    #[serde(default = "default_compression_threshold")]
    pub threshold_bytes: usize,
    /// Size the encoder tries to get under
    #[serde(default = "default_compression_target")]
    pub target_bytes: usize,
    /// Longest edge after downscaling, in pixels
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_initial_quality")]
    pub initial_quality: u8,
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,
    #[serde(default = "default_quality_step")]
    pub quality_step: u8,
}

/// Polling fallback configuration (seconds)
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Interval while the push channel is unhealthy
    #[serde(default = "default_active_interval_secs")]
    pub active_interval_secs: u64,
    /// Interval while the push channel is healthy
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,
    /// Interval while offline
    #[serde(default = "default_offline_interval_secs")]
    pub offline_interval_secs: u64,
    /// Lower bound for any computed interval
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

/// Reconciliation windows (seconds)
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// "Just confirmed" marker lifetime
    #[serde(default = "default_recently_added_secs")]
    pub recently_added_secs: u64,
    /// Protection of locally observed entries against stale snapshots
    #[serde(default = "default_local_protection_secs")]
    pub local_protection_secs: u64,
    /// How long a deleted id is kept from coming back
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,
    /// Sync bus capacity per session
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Sessions not accessed for this long are stopped
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

/// Initial network conditions; clients report updates through the API
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub device_class: DeviceClass,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "photo-sync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_consumer_group() -> String {
    "photo-sync".to_string()
}

fn default_change_topic() -> String {
    "facility_files.changes".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_handshake_timeout_ms() -> u64 {
    10000
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30000
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_completion_buffer() -> usize {
    256
}

fn default_compression_threshold() -> usize {
    1024 * 1024 // 1MB
}

fn default_compression_target() -> usize {
    500 * 1024
}

fn default_max_dimension() -> u32 {
    1920
}

fn default_initial_quality() -> u8 {
    85
}

fn default_min_quality() -> u8 {
    50
}

fn default_quality_step() -> u8 {
    10
}

fn default_active_interval_secs() -> u64 {
    15
}

fn default_backup_interval_secs() -> u64 {
    120
}

fn default_offline_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_min_interval_secs() -> u64 {
    3
}

fn default_recently_added_secs() -> u64 {
    5
}

fn default_local_protection_secs() -> u64 {
    300
}

fn default_tombstone_ttl_secs() -> u64 {
    600
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_session_idle_secs() -> u64 {
    900 // 15 minutes
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "photo-sync")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/photo-sync").required(false))
            .add_source(config::File::with_name("/etc/photo-sync/photo-sync").required(false))
            // Override with environment variables
            // PHOTO_SYNC__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("PHOTO_SYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl UploadConfig {
    /// Get per-operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn offline_interval(&self) -> Duration {
        Duration::from_secs(self.offline_interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            max_retries: default_max_retries(),
            auto_retry: true,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            completion_buffer: default_completion_buffer(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: default_compression_threshold(),
            target_bytes: default_compression_target(),
            max_dimension: default_max_dimension(),
            initial_quality: default_initial_quality(),
            min_quality: default_min_quality(),
            quality_step: default_quality_step(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_secs: default_active_interval_secs(),
            backup_interval_secs: default_backup_interval_secs(),
            offline_interval_secs: default_offline_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            recently_added_secs: default_recently_added_secs(),
            local_protection_secs: default_local_protection_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
            bus_capacity: default_bus_capacity(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl ReconcileConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Desktop,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
