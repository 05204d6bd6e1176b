use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the post-production service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// External media tool configuration
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Record processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
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

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying storage events for full narrations
    #[serde(default = "default_audio_topic")]
    pub audio_topic: String,
    /// Topic carrying storage events for narration previews (image pipeline)
    #[serde(default = "default_image_topic")]
    pub image_topic: String,
    /// Topic carrying storage events for rendered videos
    #[serde(default = "default_finalize_topic")]
    pub finalize_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds. Must exceed the batch timeout.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
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

/// External media tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Path to the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Upper bound for a single tool invocation in seconds
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of tool processes running at once
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,
}

/// Record processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Root directory for per-record staging directories
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    /// Length of the narration preview in seconds
    #[serde(default = "default_preview_duration_secs")]
    pub preview_duration_secs: u32,
    /// Length of the fade-out at the end of the preview in seconds
    #[serde(default = "default_fadeout_duration_secs")]
    pub fadeout_duration_secs: u32,
    /// Maximum number of article images fetched per record
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Records of one batch processed at the same time
    #[serde(default = "default_max_concurrent_records")]
    pub max_concurrent_records: usize,
    /// Time budget for a whole batch in seconds
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    /// Tool stages fail fast when less than this remains of the batch budget
    #[serde(default = "default_min_tool_budget_secs")]
    pub min_tool_budget_secs: u64,
}

/// API configuration for batch submission endpoint
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
}

// Default value functions
fn default_service_name() -> String {
    "postprod-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "postprod-service".to_string()
}

fn default_audio_topic() -> String {
    "postprod.storage.audio".to_string()
}

fn default_image_topic() -> String {
    "postprod.storage.images".to_string()
}

fn default_finalize_topic() -> String {
    "postprod.storage.video".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    1_200_000
}

fn default_region() -> String {
    "us-east-1".to_string()
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

fn default_true() -> bool {
    true
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("./bin/ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("./bin/ffprobe")
}

fn default_tool_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_invocations() -> usize {
    2
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_preview_duration_secs() -> u32 {
    30
}

fn default_fadeout_duration_secs() -> u32 {
    3
}

fn default_max_images() -> usize {
    4
}

fn default_max_concurrent_records() -> usize {
    4
}

fn default_batch_timeout_secs() -> u64 {
    900 // 15 minutes
}

fn default_min_tool_budget_secs() -> u64 {
    10
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
            .set_default("service.name", "postprod-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/postprod").required(false))
            .add_source(config::File::with_name("/etc/postprod/postprod").required(false))
            // Override with environment variables
            // POSTPROD__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("POSTPROD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl ToolsConfig {
    /// Upper bound for one tool invocation
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ProcessingConfig {
    /// Time budget for a whole batch
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    /// Minimum remaining budget required to start a tool stage
    pub fn min_tool_budget(&self) -> Duration {
        Duration::from_secs(self.min_tool_budget_secs)
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

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_tool_timeout_secs(),
            max_concurrent_invocations: default_max_concurrent_invocations(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            preview_duration_secs: default_preview_duration_secs(),
            fadeout_duration_secs: default_fadeout_duration_secs(),
            max_images: default_max_images(),
            max_concurrent_records: default_max_concurrent_records(),
            batch_timeout_secs: default_batch_timeout_secs(),
            min_tool_budget_secs: default_min_tool_budget_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
        }
    }
}
