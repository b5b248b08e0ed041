use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Smallest random suffix that still gives ~41 bits of entropy over `[0-9a-z]`
pub const MIN_RANDOM_ID_LEN: usize = 8;

/// Configuration validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("uploads.random_id_len must be at least {min}, got {actual}")]
    RandomIdTooShort { min: usize, actual: usize },

    #[error("uploads.max_payload_bytes must be greater than zero")]
    ZeroPayloadLimit,

    #[error("uploads.{field} must not be empty")]
    Empty { field: &'static str },

    #[error("uploads.{field} contains invalid characters: {value}")]
    InvalidCharacters { field: &'static str, value: String },
}

/// Main configuration for the album service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upload key and payload configuration
    #[serde(default)]
    pub uploads: UploadConfig,
    /// Upload client configuration
    #[serde(default)]
    pub client: ClientConfig,
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
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// API configuration for the issue/store endpoints
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

/// Storage key and payload settings
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Leading path segment of every storage key
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// File extension appended to every storage key
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Length of the random part of a storage key
    #[serde(default = "default_random_id_len")]
    pub random_id_len: usize,
    /// Largest accepted upload body
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Content type recorded when a PUT carries none
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

/// Settings for the upload orchestrator
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the album service
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout applied to each request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long a finished upload stays displayed before returning to idle
    #[serde(default = "default_display_delay_ms")]
    pub display_delay_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "album-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
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

fn default_namespace() -> String {
    "wedding-uploads".to_string()
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_random_id_len() -> usize {
    13
}

fn default_max_payload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_content_type() -> String {
    "image/jpeg".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_display_delay_ms() -> u64 {
    3000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/album").required(false))
            .add_source(config::File::with_name("/etc/album/album").required(false))
            // Override with environment variables
            // ALBUM__API__PORT -> api.port
            .add_source(
                config::Environment::with_prefix("ALBUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the deserializer cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uploads = &self.uploads;

        if uploads.random_id_len < MIN_RANDOM_ID_LEN {
            return Err(ConfigError::RandomIdTooShort {
                min: MIN_RANDOM_ID_LEN,
                actual: uploads.random_id_len,
            });
        }
        if uploads.max_payload_bytes == 0 {
            return Err(ConfigError::ZeroPayloadLimit);
        }

        check_component("namespace", &uploads.namespace, true)?;
        check_component("extension", &uploads.extension, false)?;

        Ok(())
    }

    /// Get the post-upload display delay as Duration
    pub fn display_delay(&self) -> Duration {
        Duration::from_millis(self.client.display_delay_ms)
    }
}

fn check_component(field: &'static str, value: &str, allow_slash: bool) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Empty { field });
    }

    let valid = value.chars().all(|c| match c {
        'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => true,
        '/' => allow_slash,
        _ => false,
    });
    if !valid || value.starts_with('/') || value.ends_with('/') {
        return Err(ConfigError::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
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

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            extension: default_extension(),
            random_id_len: default_random_id_len(),
            max_payload_bytes: default_max_payload_bytes(),
            default_content_type: default_content_type(),
        }
    }
}

impl ClientConfig {
    /// Get the per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            display_delay_ms: default_display_delay_ms(),
        }
    }
}
