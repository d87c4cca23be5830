use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Main configuration for the detection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Detection backend configuration
    #[serde(default)]
    pub backend: BackendConfig,
    /// Upload storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
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
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Detection backend (model service) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Full URL of the detect endpoint
    #[serde(default = "default_backend_endpoint")]
    pub endpoint: String,
    /// Per-attempt request timeout in seconds
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs_backend")]
    pub connect_timeout_secs: u64,
    /// Maximum attempts per detection run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds (grows linearly)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Local upload storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding uploaded images
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    /// Subdirectory of the upload root for annotated artifacts
    #[serde(default = "default_annotated_dir")]
    pub annotated_dir: String,
    /// Public URL prefix the upload root is served under
    #[serde(default = "default_public_url_prefix")]
    pub public_url_prefix: String,
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
    "detection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    false
}

fn default_backend_endpoint() -> String {
    "http://yolo:8000/detect".to_string()
}

fn default_backend_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs_backend() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("storage/uploads")
}

fn default_annotated_dir() -> String {
    "annotated".to_string()
}

fn default_public_url_prefix() -> String {
    "/uploads".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3300
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "detection-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/detection").required(false))
            .add_source(config::File::with_name("/etc/detection/detection").required(false))
            // DETECTION__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("DETECTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints the deserializer cannot express
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.backend.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField("backend.endpoint".to_string()));
        }

        if !self.backend.endpoint.starts_with("http://")
            && !self.backend.endpoint.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "backend.endpoint".to_string(),
                message: "must be an http:// or https:// URL".to_string(),
            });
        }

        if self.backend.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "backend.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.storage.upload_root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("storage.upload_root".to_string()));
        }

        let annotated = Path::new(&self.storage.annotated_dir);
        if self.storage.annotated_dir.is_empty()
            || !annotated.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.annotated_dir".to_string(),
                message: "must be a relative path below the upload root".to_string(),
            });
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
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

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_backend_endpoint(),
            timeout_secs: default_backend_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs_backend(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            annotated_dir: default_annotated_dir(),
            public_url_prefix: default_public_url_prefix(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/detections".to_string(),
                max_connections: 5,
                min_connections: 1,
                connect_timeout_secs: 30,
                idle_timeout_secs: 600,
                run_migrations: false,
            },
            backend: BackendConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        let backend = BackendConfig::default();
        assert_eq!(backend.timeout(), Duration::from_secs(120));
        assert_eq!(backend.max_attempts, 3);
        assert_eq!(backend.retry_base_delay(), Duration::from_secs(1));

        let storage = StorageConfig::default();
        assert_eq!(storage.annotated_dir, "annotated");
        assert_eq!(storage.public_url_prefix, "/uploads");
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_missing_database_url() {
        let mut config = create_test_config();
        config.database.url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_non_http_endpoint() {
        let mut config = create_test_config();
        config.backend.endpoint = "grpc://yolo:8000".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_attempts() {
        let mut config = create_test_config();
        config.backend.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_annotated_dir_must_stay_below_root() {
        let mut config = create_test_config();
        config.storage.annotated_dir = "../outside".to_string();
        assert!(config.validate().is_err());

        config.storage.annotated_dir = "/tmp/annotated".to_string();
        assert!(config.validate().is_err());

        config.storage.annotated_dir = "artifacts/annotated".to_string();
        assert!(config.validate().is_ok());
    }
}
