//! Configuration management
//!
//! YAML configuration with support for:
//! - Environment variable overrides
//! - Multiple configuration file locations
//! - Default values for all settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};

use crate::utils::validation::validate_country_code;
use crate::LIBRARY_ID;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub certificates: CertificatesConfig,
    #[serde(default)]
    #[validate(nested)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relation and expiry tracking settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CertificatesConfig {
    #[serde(default = "default_relation_name")]
    #[validate(length(min = 1))]
    pub relation_name: String,
    /// Hours before expiry at which requirers are warned
    #[serde(default = "default_expiry_notification_hours")]
    #[validate(range(min = 1))]
    pub expiry_notification_hours: i64,
    /// Track expiry with secret callbacks instead of periodic checks
    #[serde(default = "default_use_secrets")]
    pub use_secrets: bool,
    #[serde(default = "default_secret_label_prefix")]
    #[validate(length(min = 1))]
    pub secret_label_prefix: String,
}

impl CertificatesConfig {
    pub fn expiry_notification_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_notification_hours)
    }
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            relation_name: default_relation_name(),
            expiry_notification_hours: default_expiry_notification_hours(),
            use_secrets: default_use_secrets(),
            secret_label_prefix: default_secret_label_prefix(),
        }
    }
}

fn default_relation_name() -> String {
    "certificates".to_string()
}

fn default_expiry_notification_hours() -> i64 {
    168
}

fn default_use_secrets() -> bool {
    true
}

fn default_secret_label_prefix() -> String {
    LIBRARY_ID.to_string()
}

/// Defaults for generated keys, CAs and certificates
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct KeysConfig {
    #[serde(default = "default_key_size")]
    #[validate(range(min = 1024, max = 16384))]
    pub key_size: u32,
    /// Odd and at least 3
    #[serde(default = "default_public_exponent")]
    pub public_exponent: u32,
    #[serde(default = "default_validity_days")]
    #[validate(range(min = 1))]
    pub validity_days: u32,
    #[serde(default = "default_country")]
    #[validate(custom(function = "check_country"))]
    pub country: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            key_size: default_key_size(),
            public_exponent: default_public_exponent(),
            validity_days: default_validity_days(),
            country: default_country(),
        }
    }
}

fn default_key_size() -> u32 {
    crate::services::x509::DEFAULT_KEY_SIZE
}

fn default_public_exponent() -> u32 {
    crate::services::x509::DEFAULT_PUBLIC_EXPONENT
}

fn default_validity_days() -> u32 {
    crate::services::x509::DEFAULT_VALIDITY_DAYS
}

fn default_country() -> String {
    crate::services::x509::DEFAULT_COUNTRY.to_string()
}

fn check_country(country: &str) -> std::result::Result<(), ValidationError> {
    if validate_country_code(country) {
        Ok(())
    } else {
        Err(ValidationError::new("country"))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub target: LogTarget,
    /// Directory for log files (used when target is "file" or "both")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    #[serde(default = "default_log_rotation")]
    pub daily_rotation: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            daily_rotation: default_log_rotation(),
        }
    }
}

/// Log output target
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Console,
    File,
    Both,
}

/// Log line format
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/tls-certificates")
}

fn default_log_prefix() -> String {
    "tls-certificates".to_string()
}

fn default_log_rotation() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Default values
    /// 2. Configuration file (YAML)
    /// 3. Environment variables (prefixed with TLS_)
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config_path = std::env::var("TLS_CERTIFICATES_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(Self::find_config_file);

        let mut config = match config_path {
            Some(path) if path.exists() => Self::load_file(&path)?,
            Some(path) => {
                eprintln!("[CONFIG] Config file not found: {:?}, using defaults", path);
                AppConfig::default()
            }
            None => AppConfig::default(),
        };

        config.apply_env_overrides();
        config.check()?;
        Ok(config)
    }

    /// Load a single configuration file without environment overrides
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_norway::from_str(yaml)?;
        Ok(config)
    }

    /// Find the configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("tls-certificates.yaml"),
            PathBuf::from("config/tls-certificates.yaml"),
            PathBuf::from("/etc/tls-certificates/config.yaml"),
            dirs::config_dir()
                .map(|p| p.join("tls-certificates/config.yaml"))
                .unwrap_or_default(),
        ];

        paths.into_iter().find(|p| p.exists())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("TLS_RELATION_NAME") {
            self.certificates.relation_name = name;
        }
        if let Some(hours) = env_parse("TLS_EXPIRY_NOTIFICATION_HOURS") {
            self.certificates.expiry_notification_hours = hours;
        }
        if let Some(use_secrets) = env_parse("TLS_USE_SECRETS") {
            self.certificates.use_secrets = use_secrets;
        }
        if let Ok(prefix) = std::env::var("TLS_SECRET_LABEL_PREFIX") {
            self.certificates.secret_label_prefix = prefix;
        }

        if let Some(size) = env_parse("TLS_KEY_SIZE") {
            self.keys.key_size = size;
        }
        if let Some(days) = env_parse("TLS_VALIDITY_DAYS") {
            self.keys.validity_days = days;
        }
        if let Ok(country) = std::env::var("TLS_COUNTRY") {
            self.keys.country = country;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TLS_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => LogFormat::Pretty,
            };
        }
        if let Ok(target) = std::env::var("TLS_LOG_TARGET") {
            self.logging.target = match target.to_lowercase().as_str() {
                "file" => LogTarget::File,
                "both" => LogTarget::Both,
                _ => LogTarget::Console,
            };
        }
        if let Ok(dir) = std::env::var("TLS_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
    }

    /// Run field constraints and cross-field checks
    pub fn check(&self) -> Result<()> {
        self.validate().context("Invalid configuration")?;

        let exponent = self.keys.public_exponent;
        if exponent < 3 || exponent % 2 == 0 {
            anyhow::bail!("Public exponent must be odd and at least 3, got {}", exponent);
        }

        if self.logging.target != LogTarget::Console && self.logging.log_prefix.is_empty() {
            anyhow::bail!("Log file prefix cannot be empty when logging to files");
        }

        Ok(())
    }

    /// Create a default configuration file
    pub fn create_default_config(path: &Path) -> Result<()> {
        let config = AppConfig::default();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_norway::to_string(&config)?;
        std::fs::write(path, yaml)?;

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
