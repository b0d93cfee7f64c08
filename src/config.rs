//! Configuration system
//!
//! Provides centralized configuration management with:
//! - Config file loading (optional)
//! - Environment variable overrides
//! - Runtime defaults
//! - Validation before anything touches the network

use crate::auth::CredentialSource;
use crate::extractor::{ExtractorOptions, DEFAULT_PAGE_SIZE};
use crate::filter::IdentityFilter;
use crate::log_source::{ContinuationRetry, RetryPolicy, DEFAULT_NUM_RETRIES};
use crate::logging_api::DEFAULT_LOGGING_ENDPOINT;
use crate::timestamp_parser::TimestampParser;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Largest page the logging API accepts for `entries:list`.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// What to scan
    pub extractor: ExtractorConfig,

    /// Where credentials come from
    pub credentials: CredentialsConfig,

    /// Retry behaviour for log queries
    pub retry: RetryConfig,

    /// Logging API location
    pub api: ApiConfig,

    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub project_id: Option<String>,
    pub timestamp: Option<String>,
    pub page_size: u32,
    pub email_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub key_path: Option<PathBuf>,
    pub cred_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub num_retries: u32,
    pub delay_secs: u64,
    pub transport_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
            directory: PathBuf::from("logs"),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            timestamp: None,
            page_size: DEFAULT_PAGE_SIZE,
            email_pattern: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            num_retries: DEFAULT_NUM_RETRIES,
            delay_secs: 10,
            transport_backoff_ms: 500,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LOGGING_ENDPOINT.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file (explicit path or the first well-known one), then environment
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations()?,
        };

        // Override with environment variables
        config.apply_env_overrides()?;

        Ok(config)
    }

    fn load_from_default_locations() -> Result<Self> {
        let config_paths = [
            PathBuf::from("bq-table-usage.toml"),
            PathBuf::from(".bq-table-usage.toml"),
            dirs::config_dir()
                .map(|d| d.join("bq-table-usage").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Logging overrides
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }
        if let Ok(val) = env::var("BQ_USAGE_LOG_DIR") {
            self.logging.directory = PathBuf::from(val);
        }

        // Extractor overrides
        if let Ok(val) = env::var("BQ_USAGE_PROJECT_ID") {
            self.extractor.project_id = Some(val);
        }
        if let Ok(val) = env::var("BQ_USAGE_TIMESTAMP") {
            self.extractor.timestamp = Some(val);
        }
        if let Ok(val) = env::var("BQ_USAGE_PAGE_SIZE") {
            self.extractor.page_size = val.parse().context("Invalid BQ_USAGE_PAGE_SIZE")?;
        }
        if let Ok(val) = env::var("BQ_USAGE_EMAIL_PATTERN") {
            self.extractor.email_pattern = Some(val);
        }

        // Credential overrides
        if let Ok(val) = env::var("BQ_USAGE_KEY_PATH") {
            self.credentials.key_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("BQ_USAGE_CRED_JSON") {
            self.credentials.cred_json = Some(val);
        }

        // Retry overrides
        if let Ok(val) = env::var("BQ_USAGE_NUM_RETRIES") {
            self.retry.num_retries = val.parse().context("Invalid BQ_USAGE_NUM_RETRIES")?;
        }
        if let Ok(val) = env::var("BQ_USAGE_DELAY_SECS") {
            self.retry.delay_secs = val.parse().context("Invalid BQ_USAGE_DELAY_SECS")?;
        }

        if let Ok(val) = env::var("BQ_USAGE_LOGGING_ENDPOINT") {
            self.api.endpoint = val;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.extractor.project_id.as_deref() {
            Some(project_id) if !project_id.trim().is_empty() => {}
            _ => anyhow::bail!(
                "A project id is required (extractor.project_id, BQ_USAGE_PROJECT_ID or --project-id)"
            ),
        }

        if self.extractor.page_size == 0 || self.extractor.page_size > MAX_PAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE,
                self.extractor.page_size
            ));
        }

        if let Some(timestamp) = &self.extractor.timestamp {
            TimestampParser::parse(timestamp)?;
        }

        if let Some(pattern) = &self.extractor.email_pattern {
            IdentityFilter::new(pattern)?;
        }

        if self.credentials.key_path.is_some() && self.credentials.cred_json.is_some() {
            anyhow::bail!("Configure either a credential key path or inline credential JSON, not both");
        }

        if !matches!(self.logging.output.as_str(), "console" | "file" | "both") {
            anyhow::bail!(
                "Log output must be one of console, file or both, got {}",
                self.logging.output
            );
        }

        Ok(())
    }

    /// Log where the configuration came from and settings worth flagging.
    /// Call after logging is initialised.
    pub fn log_summary(&self) {
        match &self.source {
            Some(path) => info!(config_file = %path.display(), "Loaded configuration from file"),
            None => info!("No configuration file found, using defaults and environment"),
        }
        if self.retry.delay_secs == 0 {
            warn!("Page retry delay is zero, quota errors will be retried without pause");
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            num_retries: self.retry.num_retries,
            transport_backoff: Duration::from_millis(self.retry.transport_backoff_ms),
            continuation: ContinuationRetry::Forever {
                delay: Duration::from_secs(self.retry.delay_secs),
            },
        }
    }

    pub fn credential_source(&self) -> CredentialSource {
        if let Some(path) = &self.credentials.key_path {
            CredentialSource::KeyFile(path.clone())
        } else if let Some(json) = &self.credentials.cred_json {
            CredentialSource::Inline(json.clone())
        } else {
            CredentialSource::Default
        }
    }

    /// Build extractor options from a validated configuration
    pub fn to_extractor_options(&self) -> Result<ExtractorOptions> {
        let project_id = self
            .extractor
            .project_id
            .clone()
            .context("A project id is required")?;

        let mut options = ExtractorOptions::new(project_id)
            .with_page_size(self.extractor.page_size)
            .with_retry(self.retry_policy());

        if let Some(timestamp) = &self.extractor.timestamp {
            options = options.with_start(TimestampParser::parse(timestamp)?);
        }
        if let Some(pattern) = &self.extractor.email_pattern {
            options = options.with_identity_filter(IdentityFilter::new(pattern)?);
        }

        Ok(options)
    }
}
