//! Configuration module for pandrive.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, saving, validation, defaults, and a builder pattern for
//! programmatic use. Every section carries serde defaults, so a partial file
//! (or an empty one) is a valid configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::{ChunkSizing, KIB, MIB};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for pandrive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub pacer: PacerConfig,
    pub retry: RetryConfig,
    pub upload: UploadConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
    pub logging: LoggingConfig,
}

/// Provider endpoints and HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the file API.
    pub base_url: String,
    /// Base URL of the passport (token) service.
    pub passport_url: String,
    /// Base URL of the QR login status service.
    pub qrcode_url: String,
    /// User-Agent sent with every request, downloads included.
    pub user_agent: String,
    /// Per-call timeout in seconds.
    pub call_timeout_secs: u64,
}

/// Where the credential is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStoreKind {
    /// OS keyring (secret service, keychain)
    Keyring,
    /// YAML file next to the configuration
    File,
}

/// Device-code login and token lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application client id. `None` until the user configures one.
    pub client_id: Option<String>,
    /// Refresh this many seconds before the access token expires.
    pub refresh_window_secs: u64,
    /// Seconds between login status polls.
    pub poll_interval_secs: u64,
    /// Give up on a pending device login after this many seconds.
    pub login_timeout_secs: u64,
    /// Longest a caller waits for another task's refresh to finish.
    pub refresh_wait_secs: u64,
    /// Credential persistence backend.
    pub credential_store: CredentialStoreKind,
    /// Credential file used by the `file` backend.
    pub credential_file: PathBuf,
}

/// Shared request pacer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Floor of the inter-call delay in milliseconds.
    pub min_sleep_ms: u64,
    /// Ceiling of the inter-call delay in milliseconds.
    pub max_sleep_ms: u64,
    /// Decay speed on success: `sleep * (2^d - 1) / 2^d`.
    pub decay_constant: u32,
    /// Growth speed on retry: `sleep * 2^a / (2^a - 1)`; 0 jumps to max.
    pub attack_constant: u32,
    /// Cooldown after the provider's account-level throttle code, in milliseconds.
    pub throttle_cooldown_ms: u64,
}

/// Retry policy for API calls and part uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, first one included.
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Stop retrying once this many seconds have elapsed since the first attempt.
    pub elapsed_ceiling_secs: u64,
}

/// Upload strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Try instant upload, then single-shot or multipart by size
    Auto,
    /// Only instant upload; fail if the provider does not have the content
    HashOnly,
    /// Skip hashing and stream straight to storage
    Stream,
}

/// Upload thresholds and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub mode: UploadMode,
    /// Files at or above this size (MiB) use multipart upload.
    pub multipart_threshold_mb: u64,
    /// Unknown-size sources up to this size (MiB) take the streamed path.
    pub stream_limit_mb: u64,
    /// One-shot sources are spooled in memory up to this size (MiB), then to a temp file.
    pub spool_memory_limit_mb: u64,
    /// Whole-upload retries after the provider rejects content.
    pub validation_retries: u32,
    /// Cap on secondary-auth challenge rounds during hash negotiation.
    pub max_sign_rounds: u32,
    /// Smallest multipart part (KiB).
    pub min_part_size_kb: u64,
    /// Largest multipart part (MiB).
    pub max_part_size_mb: u64,
    /// Provider part-count ceiling.
    pub max_parts: u64,
    /// Part buffers kept for reuse.
    pub part_buffers: usize,
}

/// Object-storage tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Signing region.
    pub region: String,
    /// Put the bucket in the path instead of the host name.
    pub path_style: bool,
    /// Refresh storage credentials this many seconds before they expire.
    pub credential_margin_secs: u64,
    /// Upper bound for one part or single-shot transfer.
    pub transfer_timeout_secs: u64,
}

/// Download URL settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Treat a download URL as expired this many seconds early.
    pub url_expiry_margin_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load() / save()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Platform-appropriate configuration directory.
    ///
    /// Typically `$XDG_CONFIG_HOME/pandrive` on Linux.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("pandrive")
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        Self::default_dir().join("config.yaml")
    }
}

impl UploadConfig {
    /// Multipart limits in bytes.
    pub fn chunk_sizing(&self) -> ChunkSizing {
        ChunkSizing {
            min_part_size: self.min_part_size_kb * KIB,
            max_part_size: self.max_part_size_mb * MIB,
            max_parts: self.max_parts,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://proapi.115.com".to_string(),
            passport_url: "https://passportapi.115.com".to_string(),
            qrcode_url: "https://qrcodeapi.115.com".to_string(),
            user_agent: concat!("pandrive/", env!("CARGO_PKG_VERSION")).to_string(),
            call_timeout_secs: 60,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            refresh_window_secs: 300,
            poll_interval_secs: 2,
            login_timeout_secs: 300,
            refresh_wait_secs: 30,
            credential_store: CredentialStoreKind::File,
            credential_file: Config::default_dir().join("credential.yaml"),
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_sleep_ms: 250,
            max_sleep_ms: 2_000,
            decay_constant: 2,
            attack_constant: 1,
            throttle_cooldown_ms: 30_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            elapsed_ceiling_secs: 300,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        let sizing = ChunkSizing::default();
        Self {
            mode: UploadMode::Auto,
            multipart_threshold_mb: 50,
            stream_limit_mb: 100,
            spool_memory_limit_mb: 32,
            validation_retries: 2,
            max_sign_rounds: 5,
            min_part_size_kb: sizing.min_part_size / KIB,
            max_part_size_mb: sizing.max_part_size / MIB,
            max_parts: sizing.max_parts,
            part_buffers: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: "cn-shenzhen".to_string(),
            path_style: false,
            credential_margin_secs: 300,
            transfer_timeout_secs: 600,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url_expiry_margin_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"pacer.min_sleep_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

fn http_url(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        errors.push(ValidationError {
            field: field.into(),
            message: format!("must be an http(s) URL, got {:?}", value),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- api ---
        http_url(&mut errors, "api.base_url", &self.api.base_url);
        http_url(&mut errors, "api.passport_url", &self.api.passport_url);
        http_url(&mut errors, "api.qrcode_url", &self.api.qrcode_url);
        if self.api.user_agent.trim().is_empty() {
            errors.push(ValidationError {
                field: "api.user_agent".into(),
                message: "must not be empty".into(),
            });
        }
        positive(&mut errors, "api.call_timeout_secs", self.api.call_timeout_secs);

        // --- auth ---
        if let Some(id) = &self.auth.client_id {
            if id.trim().is_empty() {
                errors.push(ValidationError {
                    field: "auth.client_id".into(),
                    message: "must not be empty when set".into(),
                });
            }
        }
        positive(&mut errors, "auth.refresh_window_secs", self.auth.refresh_window_secs);
        positive(&mut errors, "auth.poll_interval_secs", self.auth.poll_interval_secs);
        positive(&mut errors, "auth.login_timeout_secs", self.auth.login_timeout_secs);
        positive(&mut errors, "auth.refresh_wait_secs", self.auth.refresh_wait_secs);

        // --- pacer ---
        positive(&mut errors, "pacer.max_sleep_ms", self.pacer.max_sleep_ms);
        if self.pacer.min_sleep_ms > self.pacer.max_sleep_ms {
            errors.push(ValidationError {
                field: "pacer.min_sleep_ms".into(),
                message: format!(
                    "must not exceed pacer.max_sleep_ms ({})",
                    self.pacer.max_sleep_ms
                ),
            });
        }
        if self.pacer.decay_constant == 0 || self.pacer.decay_constant > 16 {
            errors.push(ValidationError {
                field: "pacer.decay_constant".into(),
                message: "must be between 1 and 16".into(),
            });
        }
        if self.pacer.attack_constant > 16 {
            errors.push(ValidationError {
                field: "pacer.attack_constant".into(),
                message: "must be between 0 and 16".into(),
            });
        }
        positive(&mut errors, "pacer.throttle_cooldown_ms", self.pacer.throttle_cooldown_ms);

        // --- retry ---
        positive(&mut errors, "retry.max_attempts", self.retry.max_attempts as u64);
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: format!(
                    "must not exceed retry.max_delay_ms ({})",
                    self.retry.max_delay_ms
                ),
            });
        }
        positive(&mut errors, "retry.elapsed_ceiling_secs", self.retry.elapsed_ceiling_secs);

        // --- upload ---
        positive(&mut errors, "upload.multipart_threshold_mb", self.upload.multipart_threshold_mb);
        positive(&mut errors, "upload.max_sign_rounds", self.upload.max_sign_rounds as u64);
        positive(&mut errors, "upload.min_part_size_kb", self.upload.min_part_size_kb);
        positive(&mut errors, "upload.max_parts", self.upload.max_parts);
        positive(&mut errors, "upload.part_buffers", self.upload.part_buffers as u64);
        if self.upload.min_part_size_kb * KIB > self.upload.max_part_size_mb * MIB {
            errors.push(ValidationError {
                field: "upload.min_part_size_kb".into(),
                message: "must not exceed upload.max_part_size_mb".into(),
            });
        }

        // --- storage ---
        if self.storage.region.trim().is_empty() {
            errors.push(ValidationError {
                field: "storage.region".into(),
                message: "must not be empty".into(),
            });
        }
        positive(&mut errors, "storage.transfer_timeout_secs", self.storage.transfer_timeout_secs);

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid log level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder pre-populated with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- api ---

    /// Point every endpoint at one base URL (handy for mock servers).
    pub fn api_all_urls(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.config.api.base_url = url.clone();
        self.config.api.passport_url = url.clone();
        self.config.api.qrcode_url = url;
        self
    }

    pub fn api_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.api.user_agent = user_agent.into();
        self
    }

    pub fn api_call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api.call_timeout_secs = secs;
        self
    }

    // --- auth ---

    pub fn auth_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.auth.client_id = Some(client_id.into());
        self
    }

    pub fn auth_refresh_window_secs(mut self, secs: u64) -> Self {
        self.config.auth.refresh_window_secs = secs;
        self
    }

    pub fn auth_credential_store(mut self, kind: CredentialStoreKind) -> Self {
        self.config.auth.credential_store = kind;
        self
    }

    pub fn auth_credential_file(mut self, path: PathBuf) -> Self {
        self.config.auth.credential_file = path;
        self
    }

    // --- pacer ---

    pub fn pacer_sleep_ms(mut self, min: u64, max: u64) -> Self {
        self.config.pacer.min_sleep_ms = min;
        self.config.pacer.max_sleep_ms = max;
        self
    }

    pub fn pacer_throttle_cooldown_ms(mut self, ms: u64) -> Self {
        self.config.pacer.throttle_cooldown_ms = ms;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.retry.base_delay_ms = base;
        self.config.retry.max_delay_ms = max;
        self
    }

    // --- upload ---

    pub fn upload_mode(mut self, mode: UploadMode) -> Self {
        self.config.upload.mode = mode;
        self
    }

    pub fn upload_multipart_threshold_mb(mut self, mb: u64) -> Self {
        self.config.upload.multipart_threshold_mb = mb;
        self
    }

    pub fn upload_validation_retries(mut self, retries: u32) -> Self {
        self.config.upload.validation_retries = retries;
        self
    }

    // --- storage ---

    pub fn storage_path_style(mut self, path_style: bool) -> Self {
        self.config.storage.path_style = path_style;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
