//! Configuration for StashKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::{Result, StashError};
use crate::migration::SchemaVersion;

/// Main configuration for a StashKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the durable media
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── records.log      (transactional backend)
    ///     └── durable.kv       (durable key/value snapshot)
    pub data_dir: PathBuf,

    /// Namespace prepended to every physical key
    pub key_prefix: String,

    /// Backends that must report themselves unavailable
    pub disabled_backends: Vec<BackendKind>,

    /// How long a request to the transactional worker may take
    pub backend_timeout: Duration,

    // -------------------------------------------------------------------------
    // Codec Configuration
    // -------------------------------------------------------------------------
    /// Encrypt entries at rest (AES-256-GCM)
    pub encryption: bool,

    /// Compress entries above `compression_threshold`
    pub compression: bool,

    /// Serialized size (bytes) above which a value is compressed
    pub compression_threshold: usize,

    /// Serialized size (bytes) above which the transactional backend is preferred
    pub large_value_threshold: usize,

    // -------------------------------------------------------------------------
    // Quota Configuration
    // -------------------------------------------------------------------------
    pub transactional_quota: Option<u64>,
    pub durable_quota: Option<u64>,
    pub session_quota: Option<u64>,

    /// Usage ratio that triggers a quota warning
    pub quota_warning_ratio: f64,

    /// Usage ratio that triggers a critical quota event
    pub quota_critical_ratio: f64,

    // -------------------------------------------------------------------------
    // Maintenance Configuration
    // -------------------------------------------------------------------------
    /// Interval of the background dirty-key sync
    pub sync_interval: Duration,

    /// Interval of the background quota monitor
    pub quota_check_interval: Duration,

    /// Run the background maintenance worker at all
    pub background_maintenance: bool,

    // -------------------------------------------------------------------------
    // Schema Configuration
    // -------------------------------------------------------------------------
    /// Schema version of the running code; the stored version is raised to it
    pub schema_version: SchemaVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stashkv_data"),
            key_prefix: "stash_".to_string(),
            disabled_backends: Vec::new(),
            backend_timeout: Duration::from_secs(5),
            encryption: true,
            compression: true,
            compression_threshold: 1024,        // 1 KiB
            large_value_threshold: 100 * 1024,  // 100 KiB
            transactional_quota: Some(512 * 1024 * 1024), // 512 MB
            durable_quota: Some(5 * 1024 * 1024),         // 5 MB
            session_quota: Some(5 * 1024 * 1024),         // 5 MB
            quota_warning_ratio: 0.80,
            quota_critical_ratio: 0.95,
            sync_interval: Duration::from_secs(30),
            quota_check_interval: Duration::from_secs(60),
            background_maintenance: true,
            schema_version: SchemaVersion::new(1, 0, 0),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(StashError::Config("key prefix must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.quota_warning_ratio)
            || !(0.0..=1.0).contains(&self.quota_critical_ratio)
        {
            return Err(StashError::Config(
                "quota ratios must lie within 0.0..=1.0".to_string(),
            ));
        }
        if self.quota_warning_ratio > self.quota_critical_ratio {
            return Err(StashError::Config(format!(
                "quota warning ratio {} exceeds critical ratio {}",
                self.quota_warning_ratio, self.quota_critical_ratio
            )));
        }
        if self.sync_interval.is_zero() || self.quota_check_interval.is_zero() {
            return Err(StashError::Config(
                "maintenance intervals must be non-zero".to_string(),
            ));
        }
        if self.disabled_backends.contains(&BackendKind::Memory) {
            return Err(StashError::Config(
                "the memory backend cannot be disabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Quota configured for a backend, if any
    pub fn quota_for(&self, kind: BackendKind) -> Option<u64> {
        match kind {
            BackendKind::Transactional => self.transactional_quota,
            BackendKind::Durable => self.durable_quota,
            BackendKind::Session => self.session_quota,
            BackendKind::Memory => None,
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for the durable media)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the physical key namespace
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Force a backend to report itself unavailable
    pub fn disable_backend(mut self, kind: BackendKind) -> Self {
        if !self.config.disabled_backends.contains(&kind) {
            self.config.disabled_backends.push(kind);
        }
        self
    }

    /// Set the transactional worker timeout
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = timeout;
        self
    }

    /// Enable or disable at-rest encryption
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.config.encryption = enabled;
        self
    }

    /// Enable or disable payload compression
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Set the compression threshold (in bytes)
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    /// Set the large-value threshold (in bytes)
    pub fn large_value_threshold(mut self, bytes: usize) -> Self {
        self.config.large_value_threshold = bytes;
        self
    }

    /// Set the quota of one backend (`None` = unlimited)
    pub fn quota(mut self, kind: BackendKind, bytes: Option<u64>) -> Self {
        match kind {
            BackendKind::Transactional => self.config.transactional_quota = bytes,
            BackendKind::Durable => self.config.durable_quota = bytes,
            BackendKind::Session => self.config.session_quota = bytes,
            BackendKind::Memory => {}
        }
        self
    }

    /// Set the warning and critical quota ratios
    pub fn quota_ratios(mut self, warning: f64, critical: f64) -> Self {
        self.config.quota_warning_ratio = warning;
        self.config.quota_critical_ratio = critical;
        self
    }

    /// Set the background sync interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    /// Set the background quota check interval
    pub fn quota_check_interval(mut self, interval: Duration) -> Self {
        self.config.quota_check_interval = interval;
        self
    }

    /// Enable or disable the background maintenance worker
    pub fn background_maintenance(mut self, enabled: bool) -> Self {
        self.config.background_maintenance = enabled;
        self
    }

    /// Set the schema version of the running code
    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.config.schema_version = version;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
