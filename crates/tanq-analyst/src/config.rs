//! Service configuration
//!
//! Loaded from a TOML file; unknown fields are rejected at every level so a
//! typo in a deployment config fails loudly at startup instead of silently
//! running with defaults. `DNSTAPIR_NATS_URL` overrides the configured bus
//! URL when set and non-empty.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable overriding `[nats].url`.
pub const ENV_NATS_URL: &str = "DNSTAPIR_NATS_URL";

/// Configuration errors. All fatal: the process refuses to start on a bad
/// config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("couldn't open config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("problem decoding config file: {reason}")]
    Parse { reason: String },

    #[error("bad config: {reason}")]
    Invalid { reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Force DEBUG logging everywhere.
    pub debug: bool,
    /// Domains under any of these suffixes are dropped before any KV work.
    pub ignore_suffixes: Vec<String>,
    /// Directory of JSON schemas; payload validation is off when unset.
    pub schema_dir: Option<PathBuf>,
    pub workers: WorkersConfig,
    pub api: ApiConfig,
    pub cert: CertConfig,
    pub nats: NatsConfig,
    pub libtapir: LibtapirConfig,
}

/// Worker pool bounds. Both queues are deliberately bounded: unbounded ones
/// would buy memory blowup under bus bursts instead of backpressure.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkersConfig {
    pub count: usize,
    pub queue: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { count: 3, queue: 10 }
    }
}

/// Admin API endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiConfig {
    pub active: bool,
    pub debug: bool,
    pub address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            active: false,
            debug: false,
            address: "127.0.0.1".to_string(),
            port: 8443,
        }
    }
}

/// Certificate manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CertConfig {
    pub active: bool,
    pub debug: bool,
    /// Rescan interval in seconds; 0 scans once and never refreshes.
    pub interval: u64,
    pub cert_dir: PathBuf,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            active: false,
            debug: false,
            interval: 0,
            cert_dir: PathBuf::new(),
        }
    }
}

/// Bus connection, subjects, and buckets.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NatsConfig {
    pub debug: bool,
    pub url: String,
    pub event_subject: String,
    pub observation_subject_prefix: String,
    pub private_subject_prefix: String,
    pub seen_domains_subject_prefix: String,
    pub globally_new_bucket: String,
    pub private_bucket: String,
    pub seen_domains_bucket: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            url: "nats://localhost:4222".to_string(),
            event_subject: "events.new_qname.>".to_string(),
            observation_subject_prefix: "observations".to_string(),
            private_subject_prefix: "private".to_string(),
            seen_domains_subject_prefix: "seen".to_string(),
            globally_new_bucket: "globally_new".to_string(),
            private_bucket: "tapir-analyse-new-qname".to_string(),
            seen_domains_bucket: "seen_domains".to_string(),
        }
    }
}

/// Shared tapir library handle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LibtapirConfig {
    pub debug: bool,
}

impl Config {
    /// Load from `path`, apply the environment override, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;

        if let Ok(url) = std::env::var(ENV_NATS_URL) {
            if !url.is_empty() {
                config.nats.url = url;
            }
        }

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim the subject/prefix fields once at load.
    fn normalize(&mut self) {
        let trim = |s: &mut String| *s = s.trim_matches('.').to_string();
        trim(&mut self.nats.event_subject);
        trim(&mut self.nats.observation_subject_prefix);
        trim(&mut self.nats.private_subject_prefix);
        trim(&mut self.nats.seen_domains_subject_prefix);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            reason: reason.to_string(),
        };

        if self.nats.url.is_empty() {
            return Err(invalid("[nats].url must not be empty"));
        }
        if self.nats.event_subject.is_empty() {
            return Err(invalid("[nats].event_subject must not be empty"));
        }
        if self.nats.seen_domains_bucket.is_empty() || self.nats.globally_new_bucket.is_empty() {
            return Err(invalid("bucket names must not be empty"));
        }
        if self.workers.count == 0 {
            return Err(invalid("[workers].count must be at least 1"));
        }
        if self.workers.queue == 0 {
            return Err(invalid("[workers].queue must be at least 1"));
        }
        if self.api.active && !self.cert.active {
            return Err(invalid("[api] requires [cert] to be active for TLS"));
        }
        if self.cert.active && self.cert.cert_dir.as_os_str().is_empty() {
            return Err(invalid("[cert].cert_dir must be set when [cert] is active"));
        }
        Ok(())
    }

    /// Adapter-level bus configuration.
    pub fn nats_adapter_config(&self) -> tanq_adapters::NatsConfig {
        tanq_adapters::NatsConfig {
            url: self.nats.url.clone(),
            event_subject: self.nats.event_subject.clone(),
            observation_subject_prefix: self.nats.observation_subject_prefix.clone(),
            private_subject_prefix: self.nats.private_subject_prefix.clone(),
            seen_domains_subject_prefix: self.nats.seen_domains_subject_prefix.clone(),
            globally_new_bucket: self.nats.globally_new_bucket.clone(),
            private_bucket: self.nats.private_bucket.clone(),
            seen_domains_bucket: self.nats.seen_domains_bucket.clone(),
        }
    }

    /// Adapter-level certificate manager configuration.
    pub fn cert_manager_config(&self) -> tanq_adapters::CertManagerConfig {
        tanq_adapters::CertManagerConfig {
            active: self.cert.active,
            interval_secs: self.cert.interval,
            cert_dir: self.cert.cert_dir.clone(),
        }
    }
}
