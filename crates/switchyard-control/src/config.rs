//! Control plane configuration file.
//!
//! Every key is optional. A missing file section falls back to its defaults:
//!
//! ```toml
//! listen = "0.0.0.0:9190"
//! database_url = "postgres://switchyard@localhost/switchyard"
//!
//! [proxy]
//! live_path = "/etc/traefik/dynamic/switchyard.yml"
//! health_url = "http://traefik:8080/ping"
//! api_url = "http://traefik:8080"
//!
//! [certificates]
//! acme_path = "/letsencrypt/acme.json"
//!
//! [discovery]
//! enabled = true
//! endpoint = "http://docker-proxy:2375"
//!
//! [logging]
//! format = "pretty"
//!
//! [metrics]
//! namespace = "edge"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use switchyard_telemetry::{LogSettings, MetricsSettings};
use thiserror::Error;

use crate::health::{saturating_millis, HealthPolicy};
use crate::renderer::RenderSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub listen: SocketAddr,
    /// PostgreSQL URL. Without one the in-memory store is used.
    pub database_url: Option<String>,
    pub proxy: ProxySection,
    pub health: HealthSection,
    pub snapshots: SnapshotSection,
    pub certificates: CertificateSection,
    pub discovery: DiscoverySection,
    pub logging: LogSettings,
    pub metrics: MetricsSettings,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9190)),
            database_url: None,
            proxy: ProxySection::default(),
            health: HealthSection::default(),
            snapshots: SnapshotSection::default(),
            certificates: CertificateSection::default(),
            discovery: DiscoverySection::default(),
            logging: LogSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    /// The dynamic configuration file the proxy watches.
    pub live_path: PathBuf,
    /// Proxy health endpoint. Without one, publishes are not health gated.
    pub health_url: Option<String>,
    /// Proxy API base URL used to confirm routers were loaded.
    pub api_url: Option<String>,
    /// Entrypoints for routes that name none.
    pub entrypoints: Vec<String>,
    pub cert_resolver: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            live_path: PathBuf::from("dynamic/switchyard.yml"),
            health_url: None,
            api_url: None,
            entrypoints: vec!["web".to_string()],
            cert_resolver: Some("letsencrypt".to_string()),
            request_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub budget_secs: u64,
    pub settle_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        let policy = HealthPolicy::default();
        Self {
            attempts: policy.attempts,
            initial_backoff_ms: saturating_millis(policy.initial_backoff),
            max_backoff_ms: saturating_millis(policy.max_backoff),
            budget_secs: policy.budget.as_secs(),
            settle_ms: saturating_millis(policy.settle),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotSection {
    /// Automatic snapshots kept; manual ones are never pruned.
    pub retention: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self { retention: 50 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertificateSection {
    pub enabled: bool,
    /// The proxy's ACME storage file.
    pub acme_path: PathBuf,
    pub interval_secs: u64,
    pub warning_days: i64,
}

impl Default for CertificateSection {
    fn default() -> Self {
        Self {
            enabled: true,
            acme_path: PathBuf::from("acme.json"),
            interval_secs: 6 * 60 * 60,
            warning_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub enabled: bool,
    /// Container engine API base URL.
    pub endpoint: String,
    pub interval_secs: u64,
    pub label_prefix: String,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:2375".to_string(),
            interval_secs: 5 * 60,
            label_prefix: "traefik".to_string(),
        }
    }
}

impl ControlConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.attempts == 0 {
            return Err(ConfigError::Invalid("health.attempts must be at least 1".into()));
        }
        if self.snapshots.retention == 0 {
            return Err(ConfigError::Invalid(
                "snapshots.retention must be at least 1".into(),
            ));
        }
        if self.certificates.interval_secs == 0 || self.discovery.interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        self.metrics
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            attempts: self.health.attempts,
            initial_backoff: Duration::from_millis(self.health.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.health.max_backoff_ms),
            budget: Duration::from_secs(self.health.budget_secs),
            settle: Duration::from_millis(self.health.settle_ms),
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            default_entrypoints: self.proxy.entrypoints.clone(),
            cert_resolver: self.proxy.cert_resolver.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.request_timeout_secs)
    }
}
