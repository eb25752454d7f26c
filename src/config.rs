//! Application configuration.
//!
//! Read from an optional TOML file, then overridden by `RUNONCE_*`
//! environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use runonce_guard::{
    CollectorConfig, DEFAULT_CLOSED_RETENTION, GuardConfig, KeyDerivation, StoreConfig,
};
use runonce_onboarding::ServicesConfig;
use serde::{Deserialize, Serialize};
use url::Url;

pub const ENV_BIND: &str = "RUNONCE_BIND";
pub const ENV_STORE_URL: &str = "RUNONCE_STORE_URL";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "RUNONCE_SWEEP_INTERVAL_SECS";
pub const ENV_KEY_DERIVATION: &str = "RUNONCE_KEY_DERIVATION";
pub const ENV_SERVICES_URL: &str = "RUNONCE_SERVICES_URL";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Where the ledger and the patients live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Surreal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// SurrealDB connection URL (e.g., "mem://", "rocksdb://data/db").
    pub url: String,
    pub namespace: String,
    pub database: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "mem://".to_string(),
            namespace: "runonce".to_string(),
            database: "runonce".to_string(),
        }
    }
}

impl StoreSection {
    pub fn surreal_config(&self) -> StoreConfig {
        StoreConfig::in_memory()
            .with_url(self.url.clone())
            .with_namespace(self.namespace.clone())
            .with_database(self.database.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSection {
    pub interval_secs: u64,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Finished onboardings whose status stays queryable.
    pub closed_retention: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            closed_retention: DEFAULT_CLOSED_RETENTION,
        }
    }
}

/// Effective configuration of the `runonce` binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub store: StoreSection,
    pub collector: CollectorSection,
    pub orchestrator: OrchestratorSection,
    pub guard: GuardConfig,
    pub services: ServicesConfig,
}

impl AppConfig {
    /// Load from `path` (defaults when `None`), then apply the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, an environment
    /// override is malformed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// # Errors
    ///
    /// Returns an error if `text` is not a valid configuration.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// # Errors
    ///
    /// Returns an error if the configuration cannot be rendered.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `RUNONCE_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable whose value does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::InvalidEnv {
                    var: ENV_BIND,
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
            self.store.backend = StoreBackend::Surreal;
        }
        if let Some(secs) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            self.collector.interval_secs =
                secs.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
                    var: ENV_SWEEP_INTERVAL_SECS,
                    reason: e.to_string(),
                })?;
        }
        if let Some(strategy) = lookup(ENV_KEY_DERIVATION) {
            self.guard.key_derivation =
                strategy
                    .parse::<KeyDerivation>()
                    .map_err(|e| ConfigError::InvalidEnv {
                        var: ENV_KEY_DERIVATION,
                        reason: e.to_string(),
                    })?;
        }
        if let Some(url) = lookup(ENV_SERVICES_URL) {
            let url = Url::parse(&url).map_err(|e| ConfigError::InvalidEnv {
                var: ENV_SERVICES_URL,
                reason: e.to_string(),
            })?;
            self.services.base_url = Some(url);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the sweep interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.collector_config().map(|_| ())
    }

    /// # Errors
    ///
    /// Returns an error if the sweep interval is zero.
    pub fn collector_config(&self) -> Result<CollectorConfig, ConfigError> {
        CollectorConfig::from_secs(self.collector.interval_secs)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
