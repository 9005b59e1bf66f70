//! Configuration management for Tollgate.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{EndpointSignature, LimitSettings, RateLimitPolicy};

/// Prefix for environment overrides, e.g. `TOLLGATE__SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "TOLLGATE";

fn env_override<T: DeserializeOwned>(env: &::config::Config, key: &str) -> Result<Option<T>> {
    match env.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(::config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Identify callers by `X-Forwarded-For`/`X-Real-IP` instead of the
    /// socket peer. Enable only behind a proxy that sets these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Tier limits, layered over the built-in defaults
    #[serde(default)]
    pub tiers: HashMap<String, LimitSettings>,

    /// Endpoint overrides keyed by `"METHOD /path/template"`
    #[serde(default)]
    pub endpoints: HashMap<String, LimitSettings>,

    /// Shards per registry
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Idle bucket reclamation
    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            tiers: HashMap::new(),
            endpoints: HashMap::new(),
            shards: default_shards(),
            janitor: JanitorConfig::default(),
        }
    }
}

fn default_shards() -> usize {
    crate::ratelimit::DEFAULT_SHARDS
}

/// Janitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Seconds between sweeps
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Seconds a full bucket must go untouched before eviction
    #[serde(default = "default_idle_after")]
    pub idle_after_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            idle_after_secs: default_idle_after(),
        }
    }
}

fn default_interval() -> u64 {
    180
}

fn default_idle_after() -> u64 {
    300
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file with
    /// `TOLLGATE__`-prefixed environment variables layered on top.
    ///
    /// The file is read as-is so tier and endpoint keys keep their case.
    /// The environment may override scalar settings only, e.g.
    /// `TOLLGATE__RATE_LIMITING__JANITOR__IDLE_AFTER_SECS=0`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => TollgateConfig::default(),
        };

        let env = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        config.apply_env(&env)?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: &::config::Config) -> Result<()> {
        if let Some(addr) = env_override::<String>(env, "server.listen_addr")? {
            self.server.listen_addr = addr.parse().map_err(|e| {
                TollgateError::Config(format!("server.listen_addr {:?}: {}", addr, e))
            })?;
        }
        if let Some(trust) = env_override(env, "server.trust_proxy_headers")? {
            self.server.trust_proxy_headers = trust;
        }

        let limits = &mut self.rate_limiting;
        if let Some(shards) = env_override(env, "rate_limiting.shards")? {
            limits.shards = shards;
        }
        if let Some(secs) = env_override(env, "rate_limiting.janitor.interval_secs")? {
            limits.janitor.interval_secs = secs;
        }
        if let Some(secs) = env_override(env, "rate_limiting.janitor.idle_after_secs")? {
            limits.janitor.idle_after_secs = secs;
        }
        Ok(())
    }

    /// Check every configured limit, endpoint signature, and interval.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        for (tier, settings) in &limits.tiers {
            RateLimitPolicy::try_from(*settings)
                .map_err(|e| TollgateError::Config(format!("tier {:?}: {}", tier, e)))?;
        }
        for (endpoint, settings) in &limits.endpoints {
            endpoint.parse::<EndpointSignature>()?;
            RateLimitPolicy::try_from(*settings)
                .map_err(|e| TollgateError::Config(format!("endpoint {:?}: {}", endpoint, e)))?;
        }
        if limits.shards == 0 {
            return Err(TollgateError::Config("shards must be at least 1".to_string()));
        }
        if limits.janitor.interval_secs == 0 {
            return Err(TollgateError::Config(
                "janitor.interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
