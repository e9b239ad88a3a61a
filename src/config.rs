//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{
    CounterStore, FailMode, InMemoryStore, PolicyRegistry, PolicyRule, RateLimiter, RedisStore,
    RedisStoreConfig, DEFAULT_REJECTION_MESSAGE,
};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__STORE__URL`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for a Gatekeeper deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Interception layer configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Inline policies
    #[serde(default)]
    pub policies: Vec<PolicyRule>,

    /// Optional YAML file with additional policies
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every counter key inside the store
    #[serde(default)]
    pub key_prefix: String,

    /// Round trip timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the in-memory store purges expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            key_prefix: String::new(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Settings for the Redis store.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.url.clone(),
            key_prefix: self.key_prefix.clone(),
            timeout: self.timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    30
}

/// Interception layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Behaviour when the store cannot answer
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Message carried by quota rejections
    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::default(),
            message: default_message(),
        }
    }
}

fn default_message() -> String {
    DEFAULT_REJECTION_MESSAGE.to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with
    /// `GATEKEEPER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave the store unusable.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Memory && self.store.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the policy registry from inline policies and the policy file.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        let mut rules = self.policies.clone();

        if let Some(path) = &self.policies_path {
            let contents = std::fs::read_to_string(path)?;
            let from_file = PolicyRegistry::parse_rules(&contents)?;
            rules.extend(from_file);
        }

        PolicyRegistry::from_rules(&rules)
    }

    /// Connect the configured counter store.
    ///
    /// Must be called from within a tokio runtime; the in-memory store starts
    /// its expiry sweeper here.
    pub async fn connect_store(&self) -> Result<Arc<dyn CounterStore>> {
        self.validate()?;

        match self.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(InMemoryStore::new());
                store.spawn_sweeper(self.store.sweep_interval());
                info!(
                    sweep_interval_secs = self.store.sweep_interval_secs,
                    "Using in-memory counter store"
                );
                Ok(store as Arc<dyn CounterStore>)
            }
            StoreBackend::Redis => {
                let store = RedisStore::connect_with_config(self.store.redis()).await?;
                Ok(Arc::new(store) as Arc<dyn CounterStore>)
            }
        }
    }

    /// Build a limiter from policies, store and limiter settings.
    pub async fn build_limiter(&self) -> Result<RateLimiter> {
        let policies = self.policy_registry()?;
        let store = self.connect_store().await?;

        Ok(RateLimiter::new(policies, store)
            .with_fail_mode(self.limiter.fail_mode)
            .with_message(self.limiter.message.clone())
            .with_store_timeout(self.store.timeout()))
    }
}
