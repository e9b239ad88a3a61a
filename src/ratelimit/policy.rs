//! Policy descriptors and the operation → policy registration map.
//!
//! A policy is attached once per protected operation at startup and never
//! mutated afterwards. Policies can be built in code or loaded from YAML:
//!
//! ```yaml
//! policies:
//!   - operation: test
//!     name: 测试
//!     key: key
//!     period: 60
//!     count: 3
//!     limit_type: general
//!     limit_range: consumer
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GatekeeperError, Result};

/// Longest accepted window, in seconds.
///
/// Both stores must be able to express the expiry: the in-memory store adds
/// it to a monotonic instant and Redis `EXPIRE` takes a signed integer.
pub const MAX_WINDOW_SECS: u64 = i32::MAX as u64;

/// How the key material is derived for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyMode {
    /// The caller's network address.
    #[serde(rename = "ip")]
    ByCallerIp,
    /// The policy's static key, verbatim.
    #[default]
    #[serde(rename = "general")]
    ByStaticKey,
    /// The upper-cased operation name.
    #[serde(rename = "customer")]
    ByOperationName,
}

/// Whether a counter is shared by every caller or split per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scope {
    /// One counter per caller session.
    #[default]
    #[serde(rename = "consumer")]
    PerCaller,
    /// One counter for all callers.
    #[serde(rename = "global")]
    PerGlobal,
}

/// Static rate limit configuration for one protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDescriptor {
    resource_name: String,
    raw_key: String,
    window_secs: u64,
    quota: u64,
    key_mode: KeyMode,
    scope: Scope,
}

impl PolicyDescriptor {
    /// Start building a policy allowing `quota` calls every `window_secs` seconds.
    pub fn builder(window_secs: u64, quota: u64) -> PolicyDescriptorBuilder {
        PolicyDescriptorBuilder {
            resource_name: String::new(),
            raw_key: String::new(),
            window_secs,
            quota,
            key_mode: KeyMode::default(),
            scope: Scope::default(),
        }
    }

    /// Diagnostic name of the protected resource.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Static key material used by [`KeyMode::ByStaticKey`].
    pub fn raw_key(&self) -> &str {
        &self.raw_key
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Maximum calls admitted per window.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// Builder for [`PolicyDescriptor`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PolicyDescriptorBuilder {
    resource_name: String,
    raw_key: String,
    window_secs: u64,
    quota: u64,
    key_mode: KeyMode,
    scope: Scope,
}

impl PolicyDescriptorBuilder {
    /// Set the diagnostic resource name.
    pub fn resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    /// Set the static key material.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.raw_key = key.into();
        self
    }

    pub fn key_mode(mut self, mode: KeyMode) -> Self {
        self.key_mode = mode;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Validate and build the descriptor.
    pub fn build(self) -> Result<PolicyDescriptor> {
        if self.quota == 0 {
            return Err(GatekeeperError::Config(format!(
                "policy '{}': quota must be greater than zero",
                self.resource_name
            )));
        }

        if self.window_secs == 0 {
            return Err(GatekeeperError::Config(format!(
                "policy '{}': window must be greater than zero seconds",
                self.resource_name
            )));
        }

        if self.window_secs > MAX_WINDOW_SECS {
            return Err(GatekeeperError::Config(format!(
                "policy '{}': window of {}s exceeds the maximum of {}s",
                self.resource_name, self.window_secs, MAX_WINDOW_SECS
            )));
        }

        Ok(PolicyDescriptor {
            resource_name: self.resource_name,
            raw_key: self.raw_key,
            window_secs: self.window_secs,
            quota: self.quota,
            key_mode: self.key_mode,
            scope: self.scope,
        })
    }
}

/// Serialized form of a policy, keyed by the operation it protects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Operation identifier the policy is attached to.
    pub operation: String,
    /// Resource name, used for diagnostics only
    #[serde(default)]
    pub name: String,
    /// Static key material
    #[serde(default)]
    pub key: String,
    /// Window length in seconds
    pub period: u64,
    /// Calls allowed per window
    pub count: u64,
    #[serde(default)]
    pub limit_type: KeyMode,
    #[serde(default)]
    pub limit_range: Scope,
}

impl PolicyRule {
    /// Validate the rule and turn it into a descriptor.
    pub fn to_descriptor(&self) -> Result<PolicyDescriptor> {
        PolicyDescriptor::builder(self.period, self.count)
            .resource_name(self.name.clone())
            .key(self.key.clone())
            .key_mode(self.limit_type)
            .scope(self.limit_range)
            .build()
            .map_err(|e| match e {
                GatekeeperError::Config(msg) => {
                    GatekeeperError::Config(format!("operation '{}': {}", self.operation, msg))
                }
                other => other,
            })
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyRule>,
}

/// Registration map from operation identifier to its policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, PolicyDescriptor>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a policy to an operation.
    ///
    /// Each operation carries at most one policy; registering twice is a
    /// configuration error.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        policy: PolicyDescriptor,
    ) -> Result<()> {
        let operation = operation.into();
        if self.policies.contains_key(&operation) {
            return Err(GatekeeperError::Config(format!(
                "operation '{}' already has a rate limit policy",
                operation
            )));
        }

        debug!(
            operation = %operation,
            resource = %policy.resource_name(),
            quota = policy.quota(),
            window_secs = policy.window_secs(),
            "Registered rate limit policy"
        );
        self.policies.insert(operation, policy);
        Ok(())
    }

    /// Build a registry from serialized rules.
    pub fn from_rules(rules: &[PolicyRule]) -> Result<Self> {
        let mut registry = Self::new();
        for rule in rules {
            registry.register(rule.operation.clone(), rule.to_descriptor()?)?;
        }
        Ok(registry)
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_rules(&Self::parse_rules(yaml)?)
    }

    /// Parse rules from YAML without registering them.
    ///
    /// Accepts either a bare list of rules or a document with a `policies` list.
    pub fn parse_rules(yaml: &str) -> Result<Vec<PolicyRule>> {
        if let Ok(rules) = serde_yaml::from_str::<Vec<PolicyRule>>(yaml) {
            return Ok(rules);
        }

        serde_yaml::from_str::<PolicyFile>(yaml)
            .map(|file| file.policies)
            .map_err(|e| {
                GatekeeperError::Config(format!("Failed to parse rate limit policies: {}", e))
            })
    }

    /// Look up the policy for an operation.
    pub fn get(&self, operation: &str) -> Option<&PolicyDescriptor> {
        self.policies.get(operation)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterate over registered operations and their policies.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PolicyDescriptor)> {
        self.policies.iter().map(|(op, policy)| (op.as_str(), policy))
    }
}
