//! Rate limit key resolution.

use std::collections::HashMap;

use super::client_ip::client_ip;
use super::policy::{KeyMode, PolicyDescriptor, Scope};
use crate::error::LimitError;

/// Suffix shared by every caller under [`Scope::PerGlobal`].
pub const GLOBAL_SUFFIX: &str = "GLOBAL";

/// Identity of a single call, as seen by the limiter.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    operation: String,
    remote_addr: Option<String>,
    headers: HashMap<String, String>,
    session_id: Option<String>,
}

impl CallContext {
    /// Create a context for an invocation of `operation`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Set the raw connection address.
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Add a request header. Names are matched case-insensitively.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the caller session identifier.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The caller's address, preferring forwarding headers.
    pub fn caller_ip(&self) -> Option<String> {
        client_ip(&self.headers, self.remote_addr.as_deref())
    }

    /// The session identifier, empty when the caller has none.
    pub fn caller_session(&self) -> &str {
        self.session_id.as_deref().unwrap_or_default()
    }
}

/// The final string naming a shared counter bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedKey(String);

impl ResolvedKey {
    /// Derive the key for a call under `policy`.
    ///
    /// Identical policy and caller inputs always produce the identical key.
    /// The only failure is an IP-keyed policy with no usable caller address.
    pub fn resolve(policy: &PolicyDescriptor, ctx: &CallContext) -> Result<Self, LimitError> {
        let material = match policy.key_mode() {
            KeyMode::ByCallerIp => ctx.caller_ip().ok_or_else(|| {
                LimitError::KeyResolution(format!(
                    "no caller address available for operation '{}'",
                    ctx.operation()
                ))
            })?,
            KeyMode::ByStaticKey => policy.raw_key().to_string(),
            KeyMode::ByOperationName => ctx.operation().to_uppercase(),
        };

        // An empty session id is valid and lands every anonymous caller in one bucket.
        let suffix = match policy.scope() {
            Scope::PerGlobal => GLOBAL_SUFFIX,
            Scope::PerCaller => ctx.caller_session(),
        };

        Ok(Self(format!("{}_{}", material, suffix)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
