//! Gatekeeper - Distributed Request Rate Limiter
//!
//! This crate guards protected operations with a fixed-window quota. Before an
//! operation runs, the limiter atomically increments a counter shared by every
//! limiter instance (in process or in Redis) and rejects the call once the
//! count for the current window exceeds the configured quota.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{GatekeeperError, LimitError, Rejection, Result};
pub use ratelimit::{CallContext, PolicyDescriptor, PolicyRegistry, RateLimiter};
