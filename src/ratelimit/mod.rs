//! Rate limiting logic: policies, key resolution, counter stores and the
//! interception layer.

mod client_ip;
mod key;
mod limiter;
mod memory;
mod policy;
mod redis_store;
mod store;

pub use client_ip::{client_ip, FORWARDING_HEADERS};
pub use key::{CallContext, ResolvedKey, GLOBAL_SUFFIX};
pub use limiter::{
    Admission, Decision, FailMode, RateLimiter, DEFAULT_REJECTION_MESSAGE, DEFAULT_STORE_TIMEOUT,
};
pub use memory::{CounterSnapshot, InMemoryStore};
pub use policy::{
    KeyMode, PolicyDescriptor, PolicyDescriptorBuilder, PolicyRegistry, PolicyRule, Scope,
    MAX_WINDOW_SECS,
};
pub use redis_store::{RedisStore, RedisStoreConfig, ADMISSION_SCRIPT};
pub use store::{CounterStore, StoreError};
