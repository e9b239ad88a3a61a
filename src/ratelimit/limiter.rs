//! Interception layer that guards protected operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::{CallContext, ResolvedKey};
use super::policy::{PolicyDescriptor, PolicyRegistry};
use super::store::{CounterStore, StoreError};
use crate::error::LimitError;

/// Message carried by quota rejections unless configured otherwise.
pub const DEFAULT_REJECTION_MESSAGE: &str = "接口访问超出频率限制";

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// What to do when the counter store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Reject the call.
    #[default]
    Closed,
    /// Let the call through unmetered.
    Open,
}

/// Outcome of the admission check for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within quota; the operation runs.
    Admitted,
    /// Over quota; the operation does not run.
    Rejected,
    /// No policy is attached to the operation.
    Unlimited,
    /// The store failed and the limiter is configured to fail open.
    FailedOpen,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Admitted => "admitted",
            Decision::Rejected => "rejected",
            Decision::Unlimited => "unlimited",
            Decision::FailedOpen => "failed_open",
        }
    }

    /// Whether the protected operation may run.
    pub fn proceeds(&self) -> bool {
        !matches!(self, Decision::Rejected)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking a call against its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The decision reached.
    pub decision: Decision,
    /// The key the call was counted under, if a policy applied.
    pub key: Option<ResolvedKey>,
    /// The count returned by the store, if it answered.
    pub count: Option<u64>,
}

impl Admission {
    fn unlimited() -> Self {
        Self {
            decision: Decision::Unlimited,
            key: None,
            count: None,
        }
    }
}

/// The rate limiter guarding protected operations.
///
/// Holds no mutable state of its own; all counting happens inside the
/// store's atomic admission script, so one instance can be shared freely
/// between tasks and many instances can share one store.
pub struct RateLimiter {
    policies: PolicyRegistry,
    store: Arc<dyn CounterStore>,
    fail_mode: FailMode,
    message: String,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter over registered policies and a counter store.
    pub fn new(policies: PolicyRegistry, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policies,
            store,
            fail_mode: FailMode::default(),
            message: DEFAULT_REJECTION_MESSAGE.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Choose how store failures are handled.
    pub fn with_fail_mode(mut self, mode: FailMode) -> Self {
        self.fail_mode = mode;
        self
    }

    /// Override the quota-exceeded message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Bound every store round trip.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Run `proceed` if the call is within its quota.
    ///
    /// The operation's output is returned exactly as produced, so a wrapped
    /// `Result` keeps its own error type. Over-quota calls never run `proceed`
    /// and yield [`LimitError::QuotaExceeded`]. A counted call stays counted
    /// even if the operation is later cancelled.
    pub async fn intercept<F, Fut, R>(&self, ctx: &CallContext, proceed: F) -> Result<R, LimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let admission = self.check(ctx).await?;

        if !admission.decision.proceeds() {
            let resource = self
                .policies
                .get(ctx.operation())
                .map(|p| p.resource_name().to_string())
                .unwrap_or_default();

            return Err(LimitError::QuotaExceeded {
                resource,
                message: self.message.clone(),
            });
        }

        Ok(proceed().await)
    }

    /// Count the call and decide whether it may proceed, without running it.
    pub async fn check(&self, ctx: &CallContext) -> Result<Admission, LimitError> {
        let Some(policy) = self.policies.get(ctx.operation()) else {
            debug!(operation = %ctx.operation(), "No rate limit policy attached");
            return Ok(Admission::unlimited());
        };

        let key = ResolvedKey::resolve(policy, ctx).inspect_err(|e| {
            warn!(
                operation = %ctx.operation(),
                resource = %policy.resource_name(),
                error = %e,
                "Failed to resolve rate limit key"
            );
        })?;

        let count = match self.admit(&key, policy).await {
            Ok(count) => count,
            Err(e) => return self.on_store_error(ctx, policy, key, e),
        };

        // `<=` keeps the effective quota exact: the call that reaches `quota` is admitted.
        let decision = if count <= policy.quota() {
            Decision::Admitted
        } else {
            Decision::Rejected
        };

        info!(
            operation = %ctx.operation(),
            resource = %policy.resource_name(),
            key = %key,
            count,
            quota = policy.quota(),
            decision = %decision,
            "Rate limit decision"
        );

        if decision == Decision::Rejected {
            debug!(
                key = %key,
                count,
                quota = policy.quota(),
                window_secs = policy.window_secs(),
                "Rate limit exceeded"
            );
        }

        Ok(Admission {
            decision,
            key: Some(key),
            count: Some(count),
        })
    }

    async fn admit(&self, key: &ResolvedKey, policy: &PolicyDescriptor) -> Result<u64, StoreError> {
        tokio::time::timeout(
            self.store_timeout,
            self.store.admit(key.as_str(), policy.quota(), policy.window()),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    fn on_store_error(
        &self,
        ctx: &CallContext,
        policy: &PolicyDescriptor,
        key: ResolvedKey,
        error: StoreError,
    ) -> Result<Admission, LimitError> {
        warn!(
            operation = %ctx.operation(),
            resource = %policy.resource_name(),
            key = %key,
            store = self.store.name(),
            fail_mode = ?self.fail_mode,
            error = %error,
            "Counter store failed"
        );

        match self.fail_mode {
            FailMode::Closed => Err(LimitError::StoreUnavailable),
            FailMode::Open => Ok(Admission {
                decision: Decision::FailedOpen,
                key: Some(key),
                count: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{InMemoryStore, KeyMode, Scope};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn admit(&self, _key: &str, _quota: u64, _window: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Connection("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn admit(&self, _key: &str, _quota: u64, _window: Duration) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    fn registry(quota: u64) -> PolicyRegistry {
        let mut registry = PolicyRegistry::new();
        registry
            .register(
                "test",
                PolicyDescriptor::builder(60, quota)
                    .resource_name("测试")
                    .key("key")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_unlimited() {
        let limiter = RateLimiter::new(PolicyRegistry::new(), Arc::new(InMemoryStore::new()));

        for _ in 0..10 {
            let out = limiter
                .intercept(&CallContext::new("anything"), || async { 7 })
                .await;
            assert_eq!(out, Ok(7));
        }
    }

    #[tokio::test]
    async fn test_rejected_call_does_not_run() {
        let limiter = RateLimiter::new(registry(1), Arc::new(InMemoryStore::new()));
        let runs = AtomicUsize::new(0);
        let ctx = CallContext::new("test");

        let first = limiter
            .intercept(&ctx, || async { runs.fetch_add(1, Ordering::SeqCst) })
            .await;
        assert!(first.is_ok());

        let second = limiter
            .intercept(&ctx, || async { runs.fetch_add(1, Ordering::SeqCst) })
            .await;
        assert_eq!(
            second,
            Err(LimitError::QuotaExceeded {
                resource: "测试".to_string(),
                message: DEFAULT_REJECTION_MESSAGE.to_string(),
            })
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_by_default() {
        let limiter = RateLimiter::new(registry(3), Arc::new(FailingStore));
        assert_eq!(limiter.fail_mode(), FailMode::Closed);

        let result = limiter
            .intercept(&CallContext::new("test"), || async { "ran" })
            .await;

        assert_eq!(result, Err(LimitError::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_store_error_text_stays_out_of_response() {
        let limiter = RateLimiter::new(registry(3), Arc::new(FailingStore));

        let err = limiter
            .intercept(&CallContext::new("test"), || async {})
            .await
            .unwrap_err();
        let body = serde_json::to_string(&err.response()).unwrap();

        assert_eq!(err.response().code, 503);
        assert!(!body.contains("connection refused"));
        assert!(!body.contains("connection failed"));
    }

    #[tokio::test]
    async fn test_fail_open_admits() {
        let limiter =
            RateLimiter::new(registry(3), Arc::new(FailingStore)).with_fail_mode(FailMode::Open);

        let admission = limiter.check(&CallContext::new("test")).await.unwrap();
        assert_eq!(admission.decision, Decision::FailedOpen);
        assert_eq!(admission.count, None);

        let result = limiter
            .intercept(&CallContext::new("test"), || async { "ran" })
            .await;
        assert_eq!(result, Ok("ran"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let limiter = RateLimiter::new(registry(3), Arc::new(StalledStore))
            .with_store_timeout(Duration::from_millis(50));

        let result = limiter
            .intercept(&CallContext::new("test"), || async { "ran" })
            .await;
        assert_eq!(result, Err(LimitError::StoreUnavailable));
    }

    #[tokio::test]
    async fn test_key_resolution_failure_blocks_call() {
        let mut policies = PolicyRegistry::new();
        policies
            .register(
                "login",
                PolicyDescriptor::builder(60, 3)
                    .key_mode(KeyMode::ByCallerIp)
                    .scope(Scope::PerGlobal)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let limiter = RateLimiter::new(policies, Arc::new(InMemoryStore::new()));

        let result = limiter
            .intercept(&CallContext::new("login"), || async { "ran" })
            .await;
        assert!(matches!(result, Err(LimitError::KeyResolution(_))));
    }

    #[tokio::test]
    async fn test_custom_message() {
        let limiter = RateLimiter::new(registry(1), Arc::new(InMemoryStore::new()))
            .with_message("slow down");
        let ctx = CallContext::new("test");

        limiter.intercept(&ctx, || async {}).await.unwrap();
        let err = limiter.intercept(&ctx, || async {}).await.unwrap_err();
        assert_eq!(err.to_string(), "slow down");
    }

    #[test]
    fn test_decision_proceeds() {
        assert!(Decision::Admitted.proceeds());
        assert!(Decision::Unlimited.proceeds());
        assert!(Decision::FailedOpen.proceeds());
        assert!(!Decision::Rejected.proceeds());
    }
}
