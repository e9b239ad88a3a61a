//! End-to-end behaviour of the rate limiter against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gatekeeper::ratelimit::{
    CallContext, Decision, InMemoryStore, KeyMode, PolicyDescriptor, PolicyRegistry, RateLimiter,
    ResolvedKey, Scope, DEFAULT_REJECTION_MESSAGE,
};
use gatekeeper::LimitError;

fn limiter_with(
    operation: &str,
    policy: PolicyDescriptor,
) -> (RateLimiter, Arc<InMemoryStore>) {
    let mut policies = PolicyRegistry::new();
    policies.register(operation, policy).unwrap();
    let store = Arc::new(InMemoryStore::new());
    (RateLimiter::new(policies, store.clone()), store)
}

fn sample_policy(scope: Scope) -> PolicyDescriptor {
    PolicyDescriptor::builder(60, 3)
        .resource_name("测试")
        .key("key")
        .key_mode(KeyMode::ByStaticKey)
        .scope(scope)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_sample_endpoint_four_rapid_calls() {
    let (limiter, store) = limiter_with("test", sample_policy(Scope::PerCaller));
    let ctx = CallContext::new("test");

    let key = ResolvedKey::resolve(limiter.policies().get("test").unwrap(), &ctx).unwrap();
    assert_eq!(key.as_str(), "key_");

    for _ in 0..3 {
        let out = limiter.intercept(&ctx, || async { "test" }).await;
        assert_eq!(out, Ok("test"));
    }

    let fourth = limiter.intercept(&ctx, || async { "test" }).await;
    assert_eq!(
        fourth,
        Err(LimitError::QuotaExceeded {
            resource: "测试".to_string(),
            message: DEFAULT_REJECTION_MESSAGE.to_string(),
        })
    );

    // Rejected calls still consume an increment.
    assert_eq!(store.snapshot("key_").unwrap().count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_window_expiry_admits_again() {
    let (limiter, _store) = limiter_with("test", sample_policy(Scope::PerCaller));
    let ctx = CallContext::new("test");

    for _ in 0..4 {
        let _ = limiter.check(&ctx).await.unwrap();
    }
    assert_eq!(limiter.check(&ctx).await.unwrap().decision, Decision::Rejected);

    tokio::time::advance(Duration::from_secs(60)).await;

    let admission = limiter.check(&ctx).await.unwrap();
    assert_eq!(admission.decision, Decision::Admitted);
    assert_eq!(admission.count, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_count_is_exact_per_call() {
    let (limiter, _store) = limiter_with("test", sample_policy(Scope::PerGlobal));
    let ctx = CallContext::new("test");

    for expected in 1..=10u64 {
        let admission = limiter.check(&ctx).await.unwrap();
        assert_eq!(admission.count, Some(expected));
        let want = if expected <= 3 {
            Decision::Admitted
        } else {
            Decision::Rejected
        };
        assert_eq!(admission.decision, want);
    }
}

#[tokio::test]
async fn test_per_caller_scope_isolates_sessions() {
    let (limiter, _store) = limiter_with("test", sample_policy(Scope::PerCaller));
    let alice = CallContext::new("test").session_id("alice");
    let bob = CallContext::new("test").session_id("bob");

    for _ in 0..3 {
        assert!(limiter.intercept(&alice, || async {}).await.is_ok());
    }
    assert!(limiter.intercept(&alice, || async {}).await.is_err());

    // Bob has his own bucket.
    for _ in 0..3 {
        assert!(limiter.intercept(&bob, || async {}).await.is_ok());
    }
}

#[tokio::test]
async fn test_global_scope_shares_one_counter() {
    let (limiter, store) = limiter_with("test", sample_policy(Scope::PerGlobal));
    let alice = CallContext::new("test").session_id("alice");
    let bob = CallContext::new("test").session_id("bob");

    assert!(limiter.intercept(&alice, || async {}).await.is_ok());
    assert!(limiter.intercept(&bob, || async {}).await.is_ok());
    assert!(limiter.intercept(&alice, || async {}).await.is_ok());
    assert!(limiter.intercept(&bob, || async {}).await.is_err());

    assert_eq!(store.snapshot("key_GLOBAL").unwrap().count, 4);
}

#[tokio::test]
async fn test_ip_keyed_policy_separates_callers() {
    let policy = PolicyDescriptor::builder(60, 1)
        .key_mode(KeyMode::ByCallerIp)
        .scope(Scope::PerGlobal)
        .build()
        .unwrap();
    let (limiter, store) = limiter_with("login", policy);

    let first = CallContext::new("login").header("X-Forwarded-For", "1.1.1.1");
    let second = CallContext::new("login").remote_addr("2.2.2.2:5000");

    assert!(limiter.intercept(&first, || async {}).await.is_ok());
    assert!(limiter.intercept(&second, || async {}).await.is_ok());
    assert!(limiter.intercept(&first, || async {}).await.is_err());

    assert_eq!(store.snapshot("1.1.1.1_GLOBAL").unwrap().count, 2);
    assert_eq!(store.snapshot("2.2.2.2_GLOBAL").unwrap().count, 1);
}

#[tokio::test]
async fn test_operation_name_key() {
    let policy = PolicyDescriptor::builder(60, 2)
        .key_mode(KeyMode::ByOperationName)
        .build()
        .unwrap();
    let (limiter, store) = limiter_with("listOrders", policy);

    let ctx = CallContext::new("listOrders").session_id("s1");
    limiter.intercept(&ctx, || async {}).await.unwrap();

    assert_eq!(store.snapshot("LISTORDERS_s1").unwrap().count, 1);
}

#[tokio::test]
async fn test_wrapped_result_passes_through_unchanged() {
    #[derive(Debug, PartialEq)]
    struct NotFound(&'static str);

    let (limiter, _store) = limiter_with("test", sample_policy(Scope::PerCaller));
    let ctx = CallContext::new("test");

    let ok: Result<Result<Vec<u8>, NotFound>, LimitError> = limiter
        .intercept(&ctx, || async { Ok(vec![0xde, 0xad]) })
        .await;
    assert_eq!(ok, Ok(Ok(vec![0xde, 0xad])));

    let err: Result<Result<Vec<u8>, NotFound>, LimitError> = limiter
        .intercept(&ctx, || async { Err(NotFound("order 42")) })
        .await;
    assert_eq!(err, Ok(Err(NotFound("order 42"))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_burst_admits_exactly_quota() {
    let policy = PolicyDescriptor::builder(60, 10)
        .resource_name("burst")
        .key("burst")
        .scope(Scope::PerGlobal)
        .build()
        .unwrap();
    let (limiter, store) = limiter_with("burst", policy);
    let limiter = Arc::new(limiter);
    let executed = Arc::new(AtomicUsize::new(0));

    let calls = (0..100).map(|i| {
        let limiter = Arc::clone(&limiter);
        let executed = Arc::clone(&executed);
        tokio::spawn(async move {
            let ctx = CallContext::new("burst").session_id(format!("caller-{}", i));
            limiter
                .intercept(&ctx, || async {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
                .await
        })
    });

    let results = join_all(calls).await;
    let admitted = results
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|outcome| outcome.is_ok())
        .count();

    assert_eq!(admitted, 10);
    assert_eq!(executed.load(Ordering::SeqCst), 10);
    assert_eq!(store.snapshot("burst_GLOBAL").unwrap().count, 100);
}
