use std::time::Duration;

use hermes_core::rate_limit::{
    ConcurrencySlots, RateCounterStore, RateDecision, RateLimiter, RateLimitPolicy, Scope,
};
use hermes_db::PgLimiterStore;

use crate::common::setup_test_db;

#[tokio::test]
#[ignore = "requires Docker"]
async fn counter_increments_atomically() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    for expected in 1..=5u64 {
        let count = store
            .increment_and_get("rl:tenant:acme:1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(count, expected);
    }
    // Different bucket, independent count.
    assert_eq!(
        store
            .increment_and_get("rl:tenant:acme:2", Duration::from_secs(60))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn expired_buckets_are_purged() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool.clone());

    store
        .increment_and_get("rl:old", Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Any increment purges lapsed rows.
    store
        .increment_and_get("rl:new", Duration::from_secs(60))
        .await
        .unwrap();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM rate_counters WHERE key = 'rl:old'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn limiter_denies_over_budget_through_postgres() {
    let (pool, _container) = setup_test_db().await;
    let limiter = RateLimiter::new(PgLimiterStore::new(pool));
    let scope = Scope::Tenant("acme".into());
    let policy = RateLimitPolicy::new(2, Duration::from_secs(3600));

    assert_eq!(
        limiter.try_acquire(&scope, &policy).await.unwrap(),
        RateDecision::Allowed
    );
    assert_eq!(
        limiter.try_acquire(&scope, &policy).await.unwrap(),
        RateDecision::Allowed
    );
    assert!(matches!(
        limiter.try_acquire(&scope, &policy).await.unwrap(),
        RateDecision::Denied { .. }
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn slots_cap_and_release() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    assert!(store.try_acquire("cc:group:stripe", 2).await.unwrap());
    assert!(store.try_acquire("cc:group:stripe", 2).await.unwrap());
    assert!(!store.try_acquire("cc:group:stripe", 2).await.unwrap());

    store.release("cc:group:stripe").await.unwrap();
    assert!(store.try_acquire("cc:group:stripe", 2).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn releasing_unknown_slot_is_harmless() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);
    store.release("cc:ghost").await.unwrap();
    assert!(store.try_acquire("cc:ghost", 1).await.unwrap());
}
