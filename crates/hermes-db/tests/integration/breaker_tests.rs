use std::time::Duration;

use hermes_core::circuit_breaker::{
    Admission, BreakerPolicy, BreakerSnapshot, BreakerStore, CircuitBreaker, CircuitState,
};
use hermes_core::error::AppError;
use hermes_db::PgBreakerStore;

use crate::common::setup_test_db;

#[tokio::test]
#[ignore = "requires Docker"]
async fn unknown_group_reads_as_closed() {
    let (pool, _container) = setup_test_db().await;
    let store = PgBreakerStore::new(pool);

    let snapshot = store.get("stripe").await.unwrap();
    assert_eq!(snapshot, BreakerSnapshot::default());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn first_cas_from_default_creates_the_row() {
    let (pool, _container) = setup_test_db().await;
    let store = PgBreakerStore::new(pool);

    let tripped = BreakerSnapshot {
        failures: 3,
        ..BreakerSnapshot::default()
    };
    assert!(
        store
            .compare_and_set("stripe", &BreakerSnapshot::default(), &tripped)
            .await
            .unwrap()
    );
    assert_eq!(store.get("stripe").await.unwrap(), tripped);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_snapshot_loses_the_cas() {
    let (pool, _container) = setup_test_db().await;
    let store = PgBreakerStore::new(pool);

    let default = BreakerSnapshot::default();
    let first = BreakerSnapshot {
        failures: 1,
        ..BreakerSnapshot::default()
    };
    let second = BreakerSnapshot {
        failures: 2,
        ..BreakerSnapshot::default()
    };

    assert!(store.compare_and_set("g", &default, &first).await.unwrap());
    // A writer still holding the default snapshot must lose.
    assert!(!store.compare_and_set("g", &default, &second).await.unwrap());
    assert_eq!(store.get("g").await.unwrap(), first);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn breaker_trips_and_recovers_through_postgres() {
    let (pool, _container) = setup_test_db().await;
    let store = PgBreakerStore::new(pool);
    let policy = BreakerPolicy {
        failure_threshold: 2,
        trip_duration: Duration::from_millis(100),
        half_open_max_probes: 1,
    };
    let breaker = CircuitBreaker::new("flaky", policy, store.clone());
    let error = AppError::Network("connection reset".into());

    breaker.record_failure(&error).await.unwrap();
    breaker.record_failure(&error).await.unwrap();
    assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
    assert!(matches!(
        breaker.admit().await.unwrap(),
        Admission::Rejected { .. }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(breaker.admit().await.unwrap(), Admission::Allowed { probe: true });
    breaker.record_success().await.unwrap();
    assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
}
