use std::time::Duration;

use hermes_core::job::{CreateJobRequest, JobStatus};
use hermes_core::queue_store::{LeaseToken, QueueStore};
use hermes_db::PgQueueStore;

use crate::common::setup_test_db;

fn test_request() -> CreateJobRequest {
    CreateJobRequest::new("acme", "default", "https://example.com/hook", "POST")
        .with_header("content-type", "application/json")
        .with_body(r#"{"event":"ping"}"#)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);

    let job = store.enqueue(test_request().with_max_retries(5)).await.unwrap();

    assert_eq!(job.tenant_id, "acme");
    assert_eq!(job.queue_id, "default");
    assert_eq!(job.url, "https://example.com/hook");
    assert_eq!(job.method, "POST");
    assert_eq!(job.headers.get("content-type").unwrap(), "application/json");
    assert_eq!(job.body.as_deref(), Some(r#"{"event":"ping"}"#));
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries_left, 5);
    assert_eq!(job.max_retries, 5);
    assert!(job.error_log.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_moves_job_to_in_progress() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    let job = store.enqueue(test_request()).await.unwrap();

    let (claimed, _token) = store
        .claim_next("acme", "default", Duration::from_secs(60))
        .await
        .unwrap()
        .expect("job should be due");

    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::InProgress);

    // While the lease is live, no second claim succeeds.
    assert!(
        store
            .claim_next("acme", "default", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_is_scoped_by_tenant_and_queue() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    store.enqueue(test_request()).await.unwrap();

    assert!(
        store
            .claim_next("other", "default", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .claim_next("acme", "billing", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn racing_claims_award_a_single_lease() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    store.enqueue(test_request()).await.unwrap();

    // Workers race the SKIP LOCKED claim on one due job.
    let mut claims = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        claims.push(tokio::spawn(async move {
            store
                .claim_next("acme", "default", Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut won = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            won += 1;
        }
    }
    assert_eq!(won, 1, "exactly one racing worker may hold the lease");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_token_is_rejected() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    let job = store.enqueue(test_request()).await.unwrap();
    store
        .claim_next("acme", "default", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let stale = LeaseToken::new();
    let err = store
        .complete(job.id, &stale, JobStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, hermes_core::AppError::LeaseExpired));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn expired_lease_is_reclaimed_and_charges_a_retry() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    store.enqueue(test_request().with_max_retries(2)).await.unwrap();

    let (claimed, _) = store
        .claim_next("acme", "default", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.retries_left, 2);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (reclaimed, _) = store
        .claim_next("acme", "default", Duration::from_secs(60))
        .await
        .unwrap()
        .expect("expired lease should be reclaimable");
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.retries_left, 1);
    assert_eq!(reclaimed.error_log.len(), 1);
    assert!(reclaimed.error_log[0].message.contains("lease expired"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn reenqueue_round_trips_the_error_log() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    store.enqueue(test_request()).await.unwrap();

    let (mut claimed, token) = store
        .claim_next("acme", "default", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    claimed.retries_left -= 1;
    claimed.record_error("HTTP 503", Some(503), Some("upstream sad".into()));
    let next = chrono::Utc::now() + chrono::TimeDelta::seconds(30);
    store
        .reenqueue(claimed.id, &token, &claimed, next)
        .await
        .unwrap();

    let stored = store.get_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.retries_left, claimed.retries_left);
    assert_eq!(stored.error_log.len(), 1);
    assert_eq!(stored.error_log[0].status_code, Some(503));
    assert_eq!(
        stored.error_log[0].response_snippet.as_deref(),
        Some("upstream sad")
    );

    // Not due yet.
    assert!(
        store
            .claim_next("acme", "default", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lease_renewal_extends_ownership() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    let job = store.enqueue(test_request()).await.unwrap();

    let (_, token) = store
        .claim_next("acme", "default", Duration::from_millis(300))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    store
        .renew_lease(job.id, &token, Duration::from_secs(60))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Original TTL has long lapsed, but the renewal keeps the job ours.
    assert!(
        store
            .claim_next("acme", "default", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );
    store
        .complete(job.id, &token, JobStatus::Completed)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cancellation_survives_late_terminal_write() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);
    let job = store.enqueue(test_request()).await.unwrap();
    let (_, token) = store
        .claim_next("acme", "default", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    store.cancel(job.id).await.unwrap();
    assert!(store.is_cancelled(job.id).await.unwrap());

    store
        .complete(job.id, &token, JobStatus::Completed)
        .await
        .unwrap();
    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn dead_letters_list_newest_first_per_tenant() {
    let (pool, _container) = setup_test_db().await;
    let store = PgQueueStore::new(pool);

    for i in 0..3 {
        let job = store
            .enqueue(test_request().with_header("x-seq", i.to_string()))
            .await
            .unwrap();
        let (claimed, token) = store
            .claim_next("acme", "default", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.dead_letter(job.id, &token, &claimed).await.unwrap();
    }

    let dead = store.list_dead_letters("acme", 2).await.unwrap();
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|j| j.status == JobStatus::Failed));
    assert!(store.list_dead_letters("other", 10).await.unwrap().is_empty());
}
