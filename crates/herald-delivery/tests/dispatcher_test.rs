//! Integration tests for the delivery dispatcher.
//!
//! Runs single deliveries against a wiremock receiver over mock storage
//! and a test clock: success and error classification, retry scheduling,
//! Retry-After handling, attempt auditing, signing, and the guard rails
//! around terminal deliveries.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use chrono::Utc;
use herald_core::{
    models::{Delivery, DeliveryStatus, Endpoint, EndpointId},
    signer,
    time::{Clock, TestClock},
};
use herald_delivery::{
    client::{ClientConfig, DeliveryClient},
    dispatcher::Dispatcher,
    retry::RetryPolicy,
    storage::mock::MockDeliveryStorage,
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

fn jitterless_policy() -> RetryPolicy {
    RetryPolicy { jitter_fraction: 0.0, ..RetryPolicy::default() }
}

fn test_clock() -> Arc<TestClock> {
    Arc::new(TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000)))
}

fn build_dispatcher(
    storage: Arc<MockDeliveryStorage>,
    clock: Arc<TestClock>,
    policy: RetryPolicy,
) -> Dispatcher {
    let client = DeliveryClient::new(ClientConfig::default()).unwrap();
    Dispatcher::new(storage, Arc::new(client), policy, clock)
}

fn orphan_endpoint(url: &str) -> Endpoint {
    let now = Utc::now();
    Endpoint {
        id: EndpointId::new(),
        name: "orphan".to_string(),
        url: url.to_string(),
        description: None,
        secret: signer::generate_secret(),
        event_types: vec!["order.placed".to_string()],
        is_active: true,
        headers: sqlx::types::Json(HashMap::new()),
        max_attempts: 3,
        timeout_seconds: 5,
        total_deliveries: 0,
        successful_deliveries: 0,
        failed_deliveries: 0,
        last_delivery_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn acknowledged_delivery_is_marked_success_and_audited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("received"))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint =
        storage.add_endpoint(format!("{}/hooks", server.uri()), &["order.placed"]).await;
    let delivery =
        Delivery::new(&endpoint, "order.placed", br#"{"id":42}"#.to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(outcome.success);
    assert!(outcome.error.is_none());

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Success);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_response_status, Some(200));
    assert_eq!(row.last_response_body.as_deref(), Some("received"));
    assert!(row.completed_at.is_some());
    assert!(row.next_retry_at.is_none());

    let attempts = storage.recorded_attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert!(attempts[0].succeeded);
    assert_eq!(attempts[0].response_status, Some(200));
    assert_eq!(attempts[0].response_body.as_deref(), Some("received"));

    let counters = storage.endpoint(endpoint.id).await.unwrap();
    assert_eq!(counters.total_deliveries, 1);
    assert_eq!(counters.successful_deliveries, 1);
    assert_eq!(counters.failed_deliveries, 0);
}

#[tokio::test]
async fn persistent_server_errors_exhaust_the_budget_and_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    // add_endpoint caps the delivery at three attempts.
    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let now = clock.now_utc();

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.next_retry_at, Some(now + chrono::Duration::seconds(60)));

    dispatcher.dispatch(&delivery).await;
    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.attempts, 2);
    // Backoff doubles: 60s after the first failure, 120s after the second.
    assert_eq!(row.next_retry_at, Some(now + chrono::Duration::seconds(120)));

    dispatcher.dispatch(&delivery).await;
    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::DeadLetter);
    assert_eq!(row.attempts, 3);
    assert!(row.next_retry_at.is_none());
    assert!(row.completed_at.is_some());
    assert_eq!(row.last_response_status, Some(500));
    assert_eq!(row.error_category.as_deref(), Some("server_error"));

    let attempts = storage.recorded_attempts().await;
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(attempts.iter().all(|a| !a.succeeded));

    // The endpoint sees one terminal outcome, not one per attempt.
    let counters = storage.endpoint(endpoint.id).await.unwrap();
    assert_eq!(counters.total_deliveries, 1);
    assert_eq!(counters.failed_deliveries, 1);
}

#[tokio::test]
async fn permanent_client_error_dead_letters_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such hook"))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("client error 404"));

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::DeadLetter);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_response_status, Some(404));
    assert_eq!(row.error_category.as_deref(), Some("client_error"));

    assert_eq!(storage.recorded_attempts().await.len(), 1);
}

#[tokio::test]
async fn redirect_statuses_are_permanent_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(301).append_header("Location", "https://elsewhere"))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    // Redirects are never followed; the 3xx dead-letters like any other
    // non-retryable status.
    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("unexpected status 301"));
    assert!(storage.verify_status(delivery.id, DeliveryStatus::DeadLetter).await);
}

#[tokio::test]
async fn timeout_is_retried_and_the_next_attempt_can_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let mut endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    endpoint.timeout_seconds = 1;
    storage.insert_endpoint(endpoint.clone()).await;

    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("timed out"));

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.error_category.as_deref(), Some("timeout"));
    assert!(row.last_response_status.is_none());

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(outcome.success);

    let attempts = storage.recorded_attempts().await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert!(!attempts[0].succeeded);
    assert!(attempts[0].response_status.is_none());
    assert_eq!(attempts[0].error_category.as_deref(), Some("timeout"));
    assert_eq!(attempts[1].attempt_number, 2);
    assert!(attempts[1].succeeded);
    assert_eq!(attempts[1].response_status, Some(200));
}

#[tokio::test]
async fn connection_failure_schedules_a_retry() {
    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    // Nothing listens on port 1.
    let endpoint = storage.add_endpoint("http://127.0.0.1:1", &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.error_category.as_deref(), Some("connection"));
    assert!(row.last_response_status.is_none());
    assert_eq!(row.next_retry_at, Some(clock.now_utc() + chrono::Duration::seconds(60)));

    let attempts = storage.recorded_attempts().await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].response_status.is_none());
    assert_eq!(attempts[0].error_category.as_deref(), Some("connection"));
}

#[tokio::test]
async fn rate_limited_delivery_honors_retry_after_exactly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_string("slow down")
                .append_header("Retry-After", "120"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    // Full-jitter default policy: the requested delay must not be jittered.
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), RetryPolicy::default());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let expected = clock.now_utc() + chrono::Duration::seconds(120);
    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.next_retry_at, Some(expected));
    assert_eq!(row.error_category.as_deref(), Some("rate_limited"));
}

#[tokio::test]
async fn idempotency_key_header_is_identical_across_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    dispatcher.dispatch(&delivery).await;
    dispatcher.dispatch(&delivery).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let key =
            request.headers.get("X-Herald-Delivery-Id").unwrap().to_str().unwrap();
        assert_eq!(key, delivery.idempotency_key);
    }
}

#[tokio::test]
async fn attempts_are_signed_with_the_secret_current_at_send_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let payload = br#"{"id":42}"#.to_vec();
    let delivery = Delivery::new(&endpoint, "order.placed", payload.clone(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    dispatcher.dispatch(&delivery).await;

    // Rotate the signing secret between the attempts.
    let mut rotated = endpoint.clone();
    rotated.secret = signer::generate_secret();
    storage.insert_endpoint(rotated.clone()).await;

    dispatcher.dispatch(&delivery).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let verify = |request: &Request, secret: &str| {
        let timestamp: i64 = request
            .headers
            .get("X-Herald-Timestamp")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let signature = request.headers.get("X-Herald-Signature").unwrap().to_str().unwrap();
        signer::verify(&payload, secret, timestamp, signature, Duration::from_secs(300), timestamp)
    };

    assert!(verify(&requests[0], &endpoint.secret).is_valid);
    assert!(verify(&requests[1], &rotated.secret).is_valid);
    assert!(!verify(&requests[1], &endpoint.secret).is_valid);
}

#[tokio::test]
async fn sensitive_endpoint_headers_are_redacted_in_the_attempt_log() {
    let server = MockServer::start().await;
    // The wire carries the real credential; only the audit copy is masked.
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer sekrit-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let mut endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let mut custom = HashMap::new();
    custom.insert("Authorization".to_string(), "Bearer sekrit-token".to_string());
    custom.insert("X-Trace".to_string(), "trace-1".to_string());
    endpoint.headers = sqlx::types::Json(custom);
    storage.insert_endpoint(endpoint.clone()).await;

    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(outcome.success);

    let attempts = storage.recorded_attempts().await;
    let recorded = &attempts[0].request_headers;
    assert_eq!(recorded.get("Authorization").map(String::as_str), Some("[redacted]"));
    assert_eq!(recorded.get("X-Trace").map(String::as_str), Some("trace-1"));
    assert!(recorded.contains_key("X-Herald-Signature"));
}

#[tokio::test]
async fn missing_endpoint_dead_letters_the_delivery() {
    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    // The delivery exists but its endpoint was never registered.
    let orphan = orphan_endpoint("https://example.com/hooks");
    let delivery = Delivery::new(&orphan, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("not found"));

    let row = storage.delivery(delivery.id).await.unwrap();
    assert_eq!(row.status, DeliveryStatus::DeadLetter);
    assert_eq!(row.error_category.as_deref(), Some("internal"));
    assert_eq!(row.attempts, 0);
    assert!(storage.recorded_attempts().await.is_empty());
}

#[tokio::test]
async fn terminal_delivery_refuses_another_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MockDeliveryStorage::new());
    let clock = test_clock();
    let dispatcher = build_dispatcher(storage.clone(), clock.clone(), jitterless_policy());

    let endpoint = storage.add_endpoint(server.uri(), &["order.placed"]).await;
    let delivery = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), clock.now_utc());
    storage.insert_delivery(delivery.clone()).await;

    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(outcome.success);

    // The receiver acknowledged; a second dispatch must not reach it.
    let outcome = dispatcher.dispatch(&delivery).await;
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("cannot begin an attempt"));
    assert!(storage.verify_status(delivery.id, DeliveryStatus::Success).await);
    assert_eq!(storage.recorded_attempts().await.len(), 1);
}
