mod common;

use common::{eventually, spawn_processor};
use hyper::StatusCode;
use payments_worker::health_monitor::{HealthMonitor, HealthMonitorConfig};
use payments_worker::payment::{Payment, PaymentRecord};
use payments_worker::payment_processor::{
    FailureKind, ForwardOutcome, PaymentProcessor, ProcessorClient, ProcessorClientConfig,
};
use payments_worker::processor_type::ProcessorType;
use payments_worker::selector::{HealthAware, HealthAwareConfig, ProcessorSelector};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use tokio_util::sync::CancellationToken;

const PROCESSED: &str = r#"{"message":"payment processed successfully"}"#;

fn client(default_url: &str, fallback_url: &str) -> PaymentProcessor {
    PaymentProcessor::new(&ProcessorClientConfig {
        default_url: default_url.to_string(),
        fallback_url: fallback_url.to_string(),
        connect_timeout: Duration::from_millis(500),
        pool_max_idle_per_host: 4,
        pool_idle_timeout: Duration::from_secs(10),
    })
    .unwrap()
}

fn record() -> PaymentRecord {
    let payment = Payment::new(
        "4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3".parse().unwrap(),
        dec!(19.90),
    );
    PaymentRecord::new(&payment, datetime!(2025-07-15 12:34:56.789 UTC))
}

/// A local address nothing listens on.
async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[tokio::test]
async fn success_posts_the_payment_record() {
    let (url, seen) = spawn_processor(StatusCode::OK, Duration::ZERO, PROCESSED).await;
    let processor = client(&url, &url);

    let outcome = processor
        .forward(ProcessorType::Default, &record(), Duration::from_secs(1))
        .await;
    assert_eq!(outcome, ForwardOutcome::Success);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["correlationId"], "4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3");
    assert_eq!(seen[0]["amount"], 19.9);
    assert_eq!(seen[0]["requestedAt"], "2025-07-15T12:34:56.789Z");
}

#[tokio::test]
async fn targets_the_chosen_processor() {
    let (default_url, default_seen) = spawn_processor(StatusCode::OK, Duration::ZERO, PROCESSED).await;
    let (fallback_url, fallback_seen) =
        spawn_processor(StatusCode::OK, Duration::ZERO, PROCESSED).await;
    let processor = client(&default_url, &fallback_url);

    let outcome = processor
        .forward(ProcessorType::Fallback, &record(), Duration::from_secs(1))
        .await;
    assert!(outcome.is_success());
    assert_eq!(default_seen.lock().unwrap().len(), 0);
    assert_eq!(fallback_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_success_status_is_a_failure() {
    let (url, _) = spawn_processor(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO, "").await;
    let processor = client(&url, &url);

    let outcome = processor
        .forward(ProcessorType::Default, &record(), Duration::from_secs(1))
        .await;
    assert_eq!(outcome, ForwardOutcome::Failure(FailureKind::Status(500)));

    let (url, _) = spawn_processor(StatusCode::UNPROCESSABLE_ENTITY, Duration::ZERO, "").await;
    let processor = client(&url, &url);
    let outcome = processor
        .forward(ProcessorType::Fallback, &record(), Duration::from_secs(1))
        .await;
    assert_eq!(outcome, ForwardOutcome::Failure(FailureKind::Status(422)));
}

#[tokio::test]
async fn slow_processor_hits_the_deadline() {
    let (url, _) = spawn_processor(StatusCode::OK, Duration::from_millis(500), PROCESSED).await;
    let processor = client(&url, &url);

    let started = tokio::time::Instant::now();
    let outcome = processor
        .forward(ProcessorType::Default, &record(), Duration::from_millis(50))
        .await;
    assert_eq!(outcome, ForwardOutcome::Failure(FailureKind::Timeout));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn unreachable_processor_is_a_connect_failure() {
    let url = closed_port().await;
    let processor = client(&url, &url);

    let outcome = processor
        .forward(ProcessorType::Default, &record(), Duration::from_secs(1))
        .await;
    assert_eq!(outcome, ForwardOutcome::Failure(FailureKind::Connect));
}

#[tokio::test]
async fn health_probe_steers_selection_to_fallback() {
    let (default_url, _) = spawn_processor(
        StatusCode::OK,
        Duration::ZERO,
        r#"{"failing":true,"minResponseTime":0}"#,
    )
    .await;
    let (fallback_url, _) = spawn_processor(
        StatusCode::OK,
        Duration::ZERO,
        r#"{"failing":false,"minResponseTime":5}"#,
    )
    .await;

    let selector = Arc::new(HealthAware::new(HealthAwareConfig::default()));
    assert_eq!(selector.select(), ProcessorType::Default);

    let monitor = HealthMonitor::new(
        &default_url,
        &fallback_url,
        HealthMonitorConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
            max_acceptable_response_time: Duration::from_millis(50),
        },
        selector.clone(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let handle = monitor.start(shutdown.clone());

    assert!(
        eventually(Duration::from_secs(5), || {
            let selector = selector.clone();
            async move { selector.select() == ProcessorType::Fallback }
        })
        .await
    );
    assert!(!selector.is_healthy(ProcessorType::Default));
    assert!(selector.is_healthy(ProcessorType::Fallback));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn unreachable_health_endpoint_leaves_selection_alone() {
    let url = closed_port().await;
    let selector = Arc::new(HealthAware::new(HealthAwareConfig::default()));

    let monitor = HealthMonitor::new(
        &url,
        &url,
        HealthMonitorConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
            max_acceptable_response_time: Duration::from_millis(50),
        },
        selector.clone(),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let handle = monitor.start(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(selector.select(), ProcessorType::Default);

    shutdown.cancel();
    handle.await.unwrap();
}
