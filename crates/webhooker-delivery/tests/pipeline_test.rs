//! End-to-end pipeline tests: broadcast, claim, deliver, settle.
//!
//! Time is driven by a `TestClock` so multi-day backoff schedules run
//! instantly. Lease timing runs on the real clock. Subscribers are wiremock
//! servers.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use webhooker_core::{models::NewSubscriber, Clock, RealClock, TestClock};
use webhooker_delivery::{
    client::ClientConfig, storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine,
    EngineStats,
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

struct Pipeline {
    storage: MockDeliveryStorage,
    clock: TestClock,
    engine: DeliveryEngine,
}

impl Pipeline {
    fn new() -> Self {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let engine = DeliveryEngine::with_storage(
            Arc::new(storage.clone()),
            DeliveryConfig::default(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self { storage, clock, engine }
    }

    async fn subscribe(&self, url: &str, events: &[&str]) {
        let subscriber = NewSubscriber::new(url)
            .with_subscriptions(events.iter().copied())
            .into_subscriber(Utc::now())
            .unwrap();
        self.storage.add_subscriber(subscriber).await;
    }

    /// Jumps past any possible backoff for the next execution.
    fn skip_days(&self, days: u64) {
        self.clock.advance(Duration::from_secs(days * 24 * 60 * 60));
    }
}

async fn server_returning(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(status)).mount(&server).await;
    server
}

#[tokio::test]
async fn successful_delivery_removes_job() -> Result<()> {
    let server = server_returning(200).await;
    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;

    let report = p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;
    assert_eq!(report.enqueued.len(), 1);

    assert_eq!(p.engine.process_due_jobs().await?, 1);
    assert!(p.storage.jobs().await.is_empty());

    let stats = p.engine.stats().await;
    assert_eq!(stats.successful_deliveries, 1);
    assert_eq!(stats.jobs_processed, 1);
    Ok(())
}

#[tokio::test]
async fn failed_delivery_is_rescheduled_with_backoff() -> Result<()> {
    let server = server_returning(500).await;
    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;
    p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;

    let failed_at = p.clock.now_utc();
    p.engine.process_due_jobs().await?;

    let jobs = p.storage.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempt_number, 1);
    assert!(jobs[0].locked_until.is_none());
    assert!(jobs[0].run_at >= failed_at + chrono::Duration::seconds(31));
    assert!(jobs[0].run_at < failed_at + chrono::Duration::seconds(601));

    // Not due yet.
    assert_eq!(p.engine.process_due_jobs().await?, 0);

    p.clock.advance(Duration::from_secs(601));
    assert_eq!(p.engine.process_due_jobs().await?, 1);
    assert_eq!(p.storage.jobs().await[0].attempt_number, 2);
    Ok(())
}

#[tokio::test]
async fn job_is_discarded_after_ten_executions() -> Result<()> {
    let server = server_returning(503).await;
    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;
    let report = p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;

    for _ in 0..10 {
        assert_eq!(p.engine.process_due_jobs().await?, 1);
        p.skip_days(2);
    }

    assert!(p.storage.jobs().await.is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 10);

    let stats = p.engine.stats().await;
    assert_eq!(stats.retries_scheduled, 9);
    assert_eq!(stats.jobs_discarded, 1);

    // No dead letter: the attempt stays with its last response.
    let attempt = p.storage.attempt(report.enqueued[0]).await.unwrap();
    assert_eq!(attempt.response.unwrap().status_code(), Some(503));
    Ok(())
}

#[tokio::test]
async fn terminal_failure_removes_job_without_retry() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let p = Pipeline::new();
    p.subscribe(&format!("http://{addr}/hooks"), &["*"]).await;
    p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;

    p.engine.process_due_jobs().await?;

    assert!(p.storage.jobs().await.is_empty());
    let stats = p.engine.stats().await;
    assert_eq!(stats.terminal_failures, 1);
    assert_eq!(stats.subscribers_disabled, 1);

    // Disabled subscribers receive nothing from later broadcasts.
    let report = p.engine.broadcaster().broadcast("user.created", json!({"id": 2})).await?;
    assert_eq!(report.matched, 0);
    Ok(())
}

#[tokio::test]
async fn subscriber_disabled_while_pending_is_skipped() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;
    p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;

    let subscriber_id = p.storage.attempts().await[0].subscriber_id;
    p.storage.set_enabled(subscriber_id, false).await;

    p.engine.process_due_jobs().await?;

    assert!(p.storage.jobs().await.is_empty());
    assert_eq!(p.engine.stats().await.skipped, 1);
    Ok(())
}

#[tokio::test]
async fn storage_failure_during_delivery_reschedules() -> Result<()> {
    let server = server_returning(200).await;
    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;
    p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;
    p.storage.fail_next_records(1).await;

    p.engine.process_due_jobs().await?;

    let jobs = p.storage.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].attempt_number, 1);

    p.skip_days(1);
    p.engine.process_due_jobs().await?;
    assert!(p.storage.jobs().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn replayed_attempt_is_delivered_again() -> Result<()> {
    let server = server_returning(200).await;
    let p = Pipeline::new();
    p.subscribe(&server.uri(), &["*"]).await;
    let report = p.engine.broadcaster().broadcast("user.created", json!({"id": 1})).await?;
    p.engine.process_due_jobs().await?;

    p.engine.broadcaster().replay(report.enqueued[0]).await?;
    p.engine.process_due_jobs().await?;

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(p.storage.response_history(report.enqueued[0]).await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn queued_jobs_are_not_redelivered_while_a_batch_runs() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(120)))
        .mount(&server)
        .await;

    let storage = MockDeliveryStorage::new();
    let subscriber = NewSubscriber::new(server.uri()).into_subscriber(Utc::now()).unwrap();
    storage.add_subscriber(subscriber).await;

    // Two sequential deliveries outlast one lease, but each stays well inside it.
    let config = DeliveryConfig {
        batch_size: 2,
        job_lease: Duration::from_millis(200),
        client_config: ClientConfig { timeout: Duration::from_millis(150), ..Default::default() },
        ..Default::default()
    };
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let first =
        DeliveryEngine::with_storage(Arc::new(storage.clone()), config.clone(), clock.clone())?;
    let second = DeliveryEngine::with_storage(Arc::new(storage.clone()), config, clock)?;

    first.broadcaster().broadcast("user.created", json!({"n": 1})).await?;
    first.broadcaster().broadcast("user.created", json!({"n": 2})).await?;

    let (claimed_first, claimed_second) = tokio::join!(first.process_due_jobs(), async {
        tokio::time::sleep(Duration::from_millis(210)).await;
        second.process_due_jobs().await
    });

    assert_eq!(claimed_first?, 2);
    assert_eq!(claimed_second?, 0);

    let payloads: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["payload"].clone())
        .collect();
    assert_eq!(payloads, vec![json!({"n": 1}), json!({"n": 2})]);
    Ok(())
}

#[tokio::test]
async fn engine_runs_with_background_workers() -> Result<()> {
    let p = Pipeline::new();
    let mut engine = p.engine;

    engine.start().await?;
    assert_eq!(engine.stats().await.active_workers, 3);
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn fresh_engine_has_empty_stats() {
    let p = Pipeline::new();
    assert_eq!(p.engine.stats().await, EngineStats::default());
}
