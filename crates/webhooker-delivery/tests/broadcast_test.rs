//! Fan-out tests against in-memory storage.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use webhooker_core::{models::NewSubscriber, Subscriber, TestClock};
use webhooker_delivery::{storage::mock::MockDeliveryStorage, Broadcaster, DeliveryError};

fn subscriber(url: &str, events: &[&str]) -> Subscriber {
    NewSubscriber::new(url)
        .with_subscriptions(events.iter().copied())
        .into_subscriber(Utc::now())
        .unwrap()
}

fn broadcaster(storage: &MockDeliveryStorage) -> Broadcaster {
    Broadcaster::new(Arc::new(storage.clone()), Arc::new(TestClock::new()))
}

#[tokio::test]
async fn no_enabled_subscribers_creates_nothing() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let disabled = subscriber("https://a.example.com/hooks", &["*"]);
    storage.add_subscriber(disabled.clone()).await;
    storage.set_enabled(disabled.id, false).await;

    let report = broadcaster(&storage).broadcast("user.created", json!({"id": 1})).await?;

    assert_eq!(report.matched, 0);
    assert!(report.enqueued.is_empty());
    assert!(storage.attempts().await.is_empty());
    assert!(storage.jobs().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn wildcard_and_named_subscriptions_match() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let wildcard = subscriber("https://a.example.com/hooks", &["*"]);
    let named = subscriber("https://b.example.com/hooks", &["user.created"]);
    let other = subscriber("https://c.example.com/hooks", &["invoice.paid"]);
    for s in [&wildcard, &named, &other] {
        storage.add_subscriber(s.clone()).await;
    }

    let report = broadcaster(&storage).broadcast("user.created", json!({"id": 1})).await?;

    assert_eq!(report.event, "user.created");
    assert_eq!(report.matched, 2);
    let owners: Vec<_> = storage.attempts().await.iter().map(|a| a.subscriber_id).collect();
    assert_eq!(owners, vec![wildcard.id, named.id]);
    Ok(())
}

#[tokio::test]
async fn attempts_follow_registry_order_and_start_unsent() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let subscribers: Vec<_> = (0..4)
        .map(|i| subscriber(&format!("https://s{i}.example.com/hooks"), &["*"]))
        .collect();
    for s in &subscribers {
        storage.add_subscriber(s.clone()).await;
    }

    let payload = json!({"order": {"id": 42, "total": "9.99"}});
    let report = broadcaster(&storage).broadcast("order.created", payload.clone()).await?;

    let attempts = storage.attempts().await;
    assert_eq!(report.enqueued, attempts.iter().map(|a| a.id).collect::<Vec<_>>());
    for (attempt, subscriber) in attempts.iter().zip(&subscribers) {
        assert_eq!(attempt.subscriber_id, subscriber.id);
        assert_eq!(attempt.event, "order.created");
        assert_eq!(attempt.payload.as_value(), &payload);
        assert!(attempt.response.is_none());
    }

    let jobs = storage.jobs().await;
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.attempt_number == 0 && j.locked_until.is_none()));
    Ok(())
}

#[tokio::test]
async fn failed_enqueue_keeps_attempt_and_continues() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    storage.add_subscriber(subscriber("https://a.example.com/hooks", &["*"])).await;
    storage.add_subscriber(subscriber("https://b.example.com/hooks", &["*"])).await;
    storage.fail_next_enqueues(1).await;

    let report = broadcaster(&storage).broadcast("user.created", json!({"id": 1})).await?;

    assert_eq!(report.matched, 2);
    assert_eq!(report.unqueued.len(), 1);
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(storage.attempts().await.len(), 2);
    assert_eq!(storage.jobs().await.len(), 1);

    // The stranded attempt can be queued by hand.
    broadcaster(&storage).replay(report.unqueued[0]).await?;
    assert_eq!(storage.jobs().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn broadcast_is_not_deduplicated() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    storage.add_subscriber(subscriber("https://a.example.com/hooks", &["*"])).await;
    let broadcaster = broadcaster(&storage);

    broadcaster.broadcast("user.created", json!({"id": 1})).await?;
    broadcaster.broadcast("user.created", json!({"id": 1})).await?;

    assert_eq!(storage.attempts().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_input_touches_no_storage() {
    let storage = MockDeliveryStorage::new();
    storage.add_subscriber(subscriber("https://a.example.com/hooks", &["*"])).await;

    let err = broadcaster(&storage).broadcast("", json!({"id": 1})).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidInput { .. }));

    let err = broadcaster(&storage).broadcast("user.created", json!(null)).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidInput { .. }));

    assert!(storage.attempts().await.is_empty());
}
