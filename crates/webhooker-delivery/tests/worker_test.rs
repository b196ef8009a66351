//! Delivery worker tests against real HTTP servers.
//!
//! Subscribers are wiremock servers; attempts and subscribers live in
//! `MockDeliveryStorage`. Each test covers one branch of the outcome
//! classification and checks what was recorded on the attempt and whether
//! the subscriber was disabled.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use webhooker_core::models::{
    AttemptResponse, DeliveryAttempt, NewSubscriber, Payload, Subscriber, SubscriberId,
    TransportFailure,
};
use webhooker_delivery::{
    client::{ClientConfig, DeliveryClient, OutboundBody},
    storage::mock::MockDeliveryStorage,
    DeliveryOutcome, HostSuffixTunnelDetector, SkipReason, TerminalReason, TunnelDetector,
};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const GONE_BODY: &str = "Tunnel 3f2a9c1e.ngrok.io not found";

/// Treats every URL as a tunnel so local mock servers can stand in for one.
#[derive(Debug)]
struct LocalTunnel(HostSuffixTunnelDetector);

impl LocalTunnel {
    fn new() -> Self {
        Self(HostSuffixTunnelDetector::ngrok().unwrap())
    }
}

impl TunnelDetector for LocalTunnel {
    fn is_tunnel(&self, _url: &str) -> bool {
        true
    }

    fn is_tunnel_not_found(&self, body: &str) -> bool {
        self.0.is_tunnel_not_found(body)
    }
}

struct Harness {
    storage: MockDeliveryStorage,
    worker: webhooker_delivery::DeliveryWorker,
    subscriber: Subscriber,
    attempt: DeliveryAttempt,
}

impl Harness {
    async fn new(url: &str) -> Self {
        let tunnel = Arc::new(HostSuffixTunnelDetector::ngrok().unwrap());
        Self::with(url, tunnel, ClientConfig::default()).await
    }

    async fn tunnel(url: &str) -> Self {
        Self::with(url, Arc::new(LocalTunnel::new()), ClientConfig::default()).await
    }

    async fn with(url: &str, tunnel: Arc<dyn TunnelDetector>, config: ClientConfig) -> Self {
        let storage = MockDeliveryStorage::new();
        let subscriber = NewSubscriber::new(url)
            .with_subscriptions(["order.created"])
            .into_subscriber(Utc::now())
            .unwrap();
        let attempt = DeliveryAttempt::new(
            subscriber.id,
            "order.created",
            Payload::new(json!({"order_id": 42, "total": "19.99"})).unwrap(),
            Utc::now(),
        )
        .unwrap();

        storage.add_subscriber(subscriber.clone()).await;
        storage.add_attempt(attempt.clone()).await;

        let client = Arc::new(DeliveryClient::new(config).unwrap());
        let worker =
            webhooker_delivery::DeliveryWorker::new(Arc::new(storage.clone()), client, tunnel);

        Self { storage, worker, subscriber, attempt }
    }

    async fn deliver(&self) -> DeliveryOutcome {
        self.worker.deliver(self.attempt.id).await.unwrap()
    }

    async fn recorded(&self) -> Option<AttemptResponse> {
        self.storage.attempt(self.attempt.id).await.unwrap().response
    }

    async fn enabled(&self) -> bool {
        self.storage.subscriber(self.subscriber.id).await.unwrap().enabled
    }
}

async fn server_returning(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn hook_url(server: &MockServer) -> String {
    format!("{}/hooks", server.uri())
}

#[tokio::test]
async fn success_records_full_response() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("content-type", "application/json"))
        .and(header("user-agent", "webhooker/1.0"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("x-trace", "abc").set_body_string("ok"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(&hook_url(&server)).await;
    assert_eq!(h.deliver().await, DeliveryOutcome::Delivered { status: 200 });

    let Some(AttemptResponse::Received { headers, code, body }) = h.recorded().await else {
        panic!("expected a recorded response");
    };
    assert_eq!(code, 200);
    assert_eq!(body, "ok");
    assert_eq!(headers.get("x-trace").map(String::as_str), Some("abc"));
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn posted_body_carries_subscriber_and_payload() -> Result<()> {
    let server = server_returning(204, "").await;
    let h = Harness::new(&hook_url(&server)).await;

    h.deliver().await;

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(body["subscriber_id"], json!(h.subscriber.id));
    assert_eq!(body["subscriber_url"], json!(h.subscriber.url));
    assert_eq!(body["event"], "order.created");
    assert_eq!(body["payload"], json!({"order_id": 42, "total": "19.99"}));
    Ok(())
}

#[tokio::test]
async fn non_tunnel_server_error_retries_and_keeps_subscriber() -> Result<()> {
    let server = server_returning(500, "boom").await;
    let h = Harness::new(&hook_url(&server)).await;

    let outcome = h.deliver().await;
    assert!(outcome.should_retry());

    let recorded = h.recorded().await.unwrap();
    assert_eq!(recorded.status_code(), Some(500));
    assert!(h.enabled().await);
    assert_eq!(h.storage.disable_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn non_tunnel_not_found_page_still_retries() -> Result<()> {
    let server = server_returning(404, GONE_BODY).await;
    let h = Harness::new(&hook_url(&server)).await;

    assert!(h.deliver().await.should_retry());
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn tunnel_not_found_disables_subscriber() -> Result<()> {
    let server = server_returning(404, GONE_BODY).await;
    let h = Harness::tunnel(&hook_url(&server)).await;

    assert_eq!(
        h.deliver().await,
        DeliveryOutcome::Terminal {
            reason: TerminalReason::TunnelNotFound,
            subscriber_disabled: true
        }
    );
    assert_eq!(h.recorded().await.unwrap().status_code(), Some(404));
    assert!(!h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn tunnel_404_with_application_body_retries() -> Result<()> {
    let server = server_returning(404, "no route for /hooks").await;
    let h = Harness::tunnel(&hook_url(&server)).await;

    assert!(h.deliver().await.should_retry());
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn tunnel_bad_gateway_retries() -> Result<()> {
    let server = server_returning(502, "").await;
    let h = Harness::tunnel(&hook_url(&server)).await;

    assert!(h.deliver().await.should_retry());
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn tunnel_gateway_timeout_disables_subscriber() -> Result<()> {
    let server = server_returning(504, "").await;
    let h = Harness::tunnel(&hook_url(&server)).await;

    assert_eq!(
        h.deliver().await,
        DeliveryOutcome::Terminal {
            reason: TerminalReason::TunnelGatewayTimeout,
            subscriber_disabled: true
        }
    );
    assert!(!h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn refused_connection_records_error_and_disables() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let h = Harness::new(&format!("http://{addr}/hooks")).await;

    assert_eq!(
        h.deliver().await,
        DeliveryOutcome::Terminal { reason: TerminalReason::Connection, subscriber_disabled: true }
    );
    assert_eq!(
        h.recorded().await,
        Some(AttemptResponse::Failed { error: TransportFailure::Connection })
    );
    assert!(!h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn tls_failure_records_error_without_disabling() -> Result<()> {
    // A plain HTTP server answers the ClientHello with a 400 page, which
    // the TLS layer rejects as a corrupt record.
    let server = MockServer::start().await;
    let url = format!("https://{}/hooks", server.address());

    let h = Harness::new(&url).await;

    assert_eq!(
        h.deliver().await,
        DeliveryOutcome::Terminal { reason: TerminalReason::Tls, subscriber_disabled: false }
    );
    assert_eq!(h.recorded().await, Some(AttemptResponse::Failed { error: TransportFailure::Tls }));
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn timeout_records_error_without_disabling() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let config = ClientConfig { timeout: Duration::from_millis(50), ..Default::default() };
    let h = Harness::with(
        &hook_url(&server),
        Arc::new(HostSuffixTunnelDetector::ngrok().unwrap()),
        config,
    )
    .await;

    assert_eq!(
        h.deliver().await,
        DeliveryOutcome::Terminal { reason: TerminalReason::Timeout, subscriber_disabled: false }
    );
    assert_eq!(
        h.recorded().await,
        Some(AttemptResponse::Failed { error: TransportFailure::Timeout })
    );
    assert!(h.enabled().await);
    Ok(())
}

#[tokio::test]
async fn repeated_executions_overwrite_outcome() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let h = Harness::new(&hook_url(&server)).await;
    assert!(h.deliver().await.should_retry());
    assert_eq!(h.deliver().await, DeliveryOutcome::Delivered { status: 200 });

    assert_eq!(h.recorded().await.unwrap().status_code(), Some(200));
    let codes: Vec<u16> = h
        .storage
        .response_history(h.attempt.id)
        .await
        .iter()
        .filter_map(AttemptResponse::status_code)
        .collect();
    assert_eq!(codes, [503, 200]);
    Ok(())
}

#[tokio::test]
async fn disabled_subscriber_is_not_contacted() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = Harness::new(&hook_url(&server)).await;
    h.storage.set_enabled(h.subscriber.id, false).await;

    assert_eq!(h.deliver().await, DeliveryOutcome::Skipped(SkipReason::SubscriberDisabled));
    assert_eq!(h.recorded().await, None);
    Ok(())
}

#[tokio::test]
async fn missing_records_are_noops() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = Harness::new(&hook_url(&server)).await;
    assert_eq!(
        h.worker.deliver(webhooker_core::AttemptId::new()).await?,
        DeliveryOutcome::Skipped(SkipReason::AttemptMissing)
    );

    h.storage.remove_subscriber(h.subscriber.id).await;
    assert_eq!(h.deliver().await, DeliveryOutcome::Skipped(SkipReason::SubscriberMissing));
    Ok(())
}

#[tokio::test]
async fn unsubscribed_event_is_skipped() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = Harness::new(&hook_url(&server)).await;
    let other = DeliveryAttempt::new(
        h.subscriber.id,
        "order.refunded",
        Payload::new(json!({"order_id": 42}))?,
        Utc::now(),
    )?;
    let other_id = other.id;
    h.storage.add_attempt(other).await;

    assert_eq!(
        h.worker.deliver(other_id).await?,
        DeliveryOutcome::Skipped(SkipReason::NotSubscribed)
    );
    Ok(())
}

#[tokio::test]
async fn storage_failure_surfaces_as_retryable_error() -> Result<()> {
    let server = server_returning(200, "ok").await;
    let h = Harness::new(&hook_url(&server)).await;
    h.storage.fail_next_records(1).await;

    let err = h.worker.deliver(h.attempt.id).await.unwrap_err();
    assert!(err.is_retryable());
    Ok(())
}

#[test]
fn outbound_body_shape() {
    let subscriber = Subscriber {
        id: SubscriberId(Uuid::from_u128(1)),
        name: "billing".to_string(),
        url: "https://billing.example.com/hooks".to_string(),
        enabled: true,
        subscriptions: webhooker_core::Subscriptions::all(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let attempt = DeliveryAttempt::new(
        subscriber.id,
        "invoice.paid",
        Payload::new(json!({"invoice": "in_123", "amount": 4200})).unwrap(),
        Utc::now(),
    )
    .unwrap();

    insta::assert_json_snapshot!(OutboundBody::new(&attempt, &subscriber), @r#"
    {
      "subscriber_id": "00000000-0000-0000-0000-000000000001",
      "subscriber_url": "https://billing.example.com/hooks",
      "event": "invoice.paid",
      "payload": {
        "amount": 4200,
        "invoice": "in_123"
      }
    }
    "#);
}
