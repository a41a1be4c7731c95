#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use convoguard_channels::{BreakerConfig, CircuitBreaker, OutboundChannel, OutboundConfig, OutboundDispatcher};
use convoguard_compliance::{AuditLog, AuditLogConfig, DeletionRegistry, InMemoryAuditStore, RetentionPolicy};
use convoguard_core::{ConvoResult, InboundEvent, OutboundMessage, SessionState};
use convoguard_gateway::{AuthConfig, GatewayServer};
use convoguard_orchestrator::{
    ConvoContext, Decision, DecisionEngine, InboundDispatcher, OrchestratorConfig, SessionOrchestrator,
};
use convoguard_security::{EncryptionKey, Keyring, RateLimiter};
use convoguard_session::{EncryptedSessionStore, InMemoryKv, StateCache};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct NullChannel;

#[async_trait]
impl OutboundChannel for NullChannel {
    fn name(&self) -> &str {
        "null"
    }
    async fn send(&self, _message: &OutboundMessage) -> ConvoResult<()> {
        Ok(())
    }
}

/// Stores the last message text as the payload.
#[derive(Default)]
struct EchoEngine {
    stall: AtomicBool,
}

#[async_trait]
impl DecisionEngine for EchoEngine {
    async fn decide(&self, _state: &SessionState, event: &InboundEvent) -> ConvoResult<Decision> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        let text = event.payload["text"].as_str().unwrap_or_default().to_string();
        Ok(Decision::new(text.into_bytes()).with_reply("ok"))
    }
}

/// Helper: build a test server on a random port, returning the address.
async fn start_test_server(engine: Arc<EchoEngine>, api_keys: Vec<String>, queue: usize) -> String {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    let store = Arc::new(EncryptedSessionStore::new(
        Arc::new(InMemoryKv::new()),
        Arc::new(Keyring::new(1, EncryptionKey::generate())),
    ));
    let ctx = ConvoContext {
        limiter: Arc::new(RateLimiter::new(1_000, Duration::from_secs(60), 1_000)),
        cache: Arc::new(StateCache::new(10).unwrap()),
        store,
        audit: Arc::new(AuditLog::new(audit_store.clone(), AuditLogConfig::default())),
        audit_store,
        outbound: Arc::new(OutboundDispatcher::new(
            Arc::new(NullChannel),
            Arc::new(CircuitBreaker::new("null", &BreakerConfig::default())),
            &OutboundConfig::default(),
        )),
        deletions: Arc::new(DeletionRegistry::in_memory(chrono::Duration::hours(72))),
        retention: RetentionPolicy::default(),
    };
    let orchestrator = Arc::new(SessionOrchestrator::new(ctx, engine, &OrchestratorConfig::default()));
    let (inbound, _loop) = InboundDispatcher::spawn(orchestrator.clone(), queue, 1);
    let app = GatewayServer::build(orchestrator, inbound, AuthConfig::new(api_keys));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Small yield to let the server task start
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("127.0.0.1:{}", addr.port())
}

fn event_body(conversation: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "sender_id": conversation,
        "conversation_id": conversation,
        "payload": { "text": text }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let addr = start_test_server(Arc::default(), vec![], 16).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "convoguard");
    assert_eq!(body["components"]["breaker"]["status"], "closed");
}

#[tokio::test]
async fn test_event_is_accepted_and_processed() {
    let addr = start_test_server(Arc::default(), vec![], 16).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .json(&event_body("5215511112222", "hola"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let mut found = None;
    for _ in 0..40 {
        let resp = client
            .get(format!("http://{addr}/v1/sessions/5215511112222"))
            .header("x-operator", "agent-1")
            .send()
            .await
            .unwrap();
        if resp.status() == 200 {
            found = Some(resp.json::<serde_json::Value>().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let session = found.expect("event was never processed");
    assert_eq!(session["version"], 1);
}

#[tokio::test]
async fn test_invalid_events_are_rejected() {
    let addr = start_test_server(Arc::default(), vec![], 16).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .json(&event_body("", "hola"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn test_api_requires_key_but_health_does_not() {
    let addr = start_test_server(Arc::default(), vec!["k1".into()], 16).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .json(&event_body("s1", "hola"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("http://{addr}/v1/events"))
        .bearer_auth("k1")
        .json(&event_body("s1", "hola"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let resp = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_full_queue_returns_503() {
    let engine = Arc::new(EchoEngine::default());
    engine.stall.store(true, Ordering::SeqCst);
    let addr = start_test_server(engine, vec![], 1).await;
    let client = reqwest::Client::new();

    let mut statuses = Vec::new();
    for i in 0..4 {
        let resp = client
            .post(format!("http://{addr}/v1/events"))
            .json(&event_body(&format!("s{i}"), "hola"))
            .send()
            .await
            .unwrap();
        statuses.push(resp.status().as_u16());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(&statuses[..3], &[202, 202, 202]);
    assert_eq!(statuses[3], 503);
}

#[tokio::test]
async fn test_inspect_requires_operator() {
    let addr = start_test_server(Arc::default(), vec![], 16).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/v1/sessions/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("http://{addr}/v1/sessions/unknown"))
        .header("x-operator", "agent-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_deletion_request_and_cancel() {
    let addr = start_test_server(Arc::default(), vec![], 16).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/v1/sessions/s1/deletion"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let request: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(request["status"], "requested");
    let id = request["id"].as_str().unwrap().to_string();

    let resp = client
        .delete(format!("http://{addr}/v1/deletions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cancelled: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(cancelled["status"], "cancelled");

    let resp = client
        .delete(format!("http://{addr}/v1/deletions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}
