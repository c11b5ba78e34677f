//! Tests for dixi-gateway: broadcast hub, gesture pipeline, vision client,
//! and HTTP routes

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dixi_core::config::{GenerationConfig, TimeoutConfig};
use dixi_core::{
    DixiConfig, Envelope, ExpiringCache, GestureObservation, HandState, Hands, Point3, TrackingSnapshot,
};
use dixi_gateway::server::spawn_cache_sweeper;
use dixi_gateway::*;
use dixi_llm::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ===========================================================================
// Helpers
// ===========================================================================

struct FakeProvider {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn up(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn answer(&self) -> LlmResult<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(text) => Ok(Generation::new(text.clone())),
            None => Err(InferenceError::unavailable(ProviderKind::Ollama, "connection refused")),
        }
    }
}

#[async_trait::async_trait]
impl InferenceProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    async fn probe(&self) -> LlmResult<()> {
        self.answer().map(|_| ())
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationConfig) -> LlmResult<Generation> {
        self.answer()
    }

    async fn generate_stream(&self, _prompt: &str, _params: &GenerationConfig) -> LlmResult<TextStream> {
        let generation = self.answer()?;
        Ok(Box::pin(futures::stream::iter(vec![
            Ok(StreamDelta::Text(generation.text)),
        ])))
    }

    async fn analyze_image(
        &self,
        _image: &ImageInput,
        _prompt: &str,
        _params: &GenerationConfig,
    ) -> LlmResult<Generation> {
        self.answer()
    }
}

fn app_state(provider: Arc<FakeProvider>, vision_url: &str) -> Arc<AppState> {
    let mut config = DixiConfig::default();
    config.vision.base_url = vision_url.to_string();
    let cache = Arc::new(ExpiringCache::new(16, Duration::from_secs(60)));
    let orchestrator = Arc::new(InferenceOrchestrator::new(
        provider,
        None,
        cache.clone(),
        OrchestratorConfig {
            timeouts: TimeoutConfig::default(),
            ..Default::default()
        },
    ));
    Arc::new(AppState::with_orchestrator(config, orchestrator, cache))
}

/// Register a viewer and swallow its greeting.
async fn viewer(hub: &Arc<BroadcastHub>) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
    let (conn, mut rx) = ClientConnection::open(16);
    hub.register(conn.clone());
    let greeting = next_envelope(&mut rx).await;
    assert_eq!(greeting.kind, "connected");
    (conn, rx)
}

async fn next_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Outbound::Text(json))) => Envelope::parse(&json).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ===========================================================================
// BroadcastHub
// ===========================================================================

#[tokio::test]
async fn broadcast_isolates_failing_viewer() {
    let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
    let (_a, mut rx_a) = viewer(&hub).await;
    let (_b, mut rx_b) = viewer(&hub).await;
    let (c, rx_c) = viewer(&hub).await;
    drop(rx_c);

    let outcome = hub.broadcast("ai_response", &serde_json::json!({"text": "hi"}));
    assert_eq!(outcome, BroadcastOutcome { success: 2, errors: 1 });
    assert_eq!(hub.client_count(), 2);
    assert!(hub.get(c.id()).is_none());

    for rx in [&mut rx_a, &mut rx_b] {
        let env = next_envelope(rx).await;
        assert_eq!(env.kind, "ai_response");
        assert_eq!(env.data["text"], "hi");
    }
}

#[tokio::test]
async fn closed_viewer_is_dropped_without_counting() {
    let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
    let (_a, _rx_a) = viewer(&hub).await;
    let (b, mut rx_b) = viewer(&hub).await;
    b.mark_closed();

    let outcome = hub.broadcast("gesture", &serde_json::json!({"type": "wave"}));
    assert_eq!(outcome, BroadcastOutcome { success: 1, errors: 0 });
    assert_eq!(hub.client_count(), 1);
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_with_no_viewers_is_empty() {
    let hub = BroadcastHub::new(Duration::from_secs(30));
    assert_eq!(hub.broadcast("gesture", &"x"), BroadcastOutcome::default());
}

#[tokio::test]
async fn viewer_messages_are_acked_or_dropped() {
    let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
    let (conn, mut rx) = viewer(&hub).await;

    hub.on_message(&conn, "{not json");
    hub.on_message(&conn, r#"{"type": "select_object", "data": {"id": 3}}"#);

    let ack = next_envelope(&mut rx).await;
    assert_eq!(ack.kind, "ack");
    assert_eq!(ack.data["type"], "select_object");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn client_list_reports_ids() {
    let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
    let (a, _rx_a) = viewer(&hub).await;
    let (b, _rx_b) = viewer(&hub).await;

    let mut ids: Vec<String> = hub.clients().into_iter().map(|c| c.id).collect();
    ids.sort();
    let mut expected = vec![a.id().to_string(), b.id().to_string()];
    expected.sort();
    assert_eq!(ids, expected);

    hub.shutdown();
    assert_eq!(hub.client_count(), 0);
    assert_eq!(a.state(), TransportState::Closing);
}

// ===========================================================================
// GesturePipeline
// ===========================================================================

#[tokio::test]
async fn gesture_is_mirrored_then_answered() {
    let provider = FakeProvider::up("Hello to you too!");
    let state = app_state(provider.clone(), "http://127.0.0.1:1");
    let (_conn, mut rx) = viewer(&state.hub).await;

    let gesture = GestureObservation::new("wave", Point3::default(), 0.9);
    let handle = state.pipeline.handle_gesture(gesture).expect("first wave passes the gate");
    handle.await.unwrap();

    let mirrored = next_envelope(&mut rx).await;
    assert_eq!(mirrored.kind, "gesture");
    assert_eq!(mirrored.data["type"], "wave");

    let answer = next_envelope(&mut rx).await;
    assert_eq!(answer.kind, "ai_response");
    assert_eq!(answer.data["text"], "Hello to you too!");
    assert_eq!(answer.data["metadata"]["providerUsed"], "ollama");
}

#[tokio::test]
async fn held_gesture_is_gated_but_still_mirrored() {
    let provider = FakeProvider::up("hi");
    let state = app_state(provider.clone(), "http://127.0.0.1:1");
    let (_conn, mut rx) = viewer(&state.hub).await;

    let wave = GestureObservation::new("wave", Point3::default(), 0.9);
    let first = state.pipeline.handle_gesture(wave.clone());
    let second = state.pipeline.handle_gesture(wave);
    assert!(first.is_some());
    assert!(second.is_none());
    first.unwrap().await.unwrap();

    let kinds: Vec<String> = vec![
        next_envelope(&mut rx).await.kind,
        next_envelope(&mut rx).await.kind,
        next_envelope(&mut rx).await.kind,
    ];
    assert_eq!(kinds.iter().filter(|k| *k == "gesture").count(), 2);
    assert_eq!(kinds.iter().filter(|k| *k == "ai_response").count(), 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_gestures_have_independent_cooldowns() {
    let state = app_state(FakeProvider::up("ok"), "http://127.0.0.1:1");
    let wave = GestureObservation::new("wave", Point3::default(), 0.9);
    let thumbs = GestureObservation::new("thumbs_up", Point3::default(), 0.9);
    assert!(state.pipeline.handle_gesture(wave).is_some());
    assert!(state.pipeline.handle_gesture(thumbs).is_some());
}

#[tokio::test]
async fn pipeline_uses_the_shared_cooldown_gate() {
    let provider = FakeProvider::up("ok");
    let state = app_state(provider.clone(), "http://127.0.0.1:1");
    let wave = GestureObservation::new("wave", Point3::default(), 0.9);

    state.pipeline.handle_gesture(wave.clone()).unwrap().await.unwrap();
    assert!(state.cooldown.last_triggered("wave").is_some());
    assert!(state.pipeline.handle_gesture(wave.clone()).is_none());

    state.cooldown.reset();
    state.pipeline.handle_gesture(wave).unwrap().await.unwrap();
    // The repeat is answered from the cache.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.orchestrator.cache_stats().hits, 1);
}

#[tokio::test]
async fn unknown_gesture_never_triggers_inference() {
    let provider = FakeProvider::up("ok");
    let state = app_state(provider.clone(), "http://127.0.0.1:1");
    let unknown = GestureObservation::new("unknown", Point3::default(), 0.7);
    assert!(state.pipeline.handle_gesture(unknown).is_none());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_inference_broadcasts_degraded_reply() {
    let state = app_state(FakeProvider::down(), "http://127.0.0.1:1");
    let (_conn, mut rx) = viewer(&state.hub).await;

    let fist = GestureObservation::new("fist", Point3::default(), 0.9);
    state.pipeline.handle_gesture(fist).unwrap().await.unwrap();

    next_envelope(&mut rx).await;
    let answer = next_envelope(&mut rx).await;
    assert_eq!(answer.kind, "ai_response");
    assert_eq!(answer.data["text"], DEGRADED_REPLY);
    assert_eq!(answer.data["metadata"]["error"], true);
}

#[tokio::test]
async fn tracking_routes_each_detected_hand() {
    let provider = FakeProvider::up("Nice!");
    let state = app_state(provider.clone(), "http://127.0.0.1:1");
    let (_conn, mut rx) = viewer(&state.hub).await;

    let snapshot = TrackingSnapshot {
        hands: Hands {
            left: Some(HandState {
                detected: true,
                gesture: "peace".into(),
                confidence: 0.85,
                ..Default::default()
            }),
            right: Some(HandState {
                detected: true,
                gesture: "unknown".into(),
                confidence: 0.7,
                ..Default::default()
            }),
        },
        timestamp: 42,
        ..Default::default()
    };

    let handles = state.pipeline.handle_tracking(snapshot);
    assert_eq!(handles.len(), 1);
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(next_envelope(&mut rx).await.kind, "tracking");
    assert_eq!(next_envelope(&mut rx).await.kind, "ai_response");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn current_frame_is_captured_and_described() {
    let mut server = mockito::Server::new_async().await;
    let _frame = server
        .mock("GET", "/capture_frame")
        .with_status(200)
        .with_header("content-type", "image/jpeg")
        .with_body(vec![0xFFu8, 0xD8, 0xFF, 0xE0])
        .create_async()
        .await;

    let state = app_state(FakeProvider::up("I see a raised hand"), &server.url());
    let (_conn, mut rx) = viewer(&state.hub).await;

    let response = state.pipeline.analyze_current_frame(Some("What am I holding?")).await;
    assert_eq!(response.text, "I see a raised hand");
    assert!(!response.metadata.cached);

    let env = next_envelope(&mut rx).await;
    assert_eq!(env.kind, "ai_response");
}

#[tokio::test]
async fn missing_frame_gives_degraded_reply() {
    let mut server = mockito::Server::new_async().await;
    let _frame = server
        .mock("GET", "/capture_frame")
        .with_status(503)
        .with_body(r#"{"error": "No frame available"}"#)
        .create_async()
        .await;

    let provider = FakeProvider::up("unused");
    let state = app_state(provider.clone(), &server.url());
    let response = state.pipeline.analyze_current_frame(None).await;
    assert!(response.metadata.error);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

// ===========================================================================
// VisionClient
// ===========================================================================

#[tokio::test]
async fn vision_client_maps_failures() {
    let mut server = mockito::Server::new_async().await;
    let _frame = server
        .mock("GET", "/capture_frame")
        .with_status(503)
        .with_body("No frame available")
        .create_async()
        .await;
    let client = VisionClient::new(server.url(), Duration::from_secs(5));
    assert!(matches!(
        client.capture_frame().await,
        Err(VisionError::Status { status: 503, .. })
    ));

    let unreachable = VisionClient::new("http://127.0.0.1:1", Duration::from_secs(5));
    assert!(matches!(
        unreachable.capture_frame().await,
        Err(VisionError::Unreachable(_))
    ));
    assert!(!unreachable.health().await);
}

// ===========================================================================
// Routes
// ===========================================================================

#[tokio::test]
async fn health_route_reports_clients() {
    let state = app_state(FakeProvider::up("ok"), "http://127.0.0.1:1");
    let response = router(state).oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["clients"], 0);
}

#[tokio::test]
async fn gesture_route_reports_trigger() {
    let state = app_state(FakeProvider::up("ok"), "http://127.0.0.1:1");
    let app = router(state);
    let gesture = serde_json::json!({
        "type": "point",
        "position": {"x": 0.1, "y": 0.2, "z": 0.0},
        "confidence": 0.85,
        "timestamp": 1000
    });

    let first = app.clone().oneshot(json_request("POST", "/api/gestures/process", gesture.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_json(first).await["triggered"], true);

    let second = app.oneshot(json_request("POST", "/api/gestures/process", gesture)).await.unwrap();
    assert_eq!(body_json(second).await["triggered"], false);
}

#[tokio::test]
async fn malformed_gesture_is_rejected_at_the_boundary() {
    let state = app_state(FakeProvider::up("ok"), "http://127.0.0.1:1");
    let response = router(state)
        .oneshot(json_request("POST", "/api/gestures/process", serde_json::json!({"confidence": "high"})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn infer_route_returns_response_or_status() {
    let state = app_state(FakeProvider::up("Forty-two"), "http://127.0.0.1:1");
    let response = router(state)
        .oneshot(json_request("POST", "/api/ai/infer", serde_json::json!({"query": "meaning of life?"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "Forty-two");
    assert_eq!(body["metadata"]["modelUsed"], "fake-model");

    let state = app_state(FakeProvider::down(), "http://127.0.0.1:1");
    let response = router(state)
        .oneshot(json_request("POST", "/api/ai/infer", serde_json::json!({"query": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(body_json(response).await["error"].as_str().unwrap().contains("unavailable"));
}

#[tokio::test]
async fn cache_routes_report_and_clear() {
    let state = app_state(FakeProvider::up("cached"), "http://127.0.0.1:1");
    state.orchestrator.infer("hello", None).await.unwrap();
    let app = router(state.clone());

    let stats = app.clone().oneshot(Request::get("/api/ai/cache").body(Body::empty()).unwrap()).await.unwrap();
    let body = body_json(stats).await;
    assert_eq!(body["size"], 1);
    assert_eq!(body["maxSize"], 16);

    let cleared = app
        .oneshot(Request::delete("/api/ai/cache").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(cleared.status(), StatusCode::NO_CONTENT);
    assert!(state.cache.is_empty());
}

#[tokio::test]
async fn status_route_probes_provider() {
    let state = app_state(FakeProvider::up("ok"), "http://127.0.0.1:1");
    let response = router(state).oneshot(Request::get("/api/ai/status").body(Body::empty()).unwrap()).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["activeProvider"], "ollama");
    assert_eq!(body["connectionState"], "connected");
}

#[tokio::test]
async fn stream_route_emits_sse_chunks() {
    let state = app_state(FakeProvider::up("streamed"), "http://127.0.0.1:1");
    let response = router(state)
        .oneshot(Request::get("/api/ai/stream?query=hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"data: {"text":"streamed","done":false}"#));
    assert_eq!(text.matches(r#""done":true"#).count(), 1);
}

// ===========================================================================
// Cache sweeper
// ===========================================================================

#[tokio::test]
async fn sweeper_removes_expired_entries() {
    let cache = Arc::new(ExpiringCache::new(8, Duration::from_millis(10)));
    cache.set("a", "1".to_string(), None);
    cache.set("b", "2".to_string(), Some(Duration::from_secs(60)));

    let token = CancellationToken::new();
    let handle = spawn_cache_sweeper(cache.clone(), Duration::from_millis(30), token.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(cache.len(), 1);
    token.cancel();
    handle.await.unwrap();
    assert!(spawn_cache_sweeper(cache, Duration::ZERO, CancellationToken::new()).is_none());
}
