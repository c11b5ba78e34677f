//! Gateway server: viewer socket, perception ingest, and inference routes

use crate::hub::BroadcastHub;
use crate::pipeline::GesturePipeline;
use crate::vision::VisionClient;
use crate::ws::handle_connection;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dixi_core::{CooldownGate, DixiConfig, ExpiringCache, GestureObservation, TrackingSnapshot};
use dixi_llm::{InferenceError, InferenceOrchestrator, InferenceRequest, ProviderRole};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Streamed chunks buffered per SSE client.
const STREAM_BUFFER: usize = 32;

/// Shared state for every route.
pub struct AppState {
    pub config: DixiConfig,
    pub hub: Arc<BroadcastHub>,
    pub orchestrator: Arc<InferenceOrchestrator>,
    pub pipeline: Arc<GesturePipeline>,
    pub cache: Arc<ExpiringCache<String>>,
    pub cooldown: Arc<CooldownGate>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component from configuration.
    pub fn from_config(config: DixiConfig) -> Self {
        let cache = Arc::new(ExpiringCache::new(config.cache.max_size, config.cache.ttl()));
        let orchestrator = Arc::new(InferenceOrchestrator::from_config(&config, cache.clone()));
        Self::with_orchestrator(config, orchestrator, cache)
    }

    /// Wire the hub, vision client and pipeline around an existing
    /// orchestrator.
    pub fn with_orchestrator(
        config: DixiConfig,
        orchestrator: Arc<InferenceOrchestrator>,
        cache: Arc<ExpiringCache<String>>,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.hub.ping_interval()));
        let cooldown = Arc::new(CooldownGate::new());
        let vision = Arc::new(VisionClient::new(
            &config.vision.base_url,
            config.timeouts.capture(),
        ));
        let pipeline = Arc::new(GesturePipeline::new(
            cooldown.clone(),
            orchestrator.clone(),
            hub.clone(),
            vision,
            config.cooldown.window(),
        ));
        Self {
            config,
            hub,
            orchestrator,
            pipeline,
            cache,
            cooldown,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/clients", get(clients_handler))
        .route("/api/gestures/process", post(gesture_handler))
        .route("/api/tracking/process", post(tracking_handler))
        .route("/api/ai/infer", post(infer_handler))
        .route("/api/ai/stream", get(stream_handler))
        .route("/api/ai/analyze-frame", post(analyze_frame_handler))
        .route("/api/ai/status", get(status_handler))
        .route("/api/ai/cache", get(cache_stats_handler).delete(clear_cache_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_gateway(config: DixiConfig) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let state = Arc::new(AppState::from_config(config));

    if let Err(e) = state.orchestrator.initialize().await {
        warn!("Inference not ready yet ({}), requests will retry", e);
    }

    let shutdown = CancellationToken::new();
    spawn_cache_sweeper(
        state.cache.clone(),
        Duration::from_secs(state.config.cache.sweep_interval_secs),
        shutdown.clone(),
    );

    info!("Dixi Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Provider:  {:?}", state.config.inference.preferred);
    info!("  Ollama:    {} ({})", state.config.ollama.base_url, state.config.ollama.model);
    if state.config.gemini.api_key.is_some() {
        info!("  Gemini:    {}", state.config.gemini.model);
    }
    info!("  Vision:    {}", state.config.vision.base_url);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    state.hub.shutdown();
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Periodically drop expired cache entries. A zero interval disables it.
pub fn spawn_cache_sweeper(
    cache: Arc<ExpiringCache<String>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = cache.clean_expired();
                    if removed > 0 {
                        debug!(removed, remaining = cache.len(), "Swept expired cache entries");
                    }
                }
            }
        }
    }))
}

// ============================================================
// Errors
// ============================================================

/// Inference failure mapped to an HTTP status.
pub struct ApiError(InferenceError);

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InferenceError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InferenceError::ProviderRejected { .. } => StatusCode::BAD_GATEWAY,
            InferenceError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ============================================================
// Handlers
// ============================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.hub.clone();
    let buffer = state.config.hub.outbound_buffer;
    ws.on_upgrade(move |socket| handle_connection(socket, hub, buffer))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn clients_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.clients())
}

async fn gesture_handler(
    State(state): State<Arc<AppState>>,
    Json(gesture): Json<GestureObservation>,
) -> impl IntoResponse {
    let triggered = state.pipeline.handle_gesture(gesture).is_some();
    Json(serde_json::json!({ "success": true, "triggered": triggered }))
}

async fn tracking_handler(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<TrackingSnapshot>,
) -> impl IntoResponse {
    let triggered = state.pipeline.handle_tracking(snapshot).len();
    Json(serde_json::json!({ "success": true, "triggered": triggered }))
}

async fn infer_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InferenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.orchestrator.infer_request(&request).await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct StreamParams {
    query: String,
    #[serde(default)]
    provider: Option<ProviderRole>,
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let mut request = InferenceRequest::new(params.query);
    request.provider = params.provider;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.infer_stream(&request, tx).await {
            warn!("Streaming inference failed: {}", e);
        }
    });

    let events = ReceiverStream::new(rx).map(|chunk| {
        let event = Event::default()
            .json_data(&chunk)
            .unwrap_or_else(|_| Event::default().data(chunk.text.clone()));
        Ok::<_, Infallible>(event)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct AnalyzeFrameBody {
    #[serde(default)]
    prompt: Option<String>,
}

async fn analyze_frame_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<AnalyzeFrameBody>>,
) -> impl IntoResponse {
    let prompt = body.and_then(|Json(b)| b.prompt);
    Json(state.pipeline.analyze_current_frame(prompt.as_deref()).await)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.cache_stats())
}

async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.orchestrator.clear_cache();
    StatusCode::NO_CONTENT
}
