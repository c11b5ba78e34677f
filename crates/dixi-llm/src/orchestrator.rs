//! Inference orchestrator
//!
//! Builds the prompt, checks the response cache, then tries the preferred
//! provider with exactly one fallback to the other. Streaming and image
//! analysis follow the same selection but bypass the cache.

use crate::gemini::GeminiProvider;
use crate::ollama::OllamaProvider;
use crate::prompt::{build_prompt, cache_key, estimate_tokens};
use crate::provider::{InferenceError, InferenceProvider, LlmResult, TextStream};
use crate::types::*;
use dixi_core::config::{GenerationConfig, PreferredProvider, TimeoutConfig};
use dixi_core::{CacheStats, DixiConfig, ExpiringCache, PerceptionContext};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_IMAGE_PROMPT: &str = "Describe what you see in this image. \
    Focus on the person, their gesture, and anything they might be showing you.";

#[derive(Clone, Debug, Default)]
pub struct OrchestratorConfig {
    pub preferred: PreferredProvider,
    pub generation: GenerationConfig,
    pub timeouts: TimeoutConfig,
}

impl From<&DixiConfig> for OrchestratorConfig {
    fn from(config: &DixiConfig) -> Self {
        Self {
            preferred: config.inference.preferred,
            generation: config.inference.generation.clone(),
            timeouts: config.timeouts.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub initialized: bool,
    pub active_provider: ProviderKind,
    pub active_model: String,
    pub connection_state: ConnectionState,
    pub fallback_configured: bool,
}

/// A slot in the attempt order.
enum Slot<'a> {
    Ready(&'a dyn InferenceProvider),
    Missing(ProviderRole),
}

enum PumpOutcome {
    Finished { chunks: usize, chars: usize },
    Cancelled { chunks: usize, chars: usize },
    Failed { error: InferenceError, chunks: usize },
}

pub struct InferenceOrchestrator {
    primary: Arc<dyn InferenceProvider>,
    secondary: Option<Arc<dyn InferenceProvider>>,
    cache: Arc<ExpiringCache<String>>,
    config: OrchestratorConfig,
    initialized: AtomicBool,
}

impl InferenceOrchestrator {
    pub fn new(
        primary: Arc<dyn InferenceProvider>,
        secondary: Option<Arc<dyn InferenceProvider>>,
        cache: Arc<ExpiringCache<String>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            cache,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    /// Ollama as primary, Gemini as secondary when an API key is present.
    pub fn from_config(config: &DixiConfig, cache: Arc<ExpiringCache<String>>) -> Self {
        let primary: Arc<dyn InferenceProvider> = Arc::new(
            OllamaProvider::new(&config.ollama.base_url, &config.ollama.model)
                .with_vision_model(&config.ollama.vision_model),
        );
        let secondary = config.gemini.api_key.as_ref().map(|key| {
            Arc::new(GeminiProvider::new(key, &config.gemini.model).with_base_url(&config.gemini.base_url))
                as Arc<dyn InferenceProvider>
        });
        if secondary.is_none() {
            info!("No Gemini API key, cloud fallback disabled");
        }
        Self::new(primary, secondary, cache, OrchestratorConfig::from(config))
    }

    /// Probe the primary provider. A failure leaves the orchestrator usable;
    /// every later call tries again.
    pub async fn initialize(&self) -> LlmResult<()> {
        let provider = self.primary.as_ref();
        match self.probe(provider).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                info!("Inference ready: {} ({})", provider.kind(), provider.model());
                Ok(())
            }
            Err(e) => {
                warn!("Primary provider probe failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Re-probes the active provider on every call.
    pub async fn status(&self) -> OrchestratorStatus {
        let active = self.active_provider();
        let connection_state = match self.probe(active).await {
            Ok(()) => ConnectionState::Connected,
            Err(e) => {
                debug!("Status probe failed: {}", e);
                ConnectionState::Disconnected
            }
        };
        OrchestratorStatus {
            initialized: self.is_initialized(),
            active_provider: active.kind(),
            active_model: active.model().to_string(),
            connection_state,
            fallback_configured: self.secondary.is_some(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Inference cache cleared");
    }

    pub async fn infer(&self, query: &str, context: Option<PerceptionContext>) -> LlmResult<InferenceResponse> {
        let request = match context {
            Some(ctx) => InferenceRequest::new(query).with_context(ctx),
            None => InferenceRequest::new(query),
        };
        self.infer_request(&request).await
    }

    pub async fn infer_request(&self, request: &InferenceRequest) -> LlmResult<InferenceResponse> {
        let attempts = self.attempt_order(request.provider, request.fallback);

        if let Some(active) = attempts.iter().find_map(Slot::ready) {
            let key = cache_key(&request.query, active.model(), active.kind().as_str());
            if let Some(text) = self.cache.get(&key) {
                debug!("Cache hit for {}", key);
                return Ok(InferenceResponse {
                    metadata: ResponseMetadata {
                        inference_time_ms: 0,
                        token_count: estimate_tokens(&text),
                        confidence: active.kind().confidence(),
                        model_used: active.model().to_string(),
                        provider_used: Some(active.kind()),
                        cached: true,
                        error: false,
                    },
                    text,
                });
            }
        }

        let prompt = build_prompt(&request.query, request.context.as_ref());
        let limit = self.config.timeouts.infer();
        let mut errors = Vec::new();

        for slot in attempts {
            let provider = match slot {
                Slot::Ready(p) => p,
                Slot::Missing(role) => {
                    errors.push(not_configured(role));
                    continue;
                }
            };
            let started = Instant::now();
            let result = tokio::time::timeout(limit, provider.generate(&prompt, &self.config.generation))
                .await
                .unwrap_or_else(|_| Err(InferenceError::timeout(provider.kind(), limit)));

            match result {
                Ok(generation) => {
                    let key = cache_key(&request.query, provider.model(), provider.kind().as_str());
                    self.cache.set(key, generation.text.clone(), None);
                    let response = respond(provider, generation, started);
                    info!(
                        "Inference served by {} in {}ms",
                        provider.kind(),
                        response.metadata.inference_time_ms
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Inference via {} failed: {}", provider.kind(), e);
                    errors.push(e);
                }
            }
        }

        Err(final_error(errors))
    }

    /// Stream a reply into `sink`. Exactly one `done` chunk is sent unless the
    /// receiver was dropped, which cancels the stream without error.
    ///
    /// A provider that fails before delivering anything falls back like
    /// [`infer_request`](Self::infer_request); after the first chunk a failure
    /// ends the stream and is returned. Each attempt gets the full streaming
    /// budget, so a provider that hangs while opening does not starve the
    /// fallback.
    pub async fn infer_stream(
        &self,
        request: &InferenceRequest,
        sink: mpsc::Sender<StreamChunk>,
    ) -> LlmResult<StreamSummary> {
        let prompt = build_prompt(&request.query, request.context.as_ref());
        let limit = self.config.timeouts.stream();
        let started = Instant::now();
        let mut errors = Vec::new();

        for slot in self.attempt_order(request.provider, request.fallback) {
            let provider = match slot {
                Slot::Ready(p) => p,
                Slot::Missing(role) => {
                    errors.push(not_configured(role));
                    continue;
                }
            };
            let deadline = tokio::time::Instant::now() + limit;
            let opened = tokio::time::timeout_at(
                deadline,
                provider.generate_stream(&prompt, &self.config.generation),
            )
            .await
            .unwrap_or_else(|_| Err(InferenceError::timeout(provider.kind(), limit)));

            let stream = match opened {
                Ok(s) => s,
                Err(e) => {
                    warn!("Stream via {} failed to open: {}", provider.kind(), e);
                    errors.push(e);
                    continue;
                }
            };

            let summary = |chunks, chars, cancelled| StreamSummary {
                provider: provider.kind(),
                model: provider.model().to_string(),
                chunks,
                chars,
                cancelled,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };

            match pump(stream, &sink, deadline, provider.kind(), limit).await {
                PumpOutcome::Finished { chunks, chars } => {
                    info!("Stream via {} finished: {} chunks", provider.kind(), chunks);
                    return Ok(summary(chunks, chars, false));
                }
                PumpOutcome::Cancelled { chunks, chars } => {
                    debug!("Stream receiver dropped after {} chunks", chunks);
                    return Ok(summary(chunks, chars, true));
                }
                PumpOutcome::Failed { error, chunks: 0 } => {
                    warn!("Stream via {} failed: {}", provider.kind(), error);
                    errors.push(error);
                }
                PumpOutcome::Failed { error, chunks } => {
                    warn!("Stream via {} broke after {} chunks: {}", provider.kind(), chunks, error);
                    let _ = sink.send(StreamChunk::done()).await;
                    return Err(error);
                }
            }
        }

        let _ = sink.send(StreamChunk::done()).await;
        Err(final_error(errors))
    }

    /// Describe an image with a vision-capable model. Never cached.
    pub async fn analyze_image(&self, image: &ImageInput, prompt: Option<&str>) -> LlmResult<InferenceResponse> {
        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_IMAGE_PROMPT);
        let limit = self.config.timeouts.image();
        let mut errors = Vec::new();

        for slot in self.attempt_order(None, true) {
            let provider = match slot {
                Slot::Ready(p) => p,
                Slot::Missing(role) => {
                    errors.push(not_configured(role));
                    continue;
                }
            };
            let started = Instant::now();
            let result = tokio::time::timeout(
                limit,
                provider.analyze_image(image, prompt, &self.config.generation),
            )
            .await
            .unwrap_or_else(|_| Err(InferenceError::timeout(provider.kind(), limit)));

            match result {
                Ok(generation) => {
                    let mut response = respond(provider, generation, started);
                    response.metadata.model_used = provider.vision_model().to_string();
                    info!("Image analyzed by {}", provider.kind());
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Image analysis via {} failed: {}", provider.kind(), e);
                    errors.push(e);
                }
            }
        }

        Err(final_error(errors))
    }

    fn preferred_role(&self) -> ProviderRole {
        ProviderRole::from(self.config.preferred)
    }

    fn slot(&self, role: ProviderRole) -> Slot<'_> {
        match role {
            ProviderRole::Primary => Slot::Ready(self.primary.as_ref()),
            ProviderRole::Secondary => match &self.secondary {
                Some(p) => Slot::Ready(p.as_ref()),
                None => Slot::Missing(ProviderRole::Secondary),
            },
        }
    }

    /// Preferred slot first, then the other one unless fallback is off.
    fn attempt_order(&self, requested: Option<ProviderRole>, fallback: bool) -> Vec<Slot<'_>> {
        let first = requested.unwrap_or_else(|| self.preferred_role());
        let mut order = vec![self.slot(first)];
        if fallback {
            order.push(self.slot(first.other()));
        }
        order
    }

    /// First configured provider in preference order.
    fn active_provider(&self) -> &dyn InferenceProvider {
        self.attempt_order(None, true)
            .iter()
            .find_map(Slot::ready)
            .unwrap_or(self.primary.as_ref())
    }

    async fn probe(&self, provider: &dyn InferenceProvider) -> LlmResult<()> {
        let limit = self.config.timeouts.probe();
        tokio::time::timeout(limit, provider.probe())
            .await
            .unwrap_or_else(|_| Err(InferenceError::timeout(provider.kind(), limit)))
    }
}

impl<'a> Slot<'a> {
    fn ready(&self) -> Option<&'a dyn InferenceProvider> {
        match self {
            Slot::Ready(p) => Some(*p),
            Slot::Missing(_) => None,
        }
    }
}

fn not_configured(role: ProviderRole) -> InferenceError {
    let message = match role {
        ProviderRole::Primary => "primary provider is not configured",
        ProviderRole::Secondary => "secondary provider has no API key",
    };
    InferenceError::NotConfigured(message.into())
}

/// The last real provider error wins; `NotConfigured` only surfaces when no
/// provider was actually attempted.
fn final_error(errors: Vec<InferenceError>) -> InferenceError {
    let mut fallback = None;
    let mut last = None;
    for e in errors {
        match e {
            InferenceError::NotConfigured(_) => {
                fallback.get_or_insert(e);
            }
            other => last = Some(other),
        }
    }
    last.or(fallback)
        .unwrap_or_else(|| InferenceError::NotConfigured("no provider configured".into()))
}

fn respond(provider: &dyn InferenceProvider, generation: Generation, started: Instant) -> InferenceResponse {
    let token_count = generation
        .token_count
        .unwrap_or_else(|| estimate_tokens(&generation.text));
    InferenceResponse {
        text: generation.text,
        metadata: ResponseMetadata {
            inference_time_ms: started.elapsed().as_millis() as u64,
            token_count,
            confidence: provider.kind().confidence(),
            model_used: provider.model().to_string(),
            provider_used: Some(provider.kind()),
            cached: false,
            error: false,
        },
    }
}

/// Forward deltas to the sink until the provider finishes, fails, or the
/// receiver goes away.
async fn pump(
    mut stream: TextStream,
    sink: &mpsc::Sender<StreamChunk>,
    deadline: tokio::time::Instant,
    kind: ProviderKind,
    limit: std::time::Duration,
) -> PumpOutcome {
    let mut chunks = 0;
    let mut chars = 0;
    loop {
        let next = tokio::select! {
            _ = sink.closed() => return PumpOutcome::Cancelled { chunks, chars },
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let delta = match next {
            Ok(d) => d,
            Err(_) => {
                return PumpOutcome::Failed {
                    error: InferenceError::timeout(kind, limit),
                    chunks,
                }
            }
        };
        match delta {
            Some(Ok(StreamDelta::Text(text))) => {
                if text.is_empty() {
                    continue;
                }
                chars += text.chars().count();
                if sink.send(StreamChunk::text(text)).await.is_err() {
                    return PumpOutcome::Cancelled { chunks, chars };
                }
                chunks += 1;
            }
            // A transport that closes without a marker still gets one.
            Some(Ok(StreamDelta::Done)) | None => {
                if sink.send(StreamChunk::done()).await.is_err() {
                    return PumpOutcome::Cancelled { chunks, chars };
                }
                return PumpOutcome::Finished { chunks, chars };
            }
            Some(Err(error)) => return PumpOutcome::Failed { error, chunks },
        }
    }
}
