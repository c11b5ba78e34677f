//! Inference provider trait

use crate::types::{Generation, ImageInput, ProviderKind, StreamDelta};
use dixi_core::config::GenerationConfig;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Result type for inference operations
pub type LlmResult<T> = Result<T, InferenceError>;

/// Inference error types. Every call is independent; none of these poison
/// the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Connection refused, DNS failure, or timeout.
    #[error("{provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: ProviderKind,
        message: String,
    },

    /// Non-success status or a payload that could not be understood.
    #[error("{provider} rejected the request: {message}")]
    ProviderRejected {
        provider: ProviderKind,
        message: String,
    },

    /// A provider was requested that has no endpoint or credential.
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl InferenceError {
    pub fn unavailable(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider,
            message: message.into(),
        }
    }

    pub fn rejected(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::ProviderRejected {
            provider,
            message: message.into(),
        }
    }

    pub fn timeout(provider: ProviderKind, after: Duration) -> Self {
        Self::unavailable(provider, format!("timed out after {}ms", after.as_millis()))
    }

    /// Classify a transport error. Body decoding failures count as a rejected
    /// payload, everything else as the provider being unreachable.
    pub fn from_reqwest(provider: ProviderKind, err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::rejected(provider, format!("malformed response: {}", err))
        } else if err.is_timeout() {
            Self::unavailable(provider, format!("timed out: {}", err))
        } else if err.is_connect() {
            Self::unavailable(provider, format!("connection failed: {}", err))
        } else {
            Self::unavailable(provider, err.to_string())
        }
    }

    /// The provider this error came from, if any.
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            Self::ProviderUnavailable { provider, .. } | Self::ProviderRejected { provider, .. } => {
                Some(*provider)
            }
            Self::NotConfigured(_) => None,
        }
    }
}

/// Stream type for incremental responses
pub type TextStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

/// A model backend. Adapters translate the shared generation parameters to
/// their own wire shape; timeouts and fallback are applied by the caller.
#[async_trait::async_trait]
pub trait InferenceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Text model identifier.
    fn model(&self) -> &str;

    /// Model used for image analysis.
    fn vision_model(&self) -> &str {
        self.model()
    }

    /// Cheap reachability check.
    async fn probe(&self) -> LlmResult<()>;

    async fn generate(&self, prompt: &str, params: &GenerationConfig) -> LlmResult<Generation>;

    /// Open an incremental response. The stream may end with
    /// [`StreamDelta::Done`] or simply close.
    async fn generate_stream(&self, prompt: &str, params: &GenerationConfig)
        -> LlmResult<TextStream>;

    async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        params: &GenerationConfig,
    ) -> LlmResult<Generation>;
}
