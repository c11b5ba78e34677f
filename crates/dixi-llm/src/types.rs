//! Inference request and response types

use dixi_core::PerceptionContext;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// Fixed confidence reported for answers from this backend.
    pub fn confidence(&self) -> f64 {
        match self {
            ProviderKind::Ollama => 0.85,
            ProviderKind::Gemini => 0.9,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which configured slot serves a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    /// Local model server, always configured.
    Primary,
    /// Cloud provider, configured only with an API key.
    Secondary,
}

impl ProviderRole {
    pub fn other(self) -> Self {
        match self {
            ProviderRole::Primary => ProviderRole::Secondary,
            ProviderRole::Secondary => ProviderRole::Primary,
        }
    }
}

impl From<dixi_core::config::PreferredProvider> for ProviderRole {
    fn from(p: dixi_core::config::PreferredProvider) -> Self {
        match p {
            dixi_core::config::PreferredProvider::Ollama => ProviderRole::Primary,
            dixi_core::config::PreferredProvider::Gemini => ProviderRole::Secondary,
        }
    }
}

/// One inference request.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<PerceptionContext>,
    /// Overrides the configured preference for this request.
    #[serde(default)]
    pub provider: Option<ProviderRole>,
    /// When false only the selected provider is attempted.
    #[serde(default = "default_true")]
    pub fallback: bool,
}

fn default_true() -> bool {
    true
}

impl InferenceRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: None,
            provider: None,
            fallback: true,
        }
    }

    pub fn with_context(mut self, context: PerceptionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_provider(mut self, role: ProviderRole) -> Self {
        self.provider = Some(role);
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = false;
        self
    }
}

/// Completed text from a provider adapter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Reported by the backend when available.
    pub token_count: Option<u32>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_count: None,
        }
    }
}

/// Raw image handed to a vision model.
#[derive(Clone, Debug)]
pub struct ImageInput {
    pub bytes: bytes::Bytes,
    pub mime_type: String,
}

impl ImageInput {
    pub fn jpeg(bytes: impl Into<bytes::Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: "image/jpeg".into(),
        }
    }

    pub fn base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Incremental output from a provider stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// Explicit end-of-response marker.
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub inference_time_ms: u64,
    pub token_count: u32,
    pub confidence: f64,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<ProviderKind>,
    #[serde(default)]
    pub cached: bool,
    /// Set on apology placeholders sent when every provider failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    pub metadata: ResponseMetadata,
}

impl InferenceResponse {
    /// Placeholder reply for when no provider could answer.
    pub fn degraded(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: ResponseMetadata {
                inference_time_ms: 0,
                token_count: 0,
                confidence: 0.0,
                model_used: "none".into(),
                provider_used: None,
                cached: false,
                error: true,
            },
        }
    }
}

/// One unit of a streamed reply. Exactly one chunk per stream has `done` set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    pub done: bool,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }
}

/// How a stream ended.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSummary {
    pub provider: ProviderKind,
    pub model: String,
    pub chunks: usize,
    pub chars: usize,
    /// The consumer went away before the end.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}
