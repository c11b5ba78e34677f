//! Dixi LLM - Provider adapters, prompt building, and the inference orchestrator

pub mod gemini;
pub mod ollama;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod types;

pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use orchestrator::{
    ConnectionState, InferenceOrchestrator, OrchestratorConfig, OrchestratorStatus,
};
pub use prompt::{build_prompt, cache_key, estimate_tokens};
pub use provider::{InferenceError, InferenceProvider, LlmResult, TextStream};
pub use types::*;
