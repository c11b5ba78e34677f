//! Runtime configuration
//!
//! Loaded from TOML at startup, falls back to defaults when the file is
//! missing or invalid, then environment variables override individual values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DixiConfig {
    pub gateway: GatewayConfig,
    /// Primary (local) provider.
    pub ollama: OllamaConfig,
    /// Secondary (cloud) provider.
    pub gemini: GeminiConfig,
    pub inference: InferenceConfig,
    pub cache: CacheConfig,
    pub cooldown: CooldownConfig,
    pub hub: HubConfig,
    pub vision: VisionConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
}

/// Bind mode for the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Vision-capable model used for frame analysis. Matched by substring
    /// against the installed model list.
    pub vision_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub model: String,
    /// Without a key the cloud provider is not configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Which provider is attempted first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredProvider {
    #[default]
    Ollama,
    Gemini,
}

impl PreferredProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" | "local" | "primary" => Some(Self::Ollama),
            "gemini" | "cloud" | "secondary" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Logical generation parameters, translated per provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub system_instruction: String,
    pub context_window: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub preferred: PreferredProvider,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: u64,
    /// Interval of the background expired-entry sweep. 0 disables it.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Minimum gap between two inference triggers of the same gesture type.
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub ping_interval_secs: u64,
    /// Per-connection outbound queue length.
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub base_url: String,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub probe_secs: u64,
    pub infer_secs: u64,
    pub stream_secs: u64,
    pub capture_secs: u64,
    pub image_secs: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            bind: BindMode::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "gemma3:4b".into(),
            vision_model: "llava".into(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "gemini-1.5-flash".into(),
            api_key: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 512,
            stop_sequences: Vec::new(),
            system_instruction: "You are Dixi, a friendly assistant projected into the room. \
                You see the user through a camera and react to their hand gestures. \
                Keep answers short, warm, and conversational."
                .into(),
            context_window: 4096,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { window_ms: 2_000 }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            outbound_buffer: 256,
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".into(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 5,
            infer_secs: 60,
            stream_secs: 120,
            capture_secs: 5,
            image_secs: 30,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl DixiConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Override values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Override values from an arbitrary lookup. Empty values are ignored.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("OLLAMA_URL") {
            self.ollama.base_url = url;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        if let Some(model) = get("OLLAMA_VISION_MODEL") {
            self.ollama.vision_model = model;
        }
        if let Some(key) = get("GEMINI_API_KEY") {
            self.gemini.api_key = Some(key);
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.gemini.model = model;
        }
        if let Some(provider) = get("DIXI_PROVIDER") {
            match PreferredProvider::parse(&provider) {
                Some(p) => self.inference.preferred = p,
                None => tracing::warn!("Ignoring unknown DIXI_PROVIDER={}", provider),
            }
        }
        if let Some(port) = get("DIXI_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!("Ignoring invalid DIXI_PORT={}", port),
            }
        }
        if let Some(url) = get("VISION_SERVICE_URL") {
            self.vision.base_url = url;
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl CooldownConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
    pub fn infer(&self) -> Duration {
        Duration::from_secs(self.infer_secs)
    }
    pub fn stream(&self) -> Duration {
        Duration::from_secs(self.stream_secs)
    }
    pub fn capture(&self) -> Duration {
        Duration::from_secs(self.capture_secs)
    }
    pub fn image(&self) -> Duration {
        Duration::from_secs(self.image_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timeouts() {
        let t = TimeoutConfig::default();
        assert_eq!(t.probe(), Duration::from_secs(5));
        assert_eq!(t.infer(), Duration::from_secs(60));
        assert_eq!(t.stream(), Duration::from_secs(120));
        assert_eq!(t.capture(), Duration::from_secs(5));
        assert_eq!(t.image(), Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = DixiConfig::default();
        config.apply_vars(|key| match key {
            "GEMINI_API_KEY" => Some("k-123".into()),
            "DIXI_PROVIDER" => Some("gemini".into()),
            "DIXI_PORT" => Some("4000".into()),
            "OLLAMA_MODEL" => Some("".into()),
            _ => None,
        });
        assert_eq!(config.gemini.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.inference.preferred, PreferredProvider::Gemini);
        assert_eq!(config.gateway.port, 4000);
        assert_eq!(config.ollama.model, OllamaConfig::default().model);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = DixiConfig::default();
        config.apply_vars(|key| match key {
            "DIXI_PROVIDER" => Some("openai".into()),
            "DIXI_PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.inference.preferred, PreferredProvider::Ollama);
        assert_eq!(config.gateway.port, 3001);
    }
}
