//! Gemini provider (cloud) with SSE streaming

use crate::provider::{InferenceError, InferenceProvider, LlmResult, TextStream};
use crate::types::{Generation, ImageInput, ProviderKind, StreamDelta};
use dixi_core::config::GenerationConfig;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const KIND: ProviderKind = ProviderKind::Gemini;

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: GEMINI_API_URL.to_string(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn model_url(&self, method: Option<&str>) -> String {
        let base = self.base_url.trim_end_matches('/');
        match method {
            Some(m) => format!("{}/models/{}:{}", base, self.model, m),
            None => format!("{}/models/{}", base, self.model),
        }
    }

    async fn post(&self, method: &str, body: &GenerateContentRequest<'_>, sse: bool) -> LlmResult<Response> {
        debug!("Gemini request: model={} method={}", self.model, method);
        let mut request = self
            .client
            .post(self.model_url(Some(method)))
            .query(&[("key", self.api_key.as_str())]);
        if sse {
            request = request.query(&[("alt", "sse")]);
        }
        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        check_status(response).await
    }

    async fn generate_content(&self, body: &GenerateContentRequest<'_>) -> LlmResult<Generation> {
        let response = self.post("generateContent", body, false).await?;
        let reply: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        let token_count = reply
            .usage_metadata
            .as_ref()
            .and_then(|u| u.total_token_count);
        match reply.text() {
            Some(text) => Ok(Generation { text, token_count }),
            None => Err(InferenceError::rejected(KIND, "response contained no candidates")),
        }
    }
}

#[async_trait::async_trait]
impl InferenceProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn probe(&self) -> LlmResult<()> {
        let response = self
            .client
            .get(self.model_url(None))
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        check_status(response).await.map(|_| ())
    }

    async fn generate(&self, prompt: &str, params: &GenerationConfig) -> LlmResult<Generation> {
        let body = GenerateContentRequest::new(vec![Part::Text { text: prompt }], params);
        self.generate_content(&body).await
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationConfig) -> LlmResult<TextStream> {
        let body = GenerateContentRequest::new(vec![Part::Text { text: prompt }], params);
        let response = self.post("streamGenerateContent", &body, true).await?;
        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }

    async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        params: &GenerationConfig,
    ) -> LlmResult<Generation> {
        let parts = vec![
            Part::Text { text: prompt },
            Part::InlineData {
                inline_data: InlineData {
                    mime_type: &image.mime_type,
                    data: image.base64(),
                },
            },
        ];
        self.generate_content(&GenerateContentRequest::new(parts, params)).await
    }
}

async fn check_status(response: Response) -> LlmResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    error!("Gemini error {}: {}", status, error_text);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(InferenceError::unavailable(KIND, format!("{}: {}", status, error_text)))
    } else {
        Err(InferenceError::rejected(KIND, format!("{}: {}", status, error_text)))
    }
}

/// Each SSE event carries a partial `GenerateContentResponse`. A candidate
/// with a finish reason (or a literal `[DONE]`) ends the response.
fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let events = bytes_stream.eventsource();
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    yield Err(InferenceError::unavailable(KIND, format!("stream error: {}", e)));
                    return;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                yield Ok(StreamDelta::Done);
                return;
            }

            let chunk: GenerateContentResponse = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    yield Err(InferenceError::rejected(KIND, format!("malformed stream event: {}", e)));
                    return;
                }
            };
            if let Some(text) = chunk.text().filter(|t| !t.is_empty()) {
                yield Ok(StreamDelta::Text(text));
            }
            if chunk.is_finished() {
                yield Ok(StreamDelta::Done);
                return;
            }
        }
    }
}

// ============================================================
// Wire types
// ============================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: WireGenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(parts: Vec<Part<'a>>, params: &'a GenerationConfig) -> Self {
        let system = params.system_instruction.trim();
        Self {
            contents: vec![Content {
                role: Some("user"),
                parts,
            }],
            generation_config: WireGenerationConfig {
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                max_output_tokens: params.max_output_tokens,
                stop_sequences: &params.stop_sequences,
            },
            system_instruction: (!system.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part::Text { text: system }],
            }),
        }
    }
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let parts = &candidate.content.as_ref()?.parts;
        Some(parts.iter().filter_map(|p| p.text.as_deref()).collect())
    }

    fn is_finished(&self) -> bool {
        self.candidates
            .first()
            .map(|c| c.finish_reason.is_some())
            .unwrap_or(false)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u32>,
}
