//! Ollama provider (local model server) with NDJSON streaming

use crate::provider::{InferenceError, InferenceProvider, LlmResult, TextStream};
use crate::types::{Generation, ImageInput, ProviderKind, StreamDelta};
use dixi_core::config::GenerationConfig;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

const KIND: ProviderKind = ProviderKind::Ollama;

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    vision_model: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            vision_model: model.clone(),
            model,
        }
    }

    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = model.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Names of the installed models.
    pub async fn list_models(&self) -> LlmResult<Vec<String>> {
        let response = self
            .client
            .get(self.url("tags"))
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        let response = check_status(response).await?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Whether an installed model matches the configured vision model family
    /// (`llava` matches `llava:13b`).
    pub async fn has_vision_model(&self) -> LlmResult<bool> {
        let family = self
            .vision_model
            .split(':')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.to_lowercase().contains(&family)))
    }

    async fn post_generate(&self, body: &GenerateRequest<'_>) -> LlmResult<Response> {
        debug!("Ollama request: model={} stream={}", body.model, body.stream);
        let response = self
            .client
            .post(self.url("generate"))
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        check_status(response).await
    }

    async fn generate_once(&self, body: &GenerateRequest<'_>) -> LlmResult<Generation> {
        let response = self.post_generate(body).await?;
        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::from_reqwest(KIND, e))?;
        if let Some(message) = reply.error {
            return Err(InferenceError::rejected(KIND, message));
        }
        Ok(Generation {
            text: reply.response,
            token_count: reply.eval_count,
        })
    }
}

#[async_trait::async_trait]
impl InferenceProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn vision_model(&self) -> &str {
        &self.vision_model
    }

    async fn probe(&self) -> LlmResult<()> {
        self.list_models().await.map(|_| ())
    }

    async fn generate(&self, prompt: &str, params: &GenerationConfig) -> LlmResult<Generation> {
        let body = GenerateRequest::new(&self.model, prompt, params, false);
        self.generate_once(&body).await
    }

    async fn generate_stream(&self, prompt: &str, params: &GenerationConfig) -> LlmResult<TextStream> {
        let body = GenerateRequest::new(&self.model, prompt, params, true);
        let response = self.post_generate(&body).await?;
        Ok(Box::pin(parse_ndjson_stream(response.bytes_stream())))
    }

    async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        params: &GenerationConfig,
    ) -> LlmResult<Generation> {
        if !self.has_vision_model().await? {
            return Err(InferenceError::rejected(
                KIND,
                format!("vision model '{}' is not installed", self.vision_model),
            ));
        }
        let mut body = GenerateRequest::new(&self.vision_model, prompt, params, false);
        body.images.push(image.base64());
        self.generate_once(&body).await
    }
}

async fn check_status(response: Response) -> LlmResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    error!("Ollama error {}: {}", status, error_text);
    if status.is_server_error() {
        Err(InferenceError::unavailable(KIND, format!("{}: {}", status, error_text)))
    } else {
        Err(InferenceError::rejected(KIND, format!("{}: {}", status, error_text)))
    }
}

/// One JSON object per line; a line with `done: true` ends the response.
/// Bytes are buffered raw and only complete lines are decoded, so a
/// character split across chunks survives intact.
fn parse_ndjson_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();

        tokio::pin!(bytes_stream);

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(InferenceError::from_reqwest(KIND, e));
                    return;
                }
            };

            buffer.extend_from_slice(&chunk);

            while let Some(line_end) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=line_end).collect();
                let line = String::from_utf8_lossy(&raw[..line_end]);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                for delta in decode_line(line) {
                    let done = matches!(delta, Ok(StreamDelta::Done)) || delta.is_err();
                    yield delta;
                    if done {
                        return;
                    }
                }
            }
        }

        let tail = String::from_utf8_lossy(&buffer);
        let tail = tail.trim();
        if !tail.is_empty() {
            for delta in decode_line(tail) {
                yield delta;
            }
        }
    }
}

fn decode_line(line: &str) -> Vec<LlmResult<StreamDelta>> {
    let chunk: GenerateResponse = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            return vec![Err(InferenceError::rejected(
                KIND,
                format!("malformed stream line: {}", e),
            ))]
        }
    };
    if let Some(message) = chunk.error {
        return vec![Err(InferenceError::rejected(KIND, message))];
    }
    let mut deltas = Vec::new();
    if !chunk.response.is_empty() {
        deltas.push(Ok(StreamDelta::Text(chunk.response)));
    }
    if chunk.done {
        deltas.push(Ok(StreamDelta::Done));
    }
    deltas
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    options: GenerateOptions<'a>,
}

impl<'a> GenerateRequest<'a> {
    fn new(model: &'a str, prompt: &'a str, params: &'a GenerationConfig, stream: bool) -> Self {
        Self {
            model,
            prompt,
            stream,
            system: &params.system_instruction,
            images: Vec::new(),
            options: GenerateOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                num_predict: params.max_output_tokens,
                stop: &params.stop_sequences,
                num_ctx: params.context_window,
            },
        }
    }
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    num_predict: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    num_ctx: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_translates_generation_params() {
        let params = GenerationConfig {
            stop_sequences: vec!["User:".into()],
            ..Default::default()
        };
        let body = GenerateRequest::new("gemma3:4b", "hi", &params, false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gemma3:4b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["top_k"], 40);
        assert_eq!(json["options"]["num_predict"], 512);
        assert_eq!(json["options"]["num_ctx"], 4096);
        assert_eq!(json["options"]["stop"][0], "User:");
        assert!(json.get("images").is_none());
    }

    #[test]
    fn decode_line_emits_text_then_done() {
        let deltas = decode_line(r#"{"response":"bye","done":true}"#);
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[0], Ok(StreamDelta::Text(t)) if t == "bye"));
        assert!(matches!(deltas[1], Ok(StreamDelta::Done)));
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks_is_preserved() {
        let line = "{\"response\":\"caf\u{e9}\",\"done\":true}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let chunks = vec![
            Ok::<_, reqwest::Error>(bytes::Bytes::copy_from_slice(&line[..split])),
            Ok(bytes::Bytes::copy_from_slice(&line[split..])),
        ];

        let deltas: Vec<_> = parse_ndjson_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[0], Ok(StreamDelta::Text(t)) if t == "caf\u{e9}"));
        assert!(matches!(deltas[1], Ok(StreamDelta::Done)));
    }

    #[test]
    fn decode_line_reports_errors() {
        assert!(matches!(
            decode_line(r#"{"error":"model not found"}"#)[0],
            Err(InferenceError::ProviderRejected { .. })
        ));
        assert!(decode_line("{not json")[0].is_err());
    }
}
