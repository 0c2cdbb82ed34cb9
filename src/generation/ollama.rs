//! Ollama HTTP client (`POST /api/generate`, non-streaming)

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{generate_within, Completion, GenerationClient, GenerationRequest};
use crate::error::{AskError, Result};

/// Sampling options sent with every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaOptions {
    pub temperature: f32,
    /// Default completion token budget
    pub num_predict: u32,
    pub num_ctx: u32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl Default for OllamaOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            num_predict: 96,
            num_ctx: 1024,
            top_k: 20,
            top_p: 0.9,
            repeat_penalty: 1.1,
        }
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
    options: BodyOptions<'a>,
}

#[derive(Serialize)]
struct BodyOptions<'a> {
    #[serde(flatten)]
    base: OllamaOptions,
    #[serde(skip_serializing_if = "no_stop")]
    stop: &'a [String],
}

fn no_stop(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
    /// Nanoseconds
    total_duration: Option<u64>,
}

/// Client for a local or remote Ollama server
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    keep_alive: String,
    options: OllamaOptions,
}

impl OllamaClient {
    /// Build a client; the base URL's trailing slash is ignored
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        keep_alive: impl Into<String>,
        options: OllamaOptions,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(6))
            .build()
            .map_err(|e| AskError::config_error(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            keep_alive: keep_alive.into(),
            options,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One-token probe; also loads the model into memory
    pub async fn health(&self, timeout: Duration) -> Result<Completion> {
        let request = GenerationRequest::new("SELECT 1", timeout).with_max_tokens(1);
        generate_within(self, &request).await
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest) -> GenerateBody<'a> {
        let mut base = self.options.clone();
        if let Some(max_tokens) = request.max_tokens {
            base.num_predict = max_tokens;
        }
        GenerateBody {
            model: &self.model,
            prompt: &request.prompt,
            stream: false,
            keep_alive: &self.keep_alive,
            options: BodyOptions { base, stop: &request.stop },
        }
    }
}

impl GenerationClient for OllamaClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
        let url = format!("{}/api/generate", self.base_url);
        let started = Instant::now();
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);

        let response = self
            .http
            .post(&url)
            .timeout(request.timeout)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AskError::GenerationTimeout { timeout_ms }
                } else {
                    AskError::generation_failed(format!("Request to {url} failed: {e}"))
                }
            })?
            .error_for_status()
            .map_err(|e| AskError::generation_failed(format!("Generation service error: {e}")))?;

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AskError::generation_failed(format!("Invalid generation response: {e}")))?;

        let duration =
            payload.total_duration.map_or_else(|| started.elapsed(), Duration::from_nanos);

        Ok(Completion {
            text: payload.response,
            model: payload.model.or_else(|| Some(self.model.clone())),
            prompt_tokens: payload.prompt_eval_count,
            completion_tokens: payload.eval_count,
            duration,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OllamaClient {
        OllamaClient::new("http://127.0.0.1:11434/", "codellama:7b", "5m", OllamaOptions::default())
            .unwrap()
    }

    #[test]
    fn test_base_url_trimmed() {
        assert_eq!(client().base_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn test_request_body_shape() {
        let client = client();
        let request = GenerationRequest::new("Question", Duration::from_secs(5))
            .with_stop("</SQL>")
            .with_max_tokens(256);
        let body = serde_json::to_value(client.body(&request)).unwrap();

        assert_eq!(body["model"], "codellama:7b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["keep_alive"], "5m");
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["options"]["top_k"], 20);
        assert_eq!(body["options"]["stop"], serde_json::json!(["</SQL>"]));
    }

    #[test]
    fn test_stop_omitted_when_empty() {
        let client = client();
        let request = GenerationRequest::new("Question", Duration::from_secs(5));
        let body = serde_json::to_value(client.body(&request)).unwrap();
        assert!(body["options"].get("stop").is_none());
        assert_eq!(body["options"]["num_predict"], 96);
    }

    #[test]
    fn test_response_parsing() {
        let payload: GenerateResponse = serde_json::from_str(
            r#"{"model":"codellama:7b","response":"SELECT 1","prompt_eval_count":12,"eval_count":4,"total_duration":2500000000,"done":true}"#,
        )
        .unwrap();
        assert_eq!(payload.response, "SELECT 1");
        assert_eq!(payload.prompt_eval_count, 12);
        assert_eq!(payload.total_duration.map(Duration::from_nanos), Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_generation_failure() {
        // Port 9 (discard) is closed on test machines; the connection is refused
        let client =
            OllamaClient::new("http://127.0.0.1:9", "m", "5m", OllamaOptions::default()).unwrap();
        let request = GenerationRequest::new("q", Duration::from_secs(3));
        let err = generate_within(&client, &request).await.unwrap_err();
        assert!(matches!(
            err,
            AskError::GenerationFailed(_) | AskError::GenerationTimeout { .. }
        ));
    }
}
