//! LLM client contract (§6) — three structured entry points: analyze,
//! test-synthesize, fix-synthesize. Modeled as three distinct functions
//! returning three distinct artifact variants, never a union bag (§9
//! "Polymorphic LLM responses").

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,
}

/// Raw prompt/response boundary. Each structured call below builds its
/// prompt from domain inputs and parses the returned text into its own
/// artifact type; this trait only knows about text in, text out.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Submit `prompt` and return the model's raw text response.
    ///
    /// Implementations must enforce a request timeout (recommended <= 60s,
    /// §6) and a temperature <= 0.2, since all three call sites expect
    /// near-deterministic structured output.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TEMPERATURE: f32 = 0.1;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, serde::Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: [MessageIn<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, serde::Serialize)]
struct MessageIn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, serde::Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, serde::Deserialize)]
struct MessagesErrorResponse {
    error: MessagesErrorBody,
}

#[derive(Debug, serde::Deserialize)]
struct MessagesErrorBody {
    message: String,
}

/// HTTP implementation of [`LlmClient`] against an Anthropic-compatible
/// Messages API, with near-deterministic sampling settings (§6: low
/// temperature, bounded timeout) since callers parse structured JSON out
/// of the response text.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpLlmClient {
    /// # Panics
    ///
    /// Panics if the underlying `reqwest::Client` cannot be built (e.g. TLS
    /// backend initialization failure) — this only happens on a broken
    /// runtime, not from bad input.
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("building reqwest client");
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            messages: [MessageIn {
                role: "user",
                content: prompt,
            }],
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<MessagesErrorResponse>(&body) {
                return Err(LlmError::Request(error.error.message));
            }
            return Err(LlmError::Request(format!("endpoint returned {status}: {body}")));
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Request(format!("malformed response: {e}")))?;
        Ok(parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn complete_joins_content_blocks_from_a_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "{\"confidence\": 0.9}"}],
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "claude-sonnet-4-20250514", "test-key");
        let response = client.complete("analyze this traceback").await.unwrap();
        assert_eq!(response, r#"{"confidence": 0.9}"#);
    }

    #[tokio::test]
    async fn complete_surfaces_the_provider_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"type": "invalid_request_error", "message": "model not found"},
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "bogus-model", "test-key");
        let err = client.complete("hello").await.unwrap_err();
        assert!(matches!(err, LlmError::Request(msg) if msg == "model not found"));
    }
}
