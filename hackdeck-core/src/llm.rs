//! HTTP clients for the supported language-model providers.
//!
//! Both clients map throttling (429, and Anthropic's 529 "overloaded") to
//! [`PipelineError::LlmRateLimit`] carrying the `retry-after` hint, and every other
//! failure, timeouts included, to [`PipelineError::LlmProvider`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::LlmSettings;
use crate::contract::{CompletionRequest, LanguageModel};
use crate::error::{PipelineError, Result};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-sonnet-latest";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// API keys read from the environment. Never logged.
#[derive(Clone, Default)]
pub struct ProviderCredentials {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "***"))
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Pick the first provider with a configured key: Claude, then OpenAI.
pub fn select_language_model(
    credentials: &ProviderCredentials,
    settings: &LlmSettings,
) -> Result<Arc<dyn LanguageModel>> {
    let non_empty = |key: &Option<String>| key.as_deref().map(str::trim).filter(|k| !k.is_empty()).map(str::to_string);
    if let Some(key) = non_empty(&credentials.anthropic_api_key) {
        info!(provider = "claude", "Selected language model provider");
        return Ok(Arc::new(AnthropicClient::new(key, settings)?));
    }
    if let Some(key) = non_empty(&credentials.openai_api_key) {
        info!(provider = "openai", "Selected language model provider");
        return Ok(Arc::new(OpenAiClient::new(key, settings)?));
    }
    Err(PipelineError::config(
        "no LLM provider configured: set ANTHROPIC_API_KEY or OPENAI_API_KEY",
    ))
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::internal(format!("failed to build HTTP client: {e}")))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Shared status handling: throttling vs. other errors.
async fn check_status(provider: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let hint = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529 {
        warn!(provider, status = status.as_u16(), retry_after = ?hint, "Provider is throttling");
        return Err(PipelineError::LlmRateLimit {
            provider: provider.to_string(),
            retry_after: hint,
        });
    }
    error!(provider, status = status.as_u16(), body = %body, "Provider returned an error");
    Err(PipelineError::provider(
        provider,
        format!("HTTP {}: {}", status.as_u16(), body.chars().take(500).collect::<String>()),
    ))
}

fn transport_error(provider: &'static str, e: &reqwest::Error) -> PipelineError {
    if e.is_timeout() {
        PipelineError::provider(provider, "request timed out")
    } else {
        PipelineError::provider(provider, format!("request failed: {e}"))
    }
}

/// Anthropic Messages API.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub const PROVIDER: &'static str = "claude";

    pub fn new(api_key: impl Into<String>, settings: &LlmSettings) -> Result<Self> {
        Ok(Self {
            client: http_client(settings.timeout())?,
            api_key: api_key.into(),
            base_url: settings.anthropic_base_url.trim_end_matches('/').to_string(),
            default_model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl LanguageModel for AnthropicClient {
    fn provider(&self) -> &'static str {
        Self::PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = AnthropicRequest {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };
        debug!(provider = Self::PROVIDER, model, prompt_bytes = request.prompt.len(), "Sending completion request");
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Self::PROVIDER, &e))?;
        let response = check_status(Self::PROVIDER, response).await?;
        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            PipelineError::provider(Self::PROVIDER, format!("unreadable response body: {e}"))
        })?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            return Err(PipelineError::malformed("provider returned no text"));
        }
        Ok(text)
    }
}

/// OpenAI Chat Completions API.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub const PROVIDER: &'static str = "openai";

    pub fn new(api_key: impl Into<String>, settings: &LlmSettings) -> Result<Self> {
        Ok(Self {
            client: http_client(settings.timeout())?,
            api_key: api_key.into(),
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            default_model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiClient {
    fn provider(&self) -> &'static str {
        Self::PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = OpenAiRequest {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };
        debug!(provider = Self::PROVIDER, model, prompt_bytes = request.prompt.len(), "Sending completion request");
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Self::PROVIDER, &e))?;
        let response = check_status(Self::PROVIDER, response).await?;
        let parsed: OpenAiResponse = response.json().await.map_err(|e| {
            PipelineError::provider(Self::PROVIDER, format!("unreadable response body: {e}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| PipelineError::malformed("provider returned no text"))
    }
}
