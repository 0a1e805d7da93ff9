use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    error::LLMError,
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub title: Option<String>,
}

impl OpenRouterConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            title: Some("pruefwerk".to_string()),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouter {
    client: Client,
    config: OpenRouterConfig,
}

impl OpenRouter {
    pub fn from_config(config: OpenRouterConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder.bearer_auth(&self.config.api_key);

        if let Some(ref title) = self.config.title {
            builder = builder.header("X-Title", title);
        }

        builder
    }
}

#[derive(Debug, Serialize)]
struct OpenRouterRequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponseBody {
    choices: Vec<OpenRouterChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterErrorBody {
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    message: String,
}

#[async_trait]
impl LLMProvider for OpenRouter {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        let CompletionRequest {
            model,
            messages,
            max_tokens,
            temperature,
        } = request;

        let body = OpenRouterRequestBody {
            model,
            messages,
            max_tokens,
            temperature,
        };

        let builder = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(&body);

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            let message = serde_json::from_str::<OpenRouterErrorBody>(&text)
                .ok()
                .and_then(|body| body.error)
                .map(|error| error.message)
                .unwrap_or(text);

            return Err(LLMError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: OpenRouterResponseBody = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
        })
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}
