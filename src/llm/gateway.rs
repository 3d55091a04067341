use crate::http::build_client;
use eyre::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One provider endpoint behind the chat-completion contract. Two instances
/// exist at runtime: a vision-capable one for expiry analysis and a text-only
/// one for price analysis, both selected purely by env configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl GatewayConfig {
    pub fn vision_from_env() -> Self {
        Self {
            base_url: std::env::var("VISION_GATEWAY_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("VISION_GATEWAY_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        }
    }

    pub fn pricing_from_env() -> Self {
        Self {
            base_url: std::env::var("PRICING_GATEWAY_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com".into()),
            api_key: std::env::var("PRICING_GATEWAY_KEY")
                .or_else(|_| std::env::var("DEEPSEEK_API_KEY"))
                .ok(),
            model: std::env::var("PRICING_MODEL").unwrap_or_else(|_| "deepseek-chat".into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network-level failure: DNS, refused connection, timeout. The hosting
    /// request's deadline shows up here too.
    #[error("gateway transport error: {0}")]
    Transport(String),
    /// The provider answered, but not usefully: non-2xx status or a body
    /// that does not match the chat-completion shape.
    #[error("gateway provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrlRef {
                        url: image_url.into(),
                    },
                },
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlRef },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrlRef {
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Overrides the configured model for this call; engines leave it unset.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// Number of candidate choices to request. Callers that validate
    /// defensively ask for more than one.
    pub n: Option<u8>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    /// Provider default; only `Json` changes the request body.
    #[allow(dead_code)]
    Text,
}

/// Candidate texts in provider order. Choice order matters: validation walks
/// them front to back and accepts the first that passes.
#[derive(Debug, Clone)]
pub struct RawModelResponse {
    pub choices: Vec<String>,
}

/// The single outbound seam to the hosted model. Kept as a trait so tests
/// substitute a scripted gateway instead of manipulating env vars. No retry
/// logic lives here; callers own retry policy for their own fallback
/// semantics.
#[async_trait::async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<RawModelResponse, GatewayError>;
}

pub struct ChatGateway {
    http: Client,
    config: GatewayConfig,
}

impl ChatGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl ModelGateway for ChatGateway {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<RawModelResponse, GatewayError> {
        let base = self.config.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(GatewayError::Provider("missing gateway url".into()));
        }

        let body = ChatCompletionRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: messages.to_vec(),
            temperature: options.temperature,
            n: options.n,
            max_tokens: options.max_tokens,
            response_format: match options.response_format {
                Some(ResponseFormat::Json) => Some(ResponseFormatSpec {
                    r#type: "json_object",
                }),
                _ => None,
            },
        };

        let mut request = self.http.post(format!("{base}/chat/completions")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Provider(format!(
                "HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Provider(format!("invalid response body: {err}")))?;

        let choices: Vec<String> = payload
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect();

        if choices.is_empty() {
            return Err(GatewayError::Provider("response contained no choices".into()));
        }

        Ok(RawModelResponse { choices })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Debug, Serialize)]
struct ResponseFormatSpec {
    r#type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
