//! OpenAI-compatible chat-completions client.
//!
//! Each [`CompletionRequest`] becomes one `POST {base_url}/chat/completions`
//! with two messages: the request prompt as the system message and the
//! structured context as the user message.

use accessfix_core::{CompletionRequest, Intelligence, IntelligenceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{
    intelligence_status_error, intelligence_transport_error, AdapterError, Result,
};

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_MODEL: &str = "moonshotai/kimi-k2-instruct";
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 5000;
const USER_AGENT: &str = concat!("accessfix/", env!("CARGO_PKG_VERSION"));

/// Model endpoint settings.
#[derive(Clone, PartialEq)]
pub struct IntelligenceConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl std::fmt::Debug for IntelligenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelligenceConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl IntelligenceConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Read GROQ_API_KEY (required), INTELLIGENCE_BASE_URL, MODEL_NAME,
    /// TEMPERATURE and MAX_TOKENS.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`IntelligenceConfig::from_env`] over an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("GROQ_API_KEY").ok_or(AdapterError::MissingEnv("GROQ_API_KEY"))?;
        let mut config = Self::new(api_key);

        if let Some(url) = get("INTELLIGENCE_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("MODEL_NAME") {
            config.model = model;
        }
        if let Some(raw) = get("TEMPERATURE") {
            config.temperature = raw.trim().parse().map_err(|_| AdapterError::InvalidEnv {
                name: "TEMPERATURE",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = get("MAX_TOKENS") {
            config.max_tokens = raw.trim().parse().map_err(|_| AdapterError::InvalidEnv {
                name: "MAX_TOKENS",
                value: raw.clone(),
            })?;
        }
        Ok(config)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// [`Intelligence`] over an OpenAI-compatible HTTP endpoint.
pub struct ChatCompletionsClient {
    config: IntelligenceConfig,
    http: reqwest::Client,
}

impl ChatCompletionsClient {
    /// Per-call timeouts are applied by the transport policy, not here.
    pub fn new(config: IntelligenceConfig) -> Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(IntelligenceConfig::from_env()?)
    }

    pub fn config(&self) -> &IntelligenceConfig {
        &self.config
    }

    fn body<'a>(&'a self, request: &CompletionRequest) -> ChatRequest<'a> {
        let context = if request.context.is_null() {
            String::new()
        } else {
            serde_json::to_string_pretty(&request.context).unwrap_or_default()
        };
        ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(request.prompt.clone()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(context),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        }
    }
}

#[async_trait]
impl Intelligence for ChatCompletionsClient {
    #[instrument(skip(self, request), fields(purpose = %request.purpose, subject = %request.subject, model = %self.config.model))]
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<String, IntelligenceError> {
        let response = self
            .http
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.body(&request))
            .send()
            .await
            .map_err(intelligence_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(intelligence_status_error(status.as_u16(), &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| IntelligenceError::MalformedResponse(format!("unreadable completion: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                IntelligenceError::MalformedResponse("completion has no message content".to_string())
            })?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}
