use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{CapabilityError, ReasoningCapability, ReasoningOutput, ReasoningRequest};
use crate::config::LlmConfig;
use crate::{ResearchError, SecretValue};

/// OpenAI-compatible chat-completions backend running in JSON mode.
#[derive(Debug, Clone)]
pub struct OpenAiCapability {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretValue,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl OpenAiCapability {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretValue,
        timeout: Duration,
    ) -> Result<Self, ResearchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                ResearchError::InvalidConfiguration(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ResearchError> {
        let api_key = crate::require_env(&config.api_key_env)?;
        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key,
            Duration::from_millis(config.request_timeout_ms),
        )
    }
}

/// Render the system and user messages for a request.
pub(crate) fn render_prompt(request: &ReasoningRequest) -> (String, String) {
    let mut system = String::new();
    let _ = writeln!(system, "{}", request.instruction.trim());
    let _ = writeln!(
        system,
        "\nRespond with a single JSON object containing exactly these keys:"
    );
    for field in &request.outputs {
        let _ = writeln!(system, "- \"{}\": {}", field.name, field.description);
    }

    let mut user = String::new();
    for (name, value) in &request.inputs {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(user, "## {name}\n{rendered}\n");
    }

    (system, user.trim_end().to_string())
}

fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::RateLimited(detail)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CapabilityError::Network(detail)
    } else {
        CapabilityError::Rejected(detail)
    }
}

#[async_trait]
impl ReasoningCapability for OpenAiCapability {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, CapabilityError> {
        let (system, user) = render_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system,
                },
                ChatMessage {
                    role: "user".into(),
                    content: user,
                },
            ],
        };

        debug!(signature = %request.signature, model = %self.model, "sending chat completion");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CapabilityError::Timeout
                } else {
                    CapabilityError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| CapabilityError::Network(err.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|err| {
            CapabilityError::MalformedOutput(format!("completion envelope: {err}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CapabilityError::MalformedOutput("no completion choices".into()))?;
        let value: Value = serde_json::from_str(content.trim())
            .map_err(|err| CapabilityError::MalformedOutput(format!("completion body: {err}")))?;

        ReasoningOutput::from_json(value)
    }
}
