//! The reasoning capability: a black-box natural-language inference service.
//!
//! Every pipeline stage talks to it through [`ReasoningRequest`] (an instruction
//! plus typed input fields and declared output fields) and receives a
//! [`ReasoningOutput`]. Failures are classified into [`CapabilityError`] and
//! retried according to an explicit [`RetryPolicy`] supplied per call.

pub mod offline;
pub mod openai;

pub use offline::OfflineCapability;
pub use openai::OpenAiCapability;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ResearchError;
use crate::config::LlmConfig;

/// Signature names of the calls the pipeline issues.
pub mod signature {
    pub const SCORE_RELEVANCE: &str = "score_relevance";
    pub const ANALYZE_QUESTION: &str = "analyze_question";
    pub const EXTRACT_EVIDENCE: &str = "extract_evidence";
    pub const COMPOSE_ANSWER: &str = "compose_answer";
    pub const NEXT_STEP: &str = "next_step";
    pub const EXTRACT_FINDINGS: &str = "extract_findings";
    pub const ASSESS_CONFIDENCE: &str = "assess_confidence";
    pub const FOLLOW_UP_QUESTIONS: &str = "follow_up_questions";
}

/// Classified failure of a single capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("capability call timed out")]
    Timeout,
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::MalformedOutput(_) => "malformed_output",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputField {
    pub name: String,
    pub description: String,
}

/// One structured call: instruction, ordered inputs, declared outputs.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    /// Stable name of the call shape, e.g. `score_relevance`.
    pub signature: String,
    pub instruction: String,
    pub inputs: Vec<(String, Value)>,
    pub outputs: Vec<OutputField>,
}

impl ReasoningRequest {
    pub fn new(signature: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            instruction: instruction.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.push((name.into(), value.into()));
        self
    }

    pub fn output(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.outputs.push(OutputField {
            name: name.into(),
            description: description.into(),
        });
        self
    }

    pub fn input_value(&self, name: &str) -> Option<&Value> {
        self.inputs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Input rendered as plain text; empty when absent.
    pub fn input_text(&self, name: &str) -> String {
        match self.input_value(name) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn check(&self, output: ReasoningOutput) -> Result<ReasoningOutput, CapabilityError> {
        let missing: Vec<&str> = self
            .outputs
            .iter()
            .filter(|field| matches!(output.get(&field.name), None | Some(Value::Null)))
            .map(|field| field.name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(output)
        } else {
            Err(CapabilityError::MalformedOutput(format!(
                "{} response missing field(s): {}",
                self.signature,
                missing.join(", ")
            )))
        }
    }
}

/// Structured fields returned by the capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningOutput {
    fields: Map<String, Value>,
}

impl ReasoningOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: Value) -> Result<Self, CapabilityError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(CapabilityError::MalformedOutput(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Result<String, CapabilityError> {
        match self.fields.get(name) {
            Some(Value::String(text)) => Ok(text.trim().to_string()),
            Some(Value::Array(items)) => Ok(items
                .iter()
                .map(value_as_text)
                .collect::<Vec<_>>()
                .join("\n")),
            Some(Value::Null) | None => Err(missing(name)),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// Numeric field; accepts JSON numbers and numeric strings (`"0.8"`, `"80%"`).
    pub fn number(&self, name: &str) -> Result<f64, CapabilityError> {
        let parsed = match self.fields.get(name) {
            Some(Value::Number(number)) => number.as_f64(),
            Some(Value::String(text)) => parse_number(text),
            Some(Value::Null) | None => return Err(missing(name)),
            Some(_) => None,
        };
        parsed.filter(|value| value.is_finite()).ok_or_else(|| {
            CapabilityError::MalformedOutput(format!("field `{name}` is not a number"))
        })
    }

    /// List field; accepts JSON arrays or newline/bullet separated text.
    pub fn list(&self, name: &str) -> Vec<String> {
        let raw: Vec<String> = match self.fields.get(name) {
            Some(Value::Array(items)) => items.iter().map(value_as_text).collect(),
            Some(Value::String(text)) => text.lines().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        raw.iter().filter_map(|item| clean_list_item(item)).collect()
    }
}

fn missing(name: &str) -> CapabilityError {
    CapabilityError::MalformedOutput(format!("field `{name}` missing"))
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if let Some(percent) = trimmed.strip_suffix('%') {
        return percent.trim().parse::<f64>().ok().map(|value| value / 100.0);
    }
    trimmed.parse::<f64>().ok()
}

/// Strip bullets and ordinal prefixes from a list line; `None` when nothing remains.
pub(crate) fn clean_list_item(item: &str) -> Option<String> {
    let mut text = item.trim();
    text = text.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = text.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &text[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            text = stripped.trim_start();
        }
    }
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Bounded retry with exponential backoff, attached to each capability call.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        8_000
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// `max_attempts` attempts without sleeping between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

#[async_trait]
pub trait ReasoningCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, CapabilityError>;
}

pub type DynCapability = Arc<dyn ReasoningCapability>;

/// Invoke the capability, retrying retryable failures per `policy`.
///
/// Declared output fields are validated here, so a response missing one counts
/// as a retryable `MalformedOutput`.
pub async fn invoke_with_retry(
    capability: &dyn ReasoningCapability,
    request: &ReasoningRequest,
    policy: &RetryPolicy,
) -> Result<ReasoningOutput, CapabilityError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    let mut backoff_ms = policy.initial_backoff_ms;

    loop {
        debug!(
            capability = capability.name(),
            signature = %request.signature,
            attempt,
            "invoking reasoning capability"
        );

        let result = capability
            .invoke(request)
            .await
            .and_then(|output| request.check(output));

        match result {
            Ok(output) => return Ok(output),
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                warn!(
                    signature = %request.signature,
                    error = %err,
                    attempt,
                    backoff_ms,
                    "capability call failed, retrying"
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                backoff_ms = backoff_ms.saturating_mul(2).min(policy.max_backoff_ms);
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    signature = %request.signature,
                    error = %err,
                    attempts = attempt,
                    "capability call failed permanently"
                );
                return Err(err);
            }
        }
    }
}

static DEFAULT_CAPABILITY: OnceLock<DynCapability> = OnceLock::new();

/// Install the process-wide default capability. Returns `false` if one was already set.
pub fn install_default(capability: DynCapability) -> bool {
    DEFAULT_CAPABILITY.set(capability).is_ok()
}

pub fn default_capability() -> Option<DynCapability> {
    DEFAULT_CAPABILITY.get().cloned()
}

/// Build the capability named by `llm.provider`.
pub fn from_config(config: &LlmConfig) -> Result<DynCapability, ResearchError> {
    match config.provider.trim().to_ascii_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiCapability::from_config(config)?)),
        "offline" => Ok(Arc::new(OfflineCapability::new())),
        other => Err(ResearchError::InvalidConfiguration(format!(
            "unknown llm.provider `{other}` (expected `openai` or `offline`)"
        ))),
    }
}
