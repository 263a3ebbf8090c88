use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::capability::RetryPolicy;
use crate::{ResearchError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "webresearch.toml";
const CONFIG_PATH_ENV: &str = "WEBRESEARCH_CONFIG";
const MAX_FOLLOW_UPS: usize = 5;

/// Top-level configuration structure. Every section is optional in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResearchConfig {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub followup: FollowUpConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl ResearchConfig {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, ResearchError> {
        require_env(&self.llm.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `WEBRESEARCH_CONFIG` environment variable.
    /// 3. `webresearch.toml` in the current working directory, if present.
    /// 4. Built-in defaults.
    pub fn load(path: Option<PathBuf>) -> Result<ResearchConfig, ResearchError> {
        let config = match resolve_path(path) {
            Some(candidate) => Self::load_file(&candidate)?,
            None => ResearchConfig::default(),
        };

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<ResearchConfig, ResearchError> {
        let config: ResearchConfig = toml::from_str(raw)
            .map_err(|err| ResearchError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<ResearchConfig, ResearchError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ResearchError::config_io(path.to_path_buf(), err))?;
        toml::from_str(&raw).map_err(|err| ResearchError::InvalidConfiguration(err.to_string()))
    }

    pub fn validate(config: &ResearchConfig) -> Result<(), ResearchError> {
        let invalid = |msg: &str| Err(ResearchError::InvalidConfiguration(msg.to_string()));

        if config.acquisition.timeout_ms == 0 {
            return invalid("acquisition.timeout_ms must be greater than zero");
        }
        if config.acquisition.max_concurrency == 0 {
            return invalid("acquisition.max_concurrency must be greater than zero");
        }
        if config.ranking.top_k == 0 {
            return invalid("ranking.top_k must be at least 1");
        }
        if config.ranking.word_budget == 0 {
            return invalid("ranking.word_budget must be greater than zero");
        }
        if config.reasoning.max_loop_iterations == 0 {
            return invalid("reasoning.max_loop_iterations must be at least 1");
        }
        if config.reasoning.retry.max_attempts == 0 {
            return invalid("reasoning.retry.max_attempts must be at least 1");
        }
        if !(1..=MAX_FOLLOW_UPS).contains(&config.followup.max_questions) {
            return invalid("followup.max_questions must be between 1 and 5");
        }
        if !(0.0..=1.0).contains(&config.confidence.self_assessment_weight) {
            return invalid("confidence.self_assessment_weight must be within [0, 1]");
        }
        if config.confidence.corroboration_cap == 0 {
            return invalid("confidence.corroboration_cap must be at least 1");
        }
        if config.pipeline.request_timeout_ms == 0 {
            return invalid("pipeline.request_timeout_ms must be greater than zero");
        }
        if config.llm.provider.trim().is_empty() {
            return invalid("llm.provider must not be empty");
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }

    let fallback = Path::new(DEFAULT_CONFIG_PATH);
    fallback.exists().then(|| fallback.to_path_buf())
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "AcquisitionConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "AcquisitionConfig::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "AcquisitionConfig::default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default = "AcquisitionConfig::default_max_headings")]
    pub max_headings: usize,
    #[serde(default = "AcquisitionConfig::default_user_agent")]
    pub user_agent: String,
}

impl AcquisitionConfig {
    const fn default_timeout_ms() -> u64 {
        10_000
    }

    const fn default_max_concurrency() -> usize {
        8
    }

    const fn default_max_body_chars() -> usize {
        15_000
    }

    const fn default_max_headings() -> usize {
        10
    }

    fn default_user_agent() -> String {
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 webresearch/0.1".to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            max_concurrency: Self::default_max_concurrency(),
            max_body_chars: Self::default_max_body_chars(),
            max_headings: Self::default_max_headings(),
            user_agent: Self::default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "RankingConfig::default_top_k")]
    pub top_k: usize,
    /// Cumulative word cap for the research context.
    #[serde(default = "RankingConfig::default_word_budget")]
    pub word_budget: usize,
    /// Body characters shown to the relevance judgement per document.
    #[serde(default = "RankingConfig::default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl RankingConfig {
    const fn default_top_k() -> usize {
        5
    }

    const fn default_word_budget() -> usize {
        12_000
    }

    const fn default_excerpt_chars() -> usize {
        6_000
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: Self::default_top_k(),
            word_budget: Self::default_word_budget(),
            excerpt_chars: Self::default_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "ReasoningConfig::default_max_loop_iterations")]
    pub max_loop_iterations: usize,
    #[serde(default = "ReasoningConfig::default_observation_chars")]
    pub observation_chars: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ReasoningConfig {
    const fn default_max_loop_iterations() -> usize {
        5
    }

    const fn default_observation_chars() -> usize {
        4_000
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: Self::default_max_loop_iterations(),
            observation_chars: Self::default_observation_chars(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default = "ConfidenceConfig::default_corroboration_cap")]
    pub corroboration_cap: usize,
    #[serde(default = "ConfidenceConfig::default_self_assessment_weight")]
    pub self_assessment_weight: f64,
}

impl ConfidenceConfig {
    const fn default_corroboration_cap() -> usize {
        5
    }

    const fn default_self_assessment_weight() -> f64 {
        0.3
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            corroboration_cap: Self::default_corroboration_cap(),
            self_assessment_weight: Self::default_self_assessment_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default = "FollowUpConfig::default_max_questions")]
    pub max_questions: usize,
}

impl FollowUpConfig {
    const fn default_max_questions() -> usize {
        3
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            max_questions: Self::default_max_questions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl PipelineConfig {
    const fn default_request_timeout_ms() -> u64 {
        120_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_provider")]
    pub provider: String,
    #[serde(default = "LlmConfig::default_model")]
    pub model: String,
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LlmConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl LlmConfig {
    fn default_provider() -> String {
        "openai".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    const fn default_request_timeout_ms() -> u64 {
        60_000
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            base_url: Self::default_base_url(),
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = ResearchConfig::default();
        assert_eq!(config.acquisition.timeout_ms, 10_000);
        assert_eq!(config.ranking.top_k, 5);
        assert_eq!(config.reasoning.max_loop_iterations, 5);
        assert_eq!(config.followup.max_questions, 3);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            [ranking]
            top_k = 2

            [reasoning]
            max_loop_iterations = 1

            [reasoning.retry]
            max_attempts = 1
            "#,
        )
        .expect("config parses");

        assert_eq!(config.ranking.top_k, 2);
        assert_eq!(config.ranking.word_budget, 12_000);
        assert_eq!(config.reasoning.max_loop_iterations, 1);
        assert_eq!(config.reasoning.retry.max_attempts, 1);
        assert_eq!(config.acquisition.max_headings, 10);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = ConfigLoader::from_toml_str("[followup]\nmax_questions = 9\n").unwrap_err();
        assert!(matches!(err, ResearchError::InvalidConfiguration(_)));

        let err = ConfigLoader::from_toml_str("[ranking]\ntop_k = 0\n").unwrap_err();
        assert!(err.to_string().contains("top_k"));
    }

    #[test]
    fn loads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[acquisition]\ntimeout_ms = 2500").expect("write config");

        let config = ConfigLoader::load(Some(file.path().to_path_buf())).expect("loads");
        assert_eq!(config.acquisition.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn missing_explicit_path_is_io_error() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/webresearch.toml")))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_IO");
    }
}
