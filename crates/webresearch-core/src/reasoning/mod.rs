//! Evidence synthesis over a ranked research context.
//!
//! Two interchangeable strategies share one contract,
//! `synthesize(question, context) -> Draft`:
//! - [`LinearReasoner`]: analyze the question, fold each ranked source into a
//!   running summary, compose the answer.
//! - [`LoopReasoner`]: bounded thought/action/observation loop that inspects
//!   sources on demand and ends with `finish` or a forced composition.

pub mod linear;
pub mod thought_loop;

pub use linear::LinearReasoner;
pub use thought_loop::LoopReasoner;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acquire::SourceLocation;
use crate::capability::{CapabilityError, DynCapability};
use crate::config::ReasoningConfig;
use crate::rank::ResearchContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningStrategy {
    #[default]
    Linear,
    Loop,
}

impl ReasoningStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for ReasoningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linear" | "cot" => Ok(Self::Linear),
            "loop" | "react" => Ok(Self::Loop),
            other => Err(format!(
                "unknown reasoning strategy `{other}` (expected `linear` or `loop`)"
            )),
        }
    }
}

/// Output of the question-analysis stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnalysis {
    pub question_type: String,
    pub key_concepts: Vec<String>,
    pub required_depth: String,
    pub sub_aspects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceExtraction {
    pub rank: usize,
    pub source: SourceLocation,
    pub relevant_information: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearTrace {
    pub analysis: Option<QuestionAnalysis>,
    pub extractions: Vec<SourceExtraction>,
    pub evidence_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Thinking,
    Acting,
    Observing,
    Done,
}

/// Action selected by the capability in one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LoopAction {
    InspectSource { rank: i64 },
    Finish { answer: String },
    /// Anything outside the action vocabulary; observed as a no-op.
    Unrecognized { raw: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStep {
    pub iteration: usize,
    pub thought: String,
    pub action: LoopAction,
    pub observation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopTrace {
    pub states: Vec<LoopState>,
    pub steps: Vec<LoopStep>,
    pub max_iterations: usize,
    /// Set when the loop ran out of iterations without `finish`.
    pub cap_reached: bool,
}

impl LoopTrace {
    /// Valid ranks named by `inspect_source`, deduplicated in first-inspection order.
    pub fn inspected_ranks(&self, context_len: usize) -> Vec<usize> {
        let mut ranks: Vec<usize> = Vec::new();
        for step in &self.steps {
            if let LoopAction::InspectSource { rank } = step.action {
                if let Ok(rank) = usize::try_from(rank) {
                    if (1..=context_len).contains(&rank) && !ranks.contains(&rank) {
                        ranks.push(rank);
                    }
                }
            }
        }
        ranks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum EvidenceTrace {
    Linear(LinearTrace),
    Loop(LoopTrace),
}

impl EvidenceTrace {
    pub fn empty_linear() -> Self {
        Self::Linear(LinearTrace::default())
    }

    /// Context sources the reasoner drew upon, in contribution order.
    pub fn drawn_sources(&self, context: &ResearchContext) -> Vec<SourceLocation> {
        let mut drawn: Vec<SourceLocation> = Vec::new();
        let candidates: Vec<SourceLocation> = match self {
            Self::Linear(_) => context.locations(),
            Self::Loop(trace) => trace
                .inspected_ranks(context.len())
                .into_iter()
                .filter_map(|rank| context.get(rank))
                .map(|source| source.source().to_string())
                .collect(),
        };
        for location in candidates {
            if !drawn.contains(&location) {
                drawn.push(location);
            }
        }
        drawn
    }

    pub fn loop_trace(&self) -> Option<&LoopTrace> {
        match self {
            Self::Loop(trace) => Some(trace),
            Self::Linear(_) => None,
        }
    }
}

/// Draft answer produced by a reasoner, before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub answer_text: String,
    pub key_findings: Vec<String>,
    pub trace: EvidenceTrace,
}

/// A reasoning stage failed after its retries; carries the partial trace.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("reasoning stage `{stage}` failed: {error}")]
pub struct ReasoningFailure {
    pub stage: String,
    pub error: CapabilityError,
    pub trace: EvidenceTrace,
}

impl ReasoningFailure {
    pub fn new(stage: impl Into<String>, error: CapabilityError, trace: EvidenceTrace) -> Self {
        Self {
            stage: stage.into(),
            error,
            trace,
        }
    }
}

/// Closed set of strategies behind the single `synthesize` operation.
pub enum Reasoner {
    Linear(LinearReasoner),
    Loop(LoopReasoner),
}

impl Reasoner {
    pub fn new(
        strategy: ReasoningStrategy,
        capability: DynCapability,
        config: &ReasoningConfig,
    ) -> Self {
        match strategy {
            ReasoningStrategy::Linear => Self::Linear(LinearReasoner::new(capability, config)),
            ReasoningStrategy::Loop => Self::Loop(LoopReasoner::new(capability, config)),
        }
    }

    pub fn strategy(&self) -> ReasoningStrategy {
        match self {
            Self::Linear(_) => ReasoningStrategy::Linear,
            Self::Loop(_) => ReasoningStrategy::Loop,
        }
    }

    pub async fn synthesize(
        &self,
        question: &str,
        context: &ResearchContext,
    ) -> Result<Draft, ReasoningFailure> {
        match self {
            Self::Linear(reasoner) => reasoner.synthesize(question, context).await,
            Self::Loop(reasoner) => reasoner.synthesize(question, context).await,
        }
    }
}

/// Numbered listing of the context for prompts: `rank. title (location)`.
pub(crate) fn describe_sources(context: &ResearchContext) -> String {
    context
        .sources()
        .iter()
        .map(|source| {
            format!(
                "{}. {} ({})",
                source.rank(),
                source.document().label(),
                source.source()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::Document;
    use crate::rank::ScoredDocument;

    fn context(locations: &[&str]) -> ResearchContext {
        let scored = locations
            .iter()
            .map(|location| ScoredDocument {
                document: Document::from_parts(*location, None, Vec::new(), "some body text"),
                score: 0.5,
                rationale: String::new(),
            })
            .collect();
        ResearchContext::assemble(scored, 10, 10_000)
    }

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("CoT".parse::<ReasoningStrategy>(), Ok(ReasoningStrategy::Linear));
        assert_eq!("react".parse::<ReasoningStrategy>(), Ok(ReasoningStrategy::Loop));
        assert!("tree".parse::<ReasoningStrategy>().is_err());
    }

    #[test]
    fn loop_sources_follow_first_inspection_and_skip_invalid_ranks() {
        let ctx = context(&["a", "b", "c"]);
        let step = |rank| LoopStep {
            iteration: 1,
            thought: String::new(),
            action: LoopAction::InspectSource { rank },
            observation: None,
        };
        let trace = EvidenceTrace::Loop(LoopTrace {
            steps: vec![step(3), step(7), step(1), step(3), step(-1)],
            ..LoopTrace::default()
        });
        assert_eq!(trace.drawn_sources(&ctx), vec!["c", "a"]);
    }

    #[test]
    fn linear_draws_every_context_source() {
        let ctx = context(&["a", "b"]);
        assert_eq!(EvidenceTrace::empty_linear().drawn_sources(&ctx), vec!["a", "b"]);
    }
}
