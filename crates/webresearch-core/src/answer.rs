use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::acquire::{Document, FailureReason, SourceLocation};
use crate::capability::CapabilityError;
use crate::metrics;
use crate::rank::ResearchContext;
use crate::reasoning::{EvidenceTrace, LoopTrace, ReasoningStrategy};
use crate::trace::TraceCollector;

/// Final synthesized result of one research request. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    answer_text: String,
    confidence: f64,
    key_findings: Vec<String>,
    sources_used: Vec<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning_trace: Option<LoopTrace>,
    follow_up_questions: Vec<String>,
}

impl Answer {
    pub(crate) fn new(
        answer_text: String,
        confidence: f64,
        key_findings: Vec<String>,
        sources_used: Vec<SourceLocation>,
        reasoning_trace: Option<LoopTrace>,
        follow_up_questions: Vec<String>,
    ) -> Self {
        Self {
            answer_text,
            confidence: confidence.clamp(0.0, 1.0),
            key_findings,
            sources_used,
            reasoning_trace,
            follow_up_questions,
        }
    }

    pub fn answer_text(&self) -> &str {
        &self.answer_text
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn key_findings(&self) -> &[String] {
        &self.key_findings
    }

    /// Sources the reasoner drew upon, in the order they first contributed.
    pub fn sources_used(&self) -> &[SourceLocation] {
        &self.sources_used
    }

    /// Thought/action trace; present only for the loop strategy.
    pub fn reasoning_trace(&self) -> Option<&LoopTrace> {
        self.reasoning_trace.as_ref()
    }

    pub fn follow_up_questions(&self) -> &[String] {
        &self.follow_up_questions
    }
}

/// A failure the pipeline worked around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    SourceAcquisitionFailure {
        source: SourceLocation,
        reason: FailureReason,
        detail: String,
    },
    RankingFailure {
        source: SourceLocation,
        error: CapabilityError,
    },
    ScoringDegraded {
        error: CapabilityError,
    },
    FollowUpFailure {
        error: CapabilityError,
    },
}

impl Degradation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceAcquisitionFailure { .. } => "source_acquisition",
            Self::RankingFailure { .. } => "ranking",
            Self::ScoringDegraded { .. } => "scoring",
            Self::FollowUpFailure { .. } => "follow_up",
        }
    }

    /// Log and count the degradation, then hand it back for the run report.
    pub(crate) fn recorded(self) -> Self {
        match &self {
            Self::SourceAcquisitionFailure {
                source,
                reason,
                detail,
            } => warn!(%source, reason = reason.as_str(), %detail, "source skipped"),
            Self::RankingFailure { source, error } => {
                warn!(%source, %error, "document dropped from ranking")
            }
            Self::ScoringDegraded { error } => {
                warn!(%error, "self-assessment unavailable, using heuristic confidence")
            }
            Self::FollowUpFailure { error } => {
                warn!(%error, "follow-up generation failed, returning none")
            }
        }
        metrics::record_degradation(self.kind());
        self
    }
}

/// Everything one run produced, for diagnostics and the CLI `--trace` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    pub request_id: String,
    pub strategy: ReasoningStrategy,
    pub answer: Answer,
    pub documents: Vec<Document>,
    pub context: ResearchContext,
    pub degradations: Vec<Degradation>,
    pub evidence: EvidenceTrace,
    pub stages: TraceCollector,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped_at_construction() {
        let answer = Answer::new("x".into(), 1.7, Vec::new(), Vec::new(), None, Vec::new());
        assert_eq!(answer.confidence(), 1.0);
    }

    #[test]
    fn linear_answers_omit_the_trace_in_json() {
        let answer = Answer::new(
            "Acme sells anvils.".into(),
            0.5,
            vec!["anvils".into()],
            vec!["https://acme.test/".into()],
            None,
            Vec::new(),
        );
        let json = serde_json::to_value(&answer).unwrap();
        assert!(json.get("reasoning_trace").is_none());
        assert_eq!(json["sources_used"][0], "https://acme.test/");
    }

    #[test]
    fn degradation_serialises_with_kind_tag() {
        let degradation = Degradation::RankingFailure {
            source: "https://b.test/".into(),
            error: CapabilityError::Timeout,
        };
        let json = serde_json::to_value(&degradation).unwrap();
        assert_eq!(json["kind"], "ranking_failure");
        assert_eq!(degradation.kind(), "ranking");
    }
}
