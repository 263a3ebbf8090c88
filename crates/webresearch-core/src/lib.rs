//! Web research pipeline built on top of `graph_flow`.
//!
//! A request names a question and a list of source locations. Sources are
//! acquired concurrently, ranked against the question by the reasoning
//! capability, synthesized into an answer with either a linear or a
//! thought/action-loop strategy, then scored and extended with follow-up
//! questions. See [`ResearchOrchestrator`].

pub mod acquire;
pub mod answer;
pub mod capability;
pub mod confidence;
pub mod config;
mod error;
pub mod followup;
pub mod metrics;
pub mod rank;
pub mod reasoning;
mod security;
pub mod tasks;
pub mod telemetry;
mod text;
pub mod trace;
mod workflow;

pub use acquire::{
    AcquisitionOutcome, ContentAcquirer, Document, FailureReason, FetchError, FetchedPage,
    HttpFetcher, PageFetcher, SourceLocation,
};
pub use answer::{Answer, Degradation, ResearchReport};
pub use capability::{
    CapabilityError, DynCapability, OfflineCapability, OpenAiCapability, ReasoningCapability,
    ReasoningOutput, ReasoningRequest, RetryPolicy,
};
pub use confidence::ConfidenceScorer;
pub use config::{ConfigLoader, ResearchConfig};
pub use error::ResearchError;
pub use followup::FollowUpGenerator;
pub use rank::{RankedSource, RelevanceRanker, ResearchContext, ScoredDocument};
pub use reasoning::{
    Draft, EvidenceTrace, LoopAction, LoopState, LoopStep, LoopTrace, Reasoner, ReasoningFailure,
    ReasoningStrategy,
};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary};
pub use workflow::ResearchOrchestrator;
