//! `graph_flow` tasks, one per pipeline stage.
//!
//! Stage outputs travel through the session [`Context`] as serde values under
//! the keys in [`keys`]; the components themselves are shared via `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use tracing::{info, instrument, warn};

use crate::acquire::{AcquisitionOutcome, ContentAcquirer, Document, SourceLocation};
use crate::answer::{Answer, Degradation};
use crate::confidence::ConfidenceScorer;
use crate::followup::FollowUpGenerator;
use crate::rank::{RelevanceRanker, ResearchContext};
use crate::reasoning::{Draft, Reasoner, ReasoningFailure};
use crate::trace::{TraceCollector, stage};

pub mod keys {
    pub const QUESTION: &str = "request.question";
    pub const SOURCES: &str = "request.sources";
    pub const DOCUMENTS: &str = "acquire.documents";
    pub const CONTEXT: &str = "rank.context";
    pub const USABLE: &str = "rank.usable";
    pub const DRAFT: &str = "reason.draft";
    pub const REASONING_FAILURE: &str = "reason.failure";
    pub const CONFIDENCE: &str = "score.confidence";
    pub const FOLLOW_UPS: &str = "score.follow_ups";
    pub const DEGRADATIONS: &str = "run.degradations";
    pub const STAGES: &str = "run.stages";
    pub const ANSWER: &str = "final.answer";
}

async fn record_stage(context: &Context, stage: &str, message: impl Into<String>) {
    let mut stages: TraceCollector = context.get(keys::STAGES).await.unwrap_or_default();
    stages.record(stage, message);
    context.set(keys::STAGES, &stages).await;
}

async fn push_degradations(context: &Context, degradations: Vec<Degradation>) {
    if degradations.is_empty() {
        return;
    }
    let mut all: Vec<Degradation> = context.get(keys::DEGRADATIONS).await.unwrap_or_default();
    all.extend(degradations);
    context.set(keys::DEGRADATIONS, &all).await;
}

async fn question(context: &Context) -> String {
    context.get(keys::QUESTION).await.unwrap_or_default()
}

pub struct AcquireTask {
    acquirer: Arc<ContentAcquirer>,
}

impl AcquireTask {
    pub fn new(acquirer: Arc<ContentAcquirer>) -> Self {
        Self { acquirer }
    }
}

#[async_trait]
impl Task for AcquireTask {
    fn id(&self) -> &str {
        "acquire"
    }

    #[instrument(name = "task.acquire", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let sources: Vec<SourceLocation> = context.get(keys::SOURCES).await.unwrap_or_default();
        record_stage(&context, stage::ACQUIRING, format!("{} sources", sources.len())).await;

        let documents = self.acquirer.acquire_all(&sources).await;
        let failures: Vec<Degradation> = documents
            .iter()
            .filter_map(|document| match document.outcome() {
                AcquisitionOutcome::Success => None,
                AcquisitionOutcome::Failure { reason, detail } => Some(
                    Degradation::SourceAcquisitionFailure {
                        source: document.source().to_string(),
                        reason: *reason,
                        detail: detail.clone(),
                    }
                    .recorded(),
                ),
            })
            .collect();
        let acquired = documents.len() - failures.len();

        context.set(keys::DOCUMENTS, &documents).await;
        push_degradations(&context, failures).await;

        Ok(TaskResult::new(
            Some(format!("Acquired {acquired} of {} sources", sources.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct RankTask {
    ranker: Arc<RelevanceRanker>,
}

impl RankTask {
    pub fn new(ranker: Arc<RelevanceRanker>) -> Self {
        Self { ranker }
    }
}

#[async_trait]
impl Task for RankTask {
    fn id(&self) -> &str {
        "rank"
    }

    #[instrument(name = "task.rank", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let question = question(&context).await;
        let documents: Vec<Document> = context.get(keys::DOCUMENTS).await.unwrap_or_default();
        let usable_inputs = documents.iter().filter(|doc| doc.is_success()).count();
        record_stage(
            &context,
            stage::RANKING,
            format!("{usable_inputs} of {} documents acquired", documents.len()),
        )
        .await;

        let (ranked, dropped) = self.ranker.rank_detailed(&question, &documents).await;
        push_degradations(&context, dropped).await;

        let usable = !ranked.is_empty();
        context.set(keys::CONTEXT, &ranked).await;
        context.set_sync(keys::USABLE, usable);

        Ok(TaskResult::new(
            Some(format!("Ranked {} sources into context", ranked.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

pub struct ReasonTask {
    reasoner: Arc<Reasoner>,
}

impl ReasonTask {
    pub fn new(reasoner: Arc<Reasoner>) -> Self {
        Self { reasoner }
    }
}

#[async_trait]
impl Task for ReasonTask {
    fn id(&self) -> &str {
        "reason"
    }

    #[instrument(
        name = "task.reason",
        skip(self, context),
        fields(strategy = %self.reasoner.strategy())
    )]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let question = question(&context).await;
        let ranked: ResearchContext = context.get(keys::CONTEXT).await.unwrap_or_default();
        record_stage(
            &context,
            stage::REASONING,
            format!("{} strategy over {} sources", self.reasoner.strategy(), ranked.len()),
        )
        .await;

        match self.reasoner.synthesize(&question, &ranked).await {
            Ok(draft) => {
                context.set(keys::DRAFT, &draft).await;
                Ok(TaskResult::new(
                    Some("Draft answer synthesized".to_string()),
                    NextAction::ContinueAndExecute,
                ))
            }
            Err(failure) => {
                warn!(stage = %failure.stage, error = %failure.error, "reasoning failed");
                record_stage(&context, stage::FAILED, failure.to_string()).await;
                context.set(keys::REASONING_FAILURE, &failure).await;
                Ok(TaskResult::new(Some(failure.to_string()), NextAction::End))
            }
        }
    }
}

pub struct ScoreTask {
    scorer: Arc<ConfidenceScorer>,
    follow_ups: Arc<FollowUpGenerator>,
}

impl ScoreTask {
    pub fn new(scorer: Arc<ConfidenceScorer>, follow_ups: Arc<FollowUpGenerator>) -> Self {
        Self { scorer, follow_ups }
    }
}

#[async_trait]
impl Task for ScoreTask {
    fn id(&self) -> &str {
        "score"
    }

    #[instrument(name = "task.score", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let question = question(&context).await;
        let ranked: ResearchContext = context.get(keys::CONTEXT).await.unwrap_or_default();
        let Some(draft) = context.get::<Draft>(keys::DRAFT).await else {
            return Ok(TaskResult::new(
                Some("No draft to score".to_string()),
                NextAction::End,
            ));
        };

        let (confidence, scoring) = self.scorer.score_detailed(&draft.answer_text, &ranked).await;
        let (questions, follow_up) = self
            .follow_ups
            .generate_detailed(&question, &draft.answer_text, &ranked)
            .await;
        record_stage(
            &context,
            stage::SCORING,
            format!("confidence {confidence:.2}, {} follow-ups", questions.len()),
        )
        .await;

        push_degradations(&context, scoring.into_iter().chain(follow_up).collect()).await;
        context.set(keys::CONFIDENCE, confidence).await;
        context.set(keys::FOLLOW_UPS, &questions).await;

        Ok(TaskResult::new(
            Some(format!("Confidence {confidence:.2}")),
            NextAction::ContinueAndExecute,
        ))
    }
}

#[derive(Default)]
pub struct FinalizeTask;

#[async_trait]
impl Task for FinalizeTask {
    fn id(&self) -> &str {
        "finalize"
    }

    #[instrument(name = "task.finalize", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let ranked: ResearchContext = context.get(keys::CONTEXT).await.unwrap_or_default();
        let Some(draft) = context.get::<Draft>(keys::DRAFT).await else {
            return Ok(TaskResult::new(
                Some("No draft to finalize".to_string()),
                NextAction::End,
            ));
        };
        let confidence: f64 = context.get(keys::CONFIDENCE).await.unwrap_or(0.0);
        let follow_ups: Vec<String> = context.get(keys::FOLLOW_UPS).await.unwrap_or_default();

        let sources_used: Vec<SourceLocation> = draft
            .trace
            .drawn_sources(&ranked)
            .into_iter()
            .filter(|location| ranked.contains(location))
            .collect();

        let answer = Answer::new(
            draft.answer_text,
            confidence,
            draft.key_findings,
            sources_used,
            draft.trace.loop_trace().cloned(),
            follow_ups,
        );

        info!(
            confidence = answer.confidence(),
            sources_used = answer.sources_used().len(),
            "answer assembled"
        );
        record_stage(
            &context,
            stage::DONE,
            format!("{} sources cited", answer.sources_used().len()),
        )
        .await;
        context.set(keys::ANSWER, &answer).await;

        Ok(TaskResult::new(
            Some(answer.answer_text().to_string()),
            NextAction::End,
        ))
    }
}

/// Terminal branch taken when ranking leaves the context empty.
#[derive(Default)]
pub struct NoSourcesTask;

#[async_trait]
impl Task for NoSourcesTask {
    fn id(&self) -> &str {
        "no_sources"
    }

    #[instrument(name = "task.no_sources", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let documents: Vec<Document> = context.get(keys::DOCUMENTS).await.unwrap_or_default();
        let acquired = documents.iter().filter(|doc| doc.is_success()).count();
        let message = format!(
            "no usable sources ({acquired} of {} acquired)",
            documents.len()
        );
        warn!(acquired, attempted = documents.len(), "research context is empty");
        record_stage(&context, stage::FAILED, message.clone()).await;

        Ok(TaskResult::new(Some(message), NextAction::End))
    }
}

/// Whether the reason task stored a failure.
pub(crate) async fn reasoning_failure(context: &Context) -> Option<ReasoningFailure> {
    context.get(keys::REASONING_FAILURE).await
}
