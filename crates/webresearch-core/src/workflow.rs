use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use graph_flow::{
    Context, ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, Session,
    SessionStorage, Task,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::acquire::{ContentAcquirer, Document, HttpFetcher, PageFetcher, SourceLocation};
use crate::answer::{Answer, Degradation, ResearchReport};
use crate::capability::{self, DynCapability};
use crate::confidence::ConfidenceScorer;
use crate::config::{ConfigLoader, ResearchConfig};
use crate::followup::FollowUpGenerator;
use crate::metrics;
use crate::rank::{RelevanceRanker, ResearchContext};
use crate::reasoning::{Draft, Reasoner, ReasoningStrategy};
use crate::tasks::{
    AcquireTask, FinalizeTask, NoSourcesTask, RankTask, ReasonTask, ScoreTask, keys,
    reasoning_failure,
};
use crate::trace::TraceCollector;
use crate::ResearchError;

/// Tasks wired into one research graph.
struct PipelineTasks {
    acquire: Arc<AcquireTask>,
    rank: Arc<RankTask>,
    reason: Arc<ReasonTask>,
    score: Arc<ScoreTask>,
    finalize: Arc<FinalizeTask>,
    no_sources: Arc<NoSourcesTask>,
}

fn build_graph(tasks: &PipelineTasks) -> Arc<graph_flow::Graph> {
    let builder = GraphBuilder::new("webresearch_pipeline")
        .add_task(tasks.acquire.clone())
        .add_task(tasks.rank.clone())
        .add_task(tasks.reason.clone())
        .add_task(tasks.score.clone())
        .add_task(tasks.finalize.clone())
        .add_task(tasks.no_sources.clone())
        .add_edge(tasks.acquire.id(), tasks.rank.id())
        .add_conditional_edge(
            tasks.rank.id(),
            |ctx| ctx.get_sync::<bool>(keys::USABLE).unwrap_or(false),
            tasks.reason.id(),
            tasks.no_sources.id(),
        )
        .add_edge(tasks.reason.id(), tasks.score.id())
        .add_edge(tasks.score.id(), tasks.finalize.id())
        .set_start_task(tasks.acquire.id());

    Arc::new(builder.build())
}

/// Top-level entry point: one pipeline run per request, stateless between runs.
pub struct ResearchOrchestrator {
    capability: DynCapability,
    fetcher: Arc<dyn PageFetcher>,
    config: ResearchConfig,
}

impl ResearchOrchestrator {
    /// Build an orchestrator that fetches over HTTP.
    pub fn new(capability: DynCapability, config: ResearchConfig) -> Result<Self, ResearchError> {
        ConfigLoader::validate(&config)?;
        let fetcher = Arc::new(HttpFetcher::new(&config.acquisition)?);
        Ok(Self {
            capability,
            fetcher,
            config,
        })
    }

    /// Use the process-wide capability installed with [`capability::install_default`].
    pub fn from_default(config: ResearchConfig) -> Result<Self, ResearchError> {
        let capability = capability::default_capability().ok_or_else(|| {
            ResearchError::InvalidConfiguration(
                "no default reasoning capability installed".to_string(),
            )
        })?;
        Self::new(capability, config)
    }

    /// Replace the page fetcher, e.g. with an in-memory one.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Acquirer sharing this orchestrator's fetcher and settings.
    pub fn acquirer(&self) -> ContentAcquirer {
        ContentAcquirer::new(self.fetcher.clone(), self.config.acquisition.clone())
    }

    pub async fn research(
        &self,
        question: &str,
        sources: &[SourceLocation],
        strategy: ReasoningStrategy,
    ) -> Result<Answer, ResearchError> {
        self.research_with_report(question, sources, strategy)
            .await
            .map(|report| report.answer)
    }

    #[instrument(name = "research", skip(self, question, sources), fields(sources = sources.len()))]
    pub async fn research_with_report(
        &self,
        question: &str,
        sources: &[SourceLocation],
        strategy: ReasoningStrategy,
    ) -> Result<ResearchReport, ResearchError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ResearchError::InvalidRequest(
                "question must not be blank".to_string(),
            ));
        }

        let started = Instant::now();
        let timeout = self.config.pipeline.request_timeout();
        let request_id = Uuid::new_v4().to_string();
        info!(%request_id, "research request started");

        let result = if sources.is_empty() {
            Err(ResearchError::NoUsableSources {
                attempted: 0,
                acquired: 0,
            })
        } else {
            match tokio::time::timeout(
                timeout,
                self.run_pipeline(&request_id, question, sources, strategy),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ResearchError::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = result.map(|mut report| {
            report.elapsed_ms = elapsed_ms;
            report
        });
        match &result {
            Ok(report) => {
                metrics::record_run(strategy.as_str(), "ok", elapsed_ms);
                info!(
                    %request_id,
                    elapsed_ms,
                    confidence = report.answer.confidence(),
                    degradations = report.degradations.len(),
                    "research request completed"
                );
            }
            Err(err) => {
                metrics::record_run(strategy.as_str(), err.code(), elapsed_ms);
                warn!(
                    %request_id,
                    elapsed_ms,
                    code = err.code(),
                    error = %err,
                    "research request failed"
                );
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        request_id: &str,
        question: &str,
        sources: &[SourceLocation],
        strategy: ReasoningStrategy,
    ) -> Result<ResearchReport, ResearchError> {
        let retry = self.config.reasoning.retry.clone();
        let tasks = PipelineTasks {
            acquire: Arc::new(AcquireTask::new(Arc::new(self.acquirer()))),
            rank: Arc::new(RankTask::new(Arc::new(RelevanceRanker::new(
                self.capability.clone(),
                self.config.ranking.clone(),
                retry.clone(),
            )))),
            reason: Arc::new(ReasonTask::new(Arc::new(Reasoner::new(
                strategy,
                self.capability.clone(),
                &self.config.reasoning,
            )))),
            score: Arc::new(ScoreTask::new(
                Arc::new(ConfidenceScorer::new(
                    self.capability.clone(),
                    self.config.confidence.clone(),
                    retry.clone(),
                )),
                Arc::new(FollowUpGenerator::new(
                    self.capability.clone(),
                    self.config.followup.clone(),
                    retry,
                )),
            )),
            finalize: Arc::new(FinalizeTask),
            no_sources: Arc::new(NoSourcesTask),
        };
        let graph = build_graph(&tasks);

        let storage = Arc::new(InMemorySessionStorage::new());
        let runner = FlowRunner::new(graph, storage.clone());

        let session = Session::new_from_task(request_id.to_string(), tasks.acquire.id());
        session.context.set(keys::QUESTION, question.to_string()).await;
        session.context.set(keys::SOURCES, sources.to_vec()).await;
        storage
            .save(session)
            .await
            .map_err(|err| anyhow!("failed to persist session: {err}"))?;

        loop {
            let result = runner
                .run(request_id)
                .await
                .map_err(|err| anyhow!("graph execution failure: {err}"))?;

            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::WaitingForInput => continue,
                ExecutionStatus::Error(message) => return Err(anyhow!(message).into()),
            }
        }

        let session = storage
            .get(request_id)
            .await
            .map_err(|err| anyhow!("failed to reload session: {err}"))?
            .ok_or_else(|| anyhow!("session missing after execution"))?;

        collect_report(&session.context, request_id, sources.len(), strategy).await
    }
}

async fn collect_report(
    context: &Context,
    request_id: &str,
    attempted: usize,
    strategy: ReasoningStrategy,
) -> Result<ResearchReport, ResearchError> {
    let documents: Vec<Document> = context.get(keys::DOCUMENTS).await.unwrap_or_default();

    if !context.get_sync::<bool>(keys::USABLE).unwrap_or(false) {
        return Err(ResearchError::NoUsableSources {
            attempted,
            acquired: documents.iter().filter(|doc| doc.is_success()).count(),
        });
    }
    if let Some(failure) = reasoning_failure(context).await {
        return Err(failure.into());
    }

    let answer: Answer = context
        .get(keys::ANSWER)
        .await
        .ok_or_else(|| anyhow!("pipeline ended without an answer"))?;
    let draft: Draft = context
        .get(keys::DRAFT)
        .await
        .ok_or_else(|| anyhow!("pipeline ended without a draft"))?;
    let research_context: ResearchContext = context.get(keys::CONTEXT).await.unwrap_or_default();
    let degradations: Vec<Degradation> =
        context.get(keys::DEGRADATIONS).await.unwrap_or_default();
    let stages: TraceCollector = context.get(keys::STAGES).await.unwrap_or_default();

    Ok(ResearchReport {
        request_id: request_id.to_string(),
        strategy,
        answer,
        documents,
        context: research_context,
        degradations,
        evidence: draft.trace,
        stages,
        elapsed_ms: 0,
    })
}
