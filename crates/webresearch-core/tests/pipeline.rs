use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use webresearch_core::{
    CapabilityError, ConfidenceScorer, Document, FailureReason, FetchError, FetchedPage,
    LoopState, OfflineCapability, PageFetcher, ReasoningCapability, ReasoningOutput,
    ReasoningRequest, ReasoningStrategy, ResearchConfig, ResearchContext, ResearchError,
    ResearchOrchestrator, RetryPolicy, ScoredDocument,
};

const ACME_PAGE: &str = r#"<html><head><title>Acme Corp</title></head><body>
    <nav><a href="/">Home</a></nav>
    <main><h1>Products</h1>
    <p>Acme Corp sells anvils, rockets and giant magnets to discerning customers.</p></main>
    </body></html>"#;

const ROADRUNNER_PAGE: &str = r#"<html><head><title>Field notes</title></head><body>
    <article><h2>Sightings</h2><p>Acme Corp products are often seen in the desert.</p></article>
    </body></html>"#;

/// In-memory fetcher; unknown locations are unreachable.
#[derive(Default)]
struct StaticFetcher {
    pages: HashMap<String, String>,
    slow: HashMap<String, Duration>,
}

impl StaticFetcher {
    fn page(mut self, location: &str, html: &str) -> Self {
        self.pages.insert(location.to_string(), html.to_string());
        self
    }

    fn slow_page(mut self, location: &str, html: &str, delay: Duration) -> Self {
        self.slow.insert(location.to_string(), delay);
        self.page(location, html)
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, location: &str) -> Result<FetchedPage, FetchError> {
        if let Some(delay) = self.slow.get(location) {
            tokio::time::sleep(*delay).await;
        }
        self.pages
            .get(location)
            .map(|html| FetchedPage::html(html.clone()))
            .ok_or_else(|| FetchError::Unreachable("connection refused".into()))
    }
}

/// Offline capability with call counting and optional overrides.
#[derive(Default)]
struct Scripted {
    calls: AtomicUsize,
    fixed_score: Option<f64>,
    never_finish: bool,
}

#[async_trait]
impl ReasoningCapability for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.signature.as_str() {
            "score_relevance" if self.fixed_score.is_some() => Ok(ReasoningOutput::new()
                .with("relevance_score", self.fixed_score.unwrap_or_default())
                .with("rationale", "fixed")),
            "next_step" if self.never_finish => Ok(ReasoningOutput::new()
                .with("thought", "keep reading")
                .with("action", "inspect_source")
                .with("action_input", json!(2))),
            _ => OfflineCapability::new().invoke(request).await,
        }
    }
}

fn config() -> ResearchConfig {
    let mut config = ResearchConfig::default();
    config.reasoning.retry = RetryPolicy::none();
    config
}

fn orchestrator(
    capability: Arc<Scripted>,
    fetcher: StaticFetcher,
    config: ResearchConfig,
) -> ResearchOrchestrator {
    ResearchOrchestrator::new(capability, config)
        .expect("valid configuration")
        .with_fetcher(Arc::new(fetcher))
}

fn sources(locations: &[&str]) -> Vec<String> {
    locations.iter().map(|location| location.to_string()).collect()
}

#[tokio::test]
async fn unreachable_source_is_skipped_and_never_cited() {
    let fetcher = StaticFetcher::default().page("https://a.test/", ACME_PAGE);
    let orchestrator = orchestrator(Arc::new(Scripted::default()), fetcher, config());

    let report = orchestrator
        .research_with_report(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/", "https://b.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .expect("one source is usable");

    assert_eq!(
        report.documents[1].failure_reason(),
        Some(FailureReason::Unreachable)
    );
    assert_eq!(report.context.locations(), vec!["https://a.test/"]);
    assert_eq!(report.answer.sources_used(), &["https://a.test/".to_string()]);
    assert!(report.answer.answer_text().contains("anvils"));
    assert!(report.answer.reasoning_trace().is_none());
    assert!((0.0..=1.0).contains(&report.answer.confidence()));
    assert!(report.answer.follow_up_questions().len() <= 3);
    assert_eq!(report.degradations.len(), 1);
    assert_eq!(report.degradations[0].kind(), "source_acquisition");
    assert_eq!(
        report.stages.stages(),
        vec!["acquiring", "ranking", "reasoning", "scoring", "done"]
    );
}

#[tokio::test]
async fn no_usable_sources_never_reaches_the_reasoner() {
    let capability = Arc::new(Scripted::default());
    let orchestrator = orchestrator(capability.clone(), StaticFetcher::default(), config());

    let err = orchestrator
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://down-1.test/", "https://down-2.test/"]),
            ReasoningStrategy::Loop,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "NO_USABLE_SOURCES");
    assert_eq!(capability.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_question_and_empty_source_list_are_rejected() {
    let orchestrator = orchestrator(
        Arc::new(Scripted::default()),
        StaticFetcher::default(),
        config(),
    );

    let err = orchestrator
        .research("   ", &sources(&["https://a.test/"]), ReasoningStrategy::Linear)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_REQUEST");

    let err = orchestrator
        .research("What does Acme sell?", &[], ReasoningStrategy::Linear)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_USABLE_SOURCES");
}

#[tokio::test]
async fn context_is_bounded_by_top_k_and_keeps_tie_order() {
    let locations = [
        "https://1.test/",
        "https://2.test/",
        "https://3.test/",
        "https://4.test/",
        "https://5.test/",
    ];
    let fetcher = locations
        .iter()
        .fold(StaticFetcher::default(), |fetcher, location| {
            fetcher.page(location, ACME_PAGE)
        });
    let capability = Arc::new(Scripted {
        fixed_score: Some(0.5),
        ..Scripted::default()
    });
    let mut config = config();
    config.ranking.top_k = 2;

    let report = orchestrator(capability, fetcher, config)
        .research_with_report(
            "What does Acme Corp sell?",
            &sources(&locations),
            ReasoningStrategy::Linear,
        )
        .await
        .unwrap();

    assert_eq!(report.context.len(), 2);
    assert_eq!(
        report.context.locations(),
        vec!["https://1.test/", "https://2.test/"]
    );
    assert!(
        report
            .answer
            .sources_used()
            .iter()
            .all(|source| report.context.contains(source))
    );
}

#[tokio::test]
async fn loop_is_forced_to_terminate_after_one_cycle() {
    let fetcher = StaticFetcher::default()
        .page("https://a.test/", ACME_PAGE)
        .page("https://b.test/", ROADRUNNER_PAGE);
    let capability = Arc::new(Scripted {
        never_finish: true,
        ..Scripted::default()
    });
    let mut config = config();
    config.reasoning.max_loop_iterations = 1;

    let answer = orchestrator(capability, fetcher, config)
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/", "https://b.test/"]),
            ReasoningStrategy::Loop,
        )
        .await
        .unwrap();

    let trace = answer.reasoning_trace().expect("loop answers carry a trace");
    assert_eq!(
        trace.states,
        vec![
            LoopState::Thinking,
            LoopState::Acting,
            LoopState::Observing,
            LoopState::Done
        ]
    );
    assert!(trace.cap_reached);
    assert!(!answer.answer_text().trim().is_empty());
    assert_eq!(answer.sources_used().len(), 1);
}

#[tokio::test]
async fn loop_cites_sources_in_inspection_order() {
    let fetcher = StaticFetcher::default()
        .page("https://a.test/", ACME_PAGE)
        .page("https://b.test/", ROADRUNNER_PAGE);

    let answer = orchestrator(Arc::new(Scripted::default()), fetcher, config())
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/", "https://b.test/"]),
            ReasoningStrategy::Loop,
        )
        .await
        .unwrap();

    let trace = answer.reasoning_trace().unwrap();
    assert!(!trace.cap_reached);
    assert_eq!(answer.sources_used().len(), 2);
    assert_eq!(trace.states.last(), Some(&LoopState::Done));
}

#[tokio::test]
async fn repeated_runs_are_identical() {
    let run = || async {
        let fetcher = StaticFetcher::default()
            .page("https://a.test/", ACME_PAGE)
            .page("https://b.test/", ROADRUNNER_PAGE);
        orchestrator(Arc::new(Scripted::default()), fetcher, config())
            .research_with_report(
                "What does Acme Corp sell?",
                &sources(&["https://a.test/", "https://b.test/"]),
                ReasoningStrategy::Linear,
            )
            .await
            .unwrap()
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first.answer.answer_text(), second.answer.answer_text());
    assert_eq!(first.context.locations(), second.context.locations());
    assert_eq!(first.answer, second.answer);
}

#[tokio::test]
async fn slow_source_times_out_without_stalling_the_batch() {
    let fetcher = StaticFetcher::default()
        .page("https://a.test/", ACME_PAGE)
        .slow_page("https://slow.test/", ACME_PAGE, Duration::from_secs(30));
    let mut config = config();
    config.acquisition.timeout_ms = 50;

    let report = orchestrator(Arc::new(Scripted::default()), fetcher, config)
        .research_with_report(
            "What does Acme Corp sell?",
            &sources(&["https://slow.test/", "https://a.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .unwrap();

    assert_eq!(
        report.documents[0].failure_reason(),
        Some(FailureReason::Timeout)
    );
    assert_eq!(report.answer.sources_used(), &["https://a.test/".to_string()]);
}

#[tokio::test]
async fn request_timeout_is_a_terminal_failure() {
    let fetcher = StaticFetcher::default().slow_page(
        "https://slow.test/",
        ACME_PAGE,
        Duration::from_secs(30),
    );
    let mut config = config();
    config.pipeline.request_timeout_ms = 50;

    let err = orchestrator(Arc::new(Scripted::default()), fetcher, config)
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://slow.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TIMEOUT");
}

#[tokio::test]
async fn reasoning_failure_is_terminal_and_carries_the_stage() {
    struct FailingCompose;

    #[async_trait]
    impl ReasoningCapability for FailingCompose {
        fn name(&self) -> &str {
            "failing"
        }

        async fn invoke(
            &self,
            request: &ReasoningRequest,
        ) -> Result<ReasoningOutput, CapabilityError> {
            if request.signature == "compose_answer" {
                return Err(CapabilityError::RateLimited("try later".into()));
            }
            OfflineCapability::new().invoke(request).await
        }
    }

    let fetcher = StaticFetcher::default().page("https://a.test/", ACME_PAGE);
    let orchestrator = ResearchOrchestrator::new(Arc::new(FailingCompose), config())
        .unwrap()
        .with_fetcher(Arc::new(fetcher));

    let err = orchestrator
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "REASONING_FAILURE");
    assert!(err.to_string().contains("compose_answer"));
}

#[tokio::test]
async fn confidence_grows_with_corroborating_sources() {
    let body = "Acme Corp sells anvils and rockets.";
    let context = |copies: usize| {
        let scored = (0..copies)
            .map(|idx| ScoredDocument {
                document: Document::from_parts(
                    format!("https://copy-{idx}.test/"),
                    None,
                    Vec::new(),
                    body,
                ),
                score: 0.7,
                rationale: String::new(),
            })
            .collect();
        ResearchContext::assemble(scored, 5, 10_000)
    };
    let scorer = ConfidenceScorer::new(
        Arc::new(Scripted::default()),
        ResearchConfig::default().confidence,
        RetryPolicy::none(),
    );

    let one = scorer.score(body, &context(1)).await;
    let three = scorer.score(body, &context(3)).await;
    assert!(three >= one, "three sources {three} < one source {one}");
}

/// Fails relevance scoring for pages mentioning `marker`; optionally fails self-assessment.
struct Degrading {
    marker: &'static str,
    fail_assessment: bool,
}

#[async_trait]
impl ReasoningCapability for Degrading {
    fn name(&self) -> &str {
        "degrading"
    }

    async fn invoke(&self, request: &ReasoningRequest) -> Result<ReasoningOutput, CapabilityError> {
        match request.signature.as_str() {
            "score_relevance" if request.input_text("document_content").contains(self.marker) => {
                Err(CapabilityError::Network("reset".into()))
            }
            "assess_confidence" if self.fail_assessment => Err(CapabilityError::Timeout),
            _ => OfflineCapability::new().invoke(request).await,
        }
    }
}

#[tokio::test]
async fn scoring_and_assessment_failures_degrade_without_aborting() {
    let fetcher = StaticFetcher::default()
        .page("https://a.test/", ACME_PAGE)
        .page("https://b.test/", ROADRUNNER_PAGE);
    let capability = Degrading {
        marker: "desert",
        fail_assessment: true,
    };
    let orchestrator = ResearchOrchestrator::new(Arc::new(capability), config())
        .unwrap()
        .with_fetcher(Arc::new(fetcher));

    let report = orchestrator
        .research_with_report(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/", "https://b.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .expect("one source survives ranking");

    assert_eq!(report.context.locations(), vec!["https://a.test/"]);
    assert_eq!(report.answer.sources_used(), &["https://a.test/".to_string()]);
    let kinds: Vec<&str> = report.degradations.iter().map(|d| d.kind()).collect();
    assert_eq!(kinds, vec!["ranking", "scoring"]);

    let scorer = ConfidenceScorer::new(
        Arc::new(OfflineCapability::new()),
        ResearchConfig::default().confidence,
        RetryPolicy::none(),
    );
    let heuristic = scorer.heuristic(report.answer.answer_text(), &report.context);
    assert!((report.answer.confidence() - heuristic).abs() < 1e-9);
}

#[tokio::test]
async fn acquired_sources_that_all_fail_scoring_are_not_usable() {
    let fetcher = StaticFetcher::default()
        .page("https://a.test/", ACME_PAGE)
        .page("https://b.test/", ROADRUNNER_PAGE);
    let capability = Degrading {
        marker: "Acme",
        fail_assessment: false,
    };
    let orchestrator = ResearchOrchestrator::new(Arc::new(capability), config())
        .unwrap()
        .with_fetcher(Arc::new(fetcher));

    let err = orchestrator
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/", "https://b.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "NO_USABLE_SOURCES");
    assert!(matches!(
        err,
        ResearchError::NoUsableSources {
            attempted: 2,
            acquired: 2
        }
    ));
}

#[tokio::test]
async fn orchestrator_uses_the_installed_default_capability() {
    let fetcher = StaticFetcher::default().page("https://a.test/", ACME_PAGE);
    let installed: webresearch_core::DynCapability = Arc::new(Scripted::default());
    webresearch_core::capability::install_default(installed);

    let orchestrator = ResearchOrchestrator::from_default(config())
        .expect("default capability installed")
        .with_fetcher(Arc::new(fetcher));
    let answer = orchestrator
        .research(
            "What does Acme Corp sell?",
            &sources(&["https://a.test/"]),
            ReasoningStrategy::Linear,
        )
        .await
        .expect("research succeeds");

    assert!(answer.answer_text().contains("anvils"));
    let default = webresearch_core::capability::default_capability().expect("still installed");
    assert_eq!(default.name(), "scripted");
}
