use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing::{info, warn};
use webresearch_core::{
    ConfigLoader, DynCapability, OfflineCapability, ReasoningStrategy, ResearchError,
    ResearchOrchestrator, ResearchReport, TelemetryOptions, capability, init_telemetry, metrics,
};

#[derive(Parser, Debug)]
#[command(
    name = "webresearch",
    version,
    about = "Answer a research question from a set of web sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a question against the given sources.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question to research.
    #[arg(long, short)]
    question: String,

    /// Source URL; repeat for several sources.
    #[arg(long = "source", short = 's', required = true)]
    sources: Vec<String>,

    /// Reasoning strategy: `linear` or `loop`.
    #[arg(long, default_value = "linear")]
    strategy: ReasoningStrategy,

    /// Configuration file (TOML). Falls back to WEBRESEARCH_CONFIG, then ./webresearch.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the deterministic offline reasoning capability instead of the configured LLM.
    #[arg(long)]
    offline: bool,

    /// Override `ranking.top_k`.
    #[arg(long)]
    top_k: Option<usize>,

    /// Override `reasoning.max_loop_iterations`.
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Add up to N same-site links discovered on each source page.
    #[arg(long, default_value_t = 0)]
    expand_links: usize,

    /// Print the answer as JSON.
    #[arg(long)]
    json: bool,

    /// Append the stage trace and degradations.
    #[arg(long)]
    trace: bool,

    /// Stage trace rendering: `markdown` or `mermaid`.
    #[arg(long, value_parser = ["markdown", "mermaid"], default_value = "markdown")]
    trace_format: String,
}

fn main() -> Result<ExitCode> {
    init_telemetry(TelemetryOptions::default())?;
    metrics::init_metrics_from_env("webresearch-cli");

    let cli = Cli::parse();

    let rt = Runtime::new()?;
    let outcome = rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await,
        }
    });

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("error[{}]: {err}", err.code());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<(), ResearchError> {
    let mut config = ConfigLoader::load(args.config)?;
    if let Some(top_k) = args.top_k {
        config.ranking.top_k = top_k;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.reasoning.max_loop_iterations = max_iterations;
    }
    if args.offline {
        config.llm.provider = "offline".to_string();
    }

    let reasoning: DynCapability = if args.offline {
        Arc::new(OfflineCapability::new())
    } else {
        capability::from_config(&config.llm)?
    };
    capability::install_default(reasoning);
    let orchestrator = ResearchOrchestrator::from_default(config)?;

    let mut sources = args.sources.clone();
    if args.expand_links > 0 {
        let acquirer = orchestrator.acquirer();
        for source in &args.sources {
            for link in acquirer.discover_links(source, args.expand_links).await {
                if !sources.contains(&link) {
                    sources.push(link);
                }
            }
        }
        info!(
            given = args.sources.len(),
            total = sources.len(),
            "source list expanded with discovered links"
        );
    }

    info!(question = %args.question, strategy = %args.strategy, "starting research");
    let report = orchestrator
        .research_with_report(&args.question, &sources, args.strategy)
        .await?;

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&report.answer).map_err(anyhow::Error::from)?;
        println!("{rendered}");
    } else {
        print_report(&report);
    }

    if args.trace {
        let summary = report.stages.summary();
        let rendered = match args.trace_format.as_str() {
            "mermaid" => summary.render_mermaid(),
            _ => summary.render_markdown(),
        };
        println!("\n{rendered}");
        if report.degradations.is_empty() {
            println!("No degradations.");
        } else {
            println!("Degradations:");
            for degradation in &report.degradations {
                let detail = serde_json::to_string(degradation).unwrap_or_default();
                println!("  - {}: {detail}", degradation.kind());
            }
        }
    }

    Ok(())
}

fn print_report(report: &ResearchReport) {
    let answer = &report.answer;
    println!("{}\n", answer.answer_text());
    println!("Confidence: {:.2}", answer.confidence());

    if !answer.key_findings().is_empty() {
        println!("\nKey findings:");
        for finding in answer.key_findings() {
            println!("  - {finding}");
        }
    }

    println!("\nSources:");
    for (idx, source) in answer.sources_used().iter().enumerate() {
        println!("  {}. {source}", idx + 1);
    }

    if let Some(trace) = answer.reasoning_trace() {
        println!("\nReasoning steps: {}", trace.steps.len());
        if trace.cap_reached {
            warn!(
                max_iterations = trace.max_iterations,
                "loop reached its iteration cap"
            );
            println!("  (iteration cap reached; answer composed from collected observations)");
        }
    }

    if !answer.follow_up_questions().is_empty() {
        println!("\nFollow-up questions:");
        for question in answer.follow_up_questions() {
            println!("  - {question}");
        }
    }
}
