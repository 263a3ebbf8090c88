use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct PipelineMetrics {
    acquisitions: Counter<u64>,
    degradations: Counter<u64>,
    runs: Counter<u64>,
    duration_ms: Histogram<f64>,
}

static METRICS: OnceCell<PipelineMetrics> = OnceCell::new();

fn handles() -> &'static PipelineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("webresearch.pipeline");
        PipelineMetrics {
            acquisitions: meter
                .u64_counter("acquisitions_total")
                .with_description("Source acquisitions by outcome")
                .init(),
            degradations: meter
                .u64_counter("degradations_total")
                .with_description("Non-fatal pipeline degradations by kind")
                .init(),
            runs: meter
                .u64_counter("research_runs_total")
                .with_description("Research requests by strategy and status")
                .init(),
            duration_ms: meter
                .f64_histogram("research_duration_ms")
                .with_description("End-to-end research latency in milliseconds")
                .init(),
        }
    })
}

/// Log a hint when an OTLP endpoint is configured; exporter wiring is left to the deployment.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("WEBRESEARCH_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "WEBRESEARCH_OTEL_METRICS_ENDPOINT detected for {service_name}. Install an OTLP meter provider to export pipeline metrics."
        );
    }
}

/// Outcome is `success` or a failure reason such as `timeout`.
pub fn record_acquisition(outcome: &str) {
    handles()
        .acquisitions
        .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

pub fn record_degradation(kind: &str) {
    handles()
        .degradations
        .add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// No-op when no meter provider is installed.
pub fn record_run(strategy: &str, status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("strategy", strategy.to_string()),
        KeyValue::new("status", status.to_string()),
    ];
    metrics.runs.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);
}
