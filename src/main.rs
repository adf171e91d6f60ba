//! Context flow demo runner.
//!
//! Pushes synthetic messages through a two-stage pipeline wrapped in the
//! observability middleware, then prints the flow diagram, correlation
//! report and (optionally) the JSON diagnostic export.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use context_flow::config::loader::load_config;
use context_flow::context::STAGE_ITEM_KEY;
use context_flow::observability::{init_logging, init_metrics, ContextTraceEnricher, RedactingSanitizer};
use context_flow::{
    CancellationToken, ContextFlowConfig, ContextFlowDiagnostics, ContextFlowError, ContextFlowMetrics,
    ContextFlowTracker, ContextObservabilityMiddleware, MessageContext,
};

#[derive(Parser)]
#[command(name = "context-flow")]
#[command(about = "Trace message context through a demo pipeline", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of messages to send
    #[arg(short, long, default_value_t = 3)]
    messages: usize,

    /// Print the JSON diagnostic export
    #[arg(long)]
    export: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ContextFlowConfig::default(),
    };
    init_logging(&config.telemetry);

    tracing::info!(
        enabled = config.middleware.enabled,
        required_fields = ?config.fields.required_fields,
        max_context_size_bytes = config.middleware.max_context_size_bytes,
        "Configuration loaded"
    );

    if config.telemetry.metrics_enabled {
        let addr: SocketAddr = config.telemetry.metrics_address.parse()?;
        init_metrics(addr);
    }

    let config = Arc::new(config);
    let metrics = Arc::new(ContextFlowMetrics::new());
    let tracker = Arc::new(ContextFlowTracker::new(config.clone(), metrics.clone()));
    let diagnostics = ContextFlowDiagnostics::new(tracker.clone(), metrics.clone(), config.clone());
    let sanitizer = RedactingSanitizer::new(config.fields.sensitive_patterns.iter());
    let enricher = ContextTraceEnricher::new(config.enricher.clone(), Arc::new(sanitizer));
    let middleware = ContextObservabilityMiddleware::new(config.clone(), tracker.clone(), enricher.clone());

    let correlation_id = Uuid::new_v4().to_string();
    let mut first_message = None;
    let mut previous: Option<String> = None;

    for n in 0..cli.messages {
        let message_id = Uuid::new_v4().to_string();
        let mut ctx = MessageContext::new(&message_id)
            .with_correlation_id(&correlation_id)
            .with_message_type("OrderPlaced")
            .with_source("demo")
            .with_tenant_id("tenant-a")
            .with_item("OrderNumber", n as i64);
        if let Some(parent) = &previous {
            ctx = ctx.with_causation_id(parent);
        }

        let span = enricher.start_operation_span("process_order", &ctx);

        diagnostics.track_context_history(&ctx, "received", None)?;
        let body = format!("order #{}", n);

        ctx.set_item(STAGE_ITEM_KEY, "Ingress");
        middleware
            .invoke(body.as_str(), &mut ctx, CancellationToken::new(), |_, ctx, _| {
                Box::pin(async move {
                    ctx.set_item("ReceivedBy", "ingress");
                    Ok::<_, ContextFlowError>(())
                })
            })
            .instrument(span.clone())
            .await?;

        tracker.correlate_across_boundary(&ctx, "billing")?;

        ctx.set_item(STAGE_ITEM_KEY, "Billing");
        let outcome = middleware
            .invoke(body.as_str(), &mut ctx, CancellationToken::new(), |body, ctx, _| {
                Box::pin(async move {
                    ctx.set_item("Amount", body.len() as i64 * 10);
                    Ok::<_, ContextFlowError>(body.len())
                })
            })
            .instrument(span)
            .await;
        if let Err(e) = outcome {
            tracing::warn!(message_id = %message_id, error = %e, "Billing stage failed");
        }

        diagnostics.detect_anomalies(&ctx);
        diagnostics.track_context_history(&ctx, "completed", Some("billing"))?;
        for issue in diagnostics.analyze_context_health(&ctx) {
            tracing::info!(message_id = %message_id, issue = ?issue.category, "{}", issue.description);
        }

        first_message.get_or_insert(message_id.clone());
        previous = Some(message_id);
    }

    if let Some(message_id) = &first_message {
        println!("{}", diagnostics.visualize_context_flow(message_id));
    }
    println!("{}", diagnostics.generate_correlation_report(&correlation_id));

    if cli.export {
        println!("{}", diagnostics.export_diagnostic_data(None)?);
    }

    let summary = metrics.get_metrics_summary();
    tracing::info!(
        processed = summary.total_contexts_processed,
        preservation_rate = summary.preservation_rate,
        mutations = summary.total_mutations,
        anomalies = summary.total_anomalies,
        "Run complete"
    );

    middleware.dispose_async().await;
    diagnostics.dispose_async().await;
    tracker.dispose_async().await;
    Ok(())
}
