use anyhow::{Context, Result};
use clap::Parser;
use footfall_pipeline::cli::{Args, Command};
use footfall_pipeline::config::Config;
use footfall_pipeline::ingest::{HttpReportFetcher, IngestionRunner};
use footfall_pipeline::pipeline::{Pipeline, PipelineSettings};
use footfall_pipeline::rollup::RollupAggregator;
use footfall_pipeline::scheduler::ScheduleService;
use footfall_pipeline::state::AppState;
use footfall_pipeline::store::{PgStore, TrafficStore};
use footfall_pipeline::{db, routes};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,footfall_pipeline=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "footfall-pipeline"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn build_pipeline(config: &Config) -> Result<Arc<Pipeline>> {
    let pool = db::connect_lazy(&config.database_url, config.db_pool_size)?;
    let store: Arc<dyn TrafficStore> = Arc::new(PgStore::new(pool));
    let http = reqwest::Client::builder()
        .connect_timeout(config.request_timeout())
        .build()
        .context("failed to build sensor HTTP client")?;
    let fetcher = HttpReportFetcher::new(http, config.request_timeout());
    let ingest = IngestionRunner::new(store.clone(), Arc::new(fetcher), config.ingest_settings()?);
    let rollup = RollupAggregator::new(store.clone(), config.rollup_settings());
    Ok(Arc::new(Pipeline::new(
        store,
        ingest,
        rollup,
        PipelineSettings {
            chain_rollup: config.chain_rollup,
            thresholds: config.threshold_defaults(),
        },
    )))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind footfall-pipeline listener on {addr}: port already in use. Stop the other service or pass --listen with another address.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind footfall-pipeline listener on {addr}"))
        }
    }
}

async fn serve(config: &Config, pipeline: Arc<Pipeline>, listen: Option<String>) -> Result<()> {
    let secret = config.require_trigger_secret()?;
    let cancel = CancellationToken::new();
    if let Some(interval) = config.schedule_interval() {
        ScheduleService::new(pipeline.clone(), interval).start(cancel.clone());
    }

    let app = routes::router(AppState::new(pipeline, secret));
    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "footfall-pipeline listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
            }
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pipeline = build_pipeline(&config)?;
    match args.command {
        Command::Serve { listen } => serve(&config, pipeline, listen).await?,
        Command::RunOnce { no_chain } => {
            let chain = if no_chain { Some(false) } else { None };
            let pass = pipeline.run_ingest(chain).await?;
            print_json(&pass)?;
        }
        Command::Rollup => {
            let pass = pipeline.run_rollup().await?;
            print_json(&pass)?;
        }
        Command::EvaluateAlerts => {
            let report = pipeline.evaluate_alerts().await?;
            print_json(&report)?;
        }
    }

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
