mod api;
mod catalog;
mod config;
mod ingest;
mod pipeline;
mod telemetry;

use crate::api::HttpFleetSource;
use crate::config::Config;
use crate::ingest::FsPartitionStore;
use crate::pipeline::{Pipeline, PipelineSettings};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,vessel_ingest=info".into());
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
                KeyValue::new("service.name", "vessel-ingest"),
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
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let source = Arc::new(HttpFleetSource::new(&config).context("failed to build http client")?);
    let store = Arc::new(FsPartitionStore::new(config.data_dir.clone()));
    let pipeline = Pipeline::new(PipelineSettings::from_config(&config), source, store);

    tracing::info!(
        mode = %config.run_mode,
        data_dir = %config.data_dir.display(),
        workers = config.max_workers,
        "vessel-ingest starting"
    );

    let outcome = tokio::select! {
        res = pipeline.run_once(Utc::now()) => res.map(Some),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received; abandoning run");
            Ok(None)
        }
    };

    let result = match outcome {
        Ok(Some(report)) => {
            tracing::info!(
                run_id = %report.run_id,
                day = %report.day,
                mode = %report.mode,
                rotated = report.rotation.rotated,
                signals_added = report.signals_added,
                signals_renamed = report.signals_renamed,
                "run finished"
            );
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "run failed");
            Err(err)
        }
    };

    opentelemetry::global::shutdown_tracer_provider();
    result
}
