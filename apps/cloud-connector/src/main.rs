use anyhow::{Context, Result};
use cloud_connector::config::Config;
use cloud_connector::http::{self, HttpState};
use cloud_connector::registry::{build_devices, build_sinks};
use cloud_connector::runner::Runner;
use cloud_connector::sender::DataSender;
use cloud_connector::tsdb::{ensure_store, TimeSeriesStore, TimescaleStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cloud_connector=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "cloud-connector"),
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

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty());
    init_tracing(otlp_endpoint.as_deref())?;

    let result = run().await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "cloud-connector exiting");
    }
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }
    result
}

async fn run() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        path = %config.config_path.display(),
        devices = config.devices.len(),
        clouds = config.clouds.len(),
        "configuration loaded"
    );

    let store = TimescaleStore::connect(&config.store, config.db_pool_size)
        .await
        .context("failed to connect to the time-series store")?;
    ensure_store(&store)
        .await
        .context("failed to prepare the time-series store")?;
    let store: Arc<dyn TimeSeriesStore> = Arc::new(store);

    let sinks = build_sinks(&config.clouds).context("failed to set up cloud sinks")?;
    let devices = build_devices(&config.devices)
        .await
        .context("failed to set up devices")?;

    let sender = Arc::new(DataSender::new(sinks, store));
    let runner = Arc::new(Runner::new(devices, sender.clone(), config.read_interval));

    let shutdown = CancellationToken::new();
    let http_handle = match config.http_bind {
        Some(bind) => {
            let app = http::router(HttpState {
                sender: sender.clone(),
                runner: runner.clone(),
            });
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
            tracing::info!(bind = %bind, "cloud-connector HTTP listening");
            let graceful = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(graceful.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %err, "HTTP server exited");
                }
            }))
        }
        None => None,
    };
    runner.start().await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "unable to listen for shutdown signal"),
    }

    shutdown.cancel();
    if let Some(handle) = http_handle {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "HTTP task failed");
        }
    }
    runner.stop().await;
    sender.close().await;
    tracing::info!("cloud-connector stopped");
    Ok(())
}
