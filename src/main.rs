mod config;
mod error;
mod labels;
mod normalizer;
mod output;
mod provider;
mod roberta_provider;
mod routes;
mod types;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use config::Config;
use normalizer::Normalizer;
use provider::{InferenceProvider, ProviderHandle};
use roberta_provider::{RobertaConfigOptions, RobertaProvider};
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    tracing::info!("Starting sentiment server with config: {:?}", config);
    config.validate()?;

    let provider = Arc::new(provider_handle(&config));
    if config.eager_load {
        provider.get().await?;
    } else {
        tracing::info!(
            model_id = %config.model_id,
            "Model will be downloaded and loaded on the first request; pass --eager-load to do it at startup"
        );
    }

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let normalizer = Normalizer::new(provider, config.max_input_chars);
    let app = routes::router(AppState::new(normalizer))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sentiment_api=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// The model is only built when something first asks for it.
fn provider_handle(config: &Config) -> ProviderHandle {
    let options = RobertaConfigOptions {
        model_id: config.model_id.clone(),
        model_path: config.model_path.clone(),
        revision: config.model_revision.clone(),
        use_pth: config.use_pth,
        cpu: config.cpu_only,
        max_sequence_length: config.max_sequence_length,
        id2label: config.parse_id2label(),
        top_only: config.top_only,
    };

    ProviderHandle::new(move || {
        let options = options.clone();
        async move {
            tracing::info!("Loading RoBERTa model...");
            let model = RobertaProvider::new(options).await?;
            Ok::<_, anyhow::Error>(Arc::new(model) as Arc<dyn InferenceProvider>)
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
