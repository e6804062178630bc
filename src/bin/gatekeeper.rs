use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::broker::{RedisSink, RedisSource};
use vigil_core::error::StartupError;
use vigil_core::store::RedisCache;
use vigil_core::{Baseline, BoundaryBackend, Drain, EnsembleEngine, Pipeline, PipelineConfig, ZScoreBackend};

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_ALERT_LIMIT: usize = 10;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn Error>;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

// --- Backends ---

/// Both reference backends over one baseline file, or untrained backends
/// when no baseline is configured.
fn load_engine() -> Result<EnsembleEngine, BoxError> {
    let (zscore, boundary) = match std::env::var("VIGIL_BASELINE_PATH") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let baseline: Baseline = serde_json::from_str(&raw)?;
            info!(path, features = baseline.features.len(), "Baseline loaded.");
            (ZScoreBackend::fitted(baseline.clone()), BoundaryBackend::fitted(baseline))
        }
        Err(_) => {
            warn!("VIGIL_BASELINE_PATH not set, backends are untrained.");
            (ZScoreBackend::untrained(), BoundaryBackend::untrained())
        }
    };
    Ok(EnsembleEngine::builder().backend(zscore).backend(boundary).build()?)
}

fn start_pipeline(config: PipelineConfig, engine: EnsembleEngine) -> Result<Pipeline, StartupError> {
    let mut source = RedisSource::connect(&config.broker_url, &config.topics.input, &config.consumer_group)?;
    source.recover()?;
    let sink = RedisSink::connect(&config.broker_url, config.replica_acks, ACK_TIMEOUT)?;
    let cache = RedisCache::connect(&config.cache_url)?;

    Pipeline::start(config, Arc::new(engine), Box::new(source), Arc::new(sink), Arc::new(cache))
}

// --- Handlers ---

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = state.pipeline.engine();
    let models_loaded = engine.is_ready();
    let running = state.pipeline.is_running();
    Json(serde_json::json!({
        "status": if running && models_loaded { "healthy" } else { "degraded" },
        "pipeline_running": running,
        "models_loaded": models_loaded,
        "backends": engine.backend_names().collect::<Vec<_>>(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.telemetry().encode() {
        Ok(text) => text.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    match tokio::task::spawn_blocking(move || state.pipeline.metrics()).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    match tokio::task::spawn_blocking(move || state.pipeline.recent_alerts(limit)).await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

// --- Main ---

fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats))
        .route("/alerts", get(alerts))
        .with_state(AppState { pipeline })
}

async fn listen<F>(pipeline: Arc<Pipeline>, addr: &str, shutdown: F) -> Result<(), BoxError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "Gatekeeper listening.");
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serves until `shutdown` resolves or serving fails, then drains the
/// pipeline in both cases.
async fn serve<F>(pipeline: Pipeline, addr: &str, shutdown: F) -> Result<Option<Drain>, BoxError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pipeline = Arc::new(pipeline);
    let served = listen(pipeline.clone(), addr, shutdown).await;
    if let Err(err) = &served {
        error!(error = %err, "HTTP server failed, stopping pipeline");
    }

    // The router and its state are gone once `listen` returns.
    let drain = match Arc::into_inner(pipeline) {
        Some(pipeline) => Some(tokio::task::spawn_blocking(move || pipeline.stop()).await?),
        None => {
            warn!("Pipeline still shared at shutdown, skipping drain.");
            None
        }
    };
    served.map(|()| drain)
}

async fn run() -> Result<(), BoxError> {
    let config = PipelineConfig::from_env()?;
    let engine = load_engine()?;
    let pipeline = start_pipeline(config, engine)?;

    let addr = std::env::var("VIGIL_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let drain = serve(pipeline, &addr, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
        }
        info!("Shutting down... (Waiting for queues to drain)");
    })
    .await?;
    info!(?drain, "Goodbye.");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Vigil Gatekeeper.");
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Gatekeeper failed.");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vigil_core::broker::{EventSink, MemoryBroker};
    use vigil_core::error::BrokerError;
    use vigil_core::store::MemoryCache;

    #[derive(Default)]
    struct ClosingSink {
        closed: AtomicBool,
    }

    impl EventSink for ClosingSink {
        fn send(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<(), BrokerError> {
            Ok(())
        }

        fn close(&self) -> Result<(), BrokerError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline(sink: Arc<ClosingSink>) -> Pipeline {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(10),
            ingest_poll_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let broker = MemoryBroker::new(1);
        let engine = EnsembleEngine::builder()
            .backend(ZScoreBackend::untrained())
            .build()
            .unwrap();
        Pipeline::start(
            config.clone(),
            Arc::new(engine),
            Box::new(broker.source(&config.topics.input, &config.consumer_group)),
            sink,
            Arc::new(MemoryCache::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_failure_still_drains_pipeline() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let sink = Arc::new(ClosingSink::default());

        let result = serve(pipeline(sink.clone()), &addr, std::future::pending()).await;
        assert!(result.is_err());
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_pipeline() {
        let sink = Arc::new(ClosingSink::default());
        let drain = serve(pipeline(sink.clone()), "127.0.0.1:0", async {}).await.unwrap();
        assert_eq!(drain, Some(Drain::Complete));
        assert!(sink.closed.load(Ordering::SeqCst));
    }
}
