//! Ingest service binary entrypoint.
//! Loads config, seeds the source registry, starts the periodic fetch
//! scheduler and serves the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argos_ingest::api::{self, AppState};
use argos_ingest::ingest::capture::Capturer;
use argos_ingest::ingest::config::{load_config_default, load_sources_from};
use argos_ingest::ingest::guard::SsrfGuard;
use argos_ingest::ingest::pipeline::Pipeline;
use argos_ingest::ingest::scheduler::spawn_scheduler;
use argos_ingest::ingest::store::{MemoryRegistry, MemoryStore};
use argos_ingest::metrics::Metrics;
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENV_SOURCES_PATH: &str = "INGEST_SOURCES_PATH";
const DEFAULT_SOURCES_PATH: &str = "config/sources.toml";

/// `RUST_LOG` filter (default `argos_ingest=info,warn`); `LOG_FORMAT=json`
/// switches to JSON lines. A subscriber installed by the runtime wins.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("argos_ingest=info,ingest=info,ssrf=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading ingest config")?;

    let sources_path = std::env::var(ENV_SOURCES_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOURCES_PATH));
    let sources = if sources_path.exists() {
        load_sources_from(&sources_path)
            .with_context(|| format!("loading sources from {}", sources_path.display()))?
    } else {
        tracing::warn!(path = %sources_path.display(), "no source seed file, registry starts empty");
        Vec::new()
    };
    tracing::info!(sources = sources.len(), "source registry seeded");

    let registry = Arc::new(MemoryRegistry::with_sources(sources));
    let store = Arc::new(MemoryStore::new());
    let guard = Arc::new(SsrfGuard::new(cfg.guard.clone()));

    let pipeline = Arc::new(Pipeline::with_guard(
        &cfg,
        guard.clone(),
        registry,
        store.clone(),
    ));
    let capturer = Arc::new(Capturer::new(
        cfg.http_client(guard),
        store,
        pipeline.limiter().clone(),
    ));

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    spawn_scheduler(pipeline.clone(), cfg.schedule_interval(), async {
        let _ = tokio::signal::ctrl_c().await;
    });

    let router = api::router(AppState {
        pipeline,
        capturer,
        metrics,
    });
    Ok(router.into())
}
