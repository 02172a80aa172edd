use anyhow::{Context, Result};
use rollcall_core::{CascadeDetector, FaceStore};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::load()?;
    config.lbph.validate()?;

    let cascade_path = config
        .cascade_path
        .clone()
        .context("no Haar cascade found; set ROLLCALL_CASCADE_PATH")?;
    let detector = CascadeDetector::load(&cascade_path, config.detection)
        .with_context(|| format!("loading cascade {}", cascade_path.display()))?;
    tracing::info!(
        path = %cascade_path.display(),
        scale_factor = config.detection.scale_factor,
        min_neighbors = config.detection.min_neighbors,
        "face detector loaded"
    );

    let store = FaceStore::open(&config.faces_dir)?;
    let handle = engine::spawn_engine(engine::Engine::new(
        Box::new(detector),
        store,
        config.lbph,
    ))?;

    let app = routes::app(handle, config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, faces_dir = %config.faces_dir.display(), "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
