//! Desk and room booking engine: conflict detection, occupancy aggregation and
//! timezone-aware availability views over a WAL-backed in-memory store.

pub mod compactor;
pub mod config;
pub mod engine;
pub mod interval;
pub mod limits;
pub mod model;
pub mod observability;
pub mod timezone;
pub mod wal;

use std::sync::Arc;

use tracing::{info, warn};

pub use config::Config;
pub use engine::{Engine, EngineError};

/// Start a store from `config`: install tracing and metrics, create the data
/// directory, replay the WAL and spawn the background compactor.
pub async fn bootstrap(config: &Config) -> Result<Arc<Engine>, EngineError> {
    observability::init_tracing();
    if let Err(e) = observability::init(config.metrics_port) {
        warn!("metrics exporter not installed: {e}");
    }
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

    let engine = Arc::new(Engine::open(config.wal_path()).await?);
    tokio::spawn(compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));
    info!(
        "deskbook ready: data_dir {}, compact threshold {}",
        config.data_dir.display(),
        config.compact_threshold
    );
    Ok(engine)
}
