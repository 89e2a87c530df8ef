mod catalog;
mod config;
mod error;
mod handlers;
mod monitor;
mod pipeline;
mod pool;
mod registry;
mod runner;
mod session;
mod state;
mod store;
mod warmup;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::pipeline::PipelineController;
use crate::pool::ExecutionPool;
use crate::runner::StageRunner;
use crate::state::AppState;
use crate::store::{JsonlStore, RecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info,axum=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env();
    info!(?settings, "configuración cargada");

    let store: Arc<dyn RecordStore> = Arc::new(
        JsonlStore::open(&settings.database_path)
            .with_context(|| format!("abriendo {}", settings.database_path.display()))?,
    );

    let pool = ExecutionPool::new(settings.pool_size);
    let pipeline = catalog::default_pipeline(&settings, store.clone());
    let controller = Arc::new(PipelineController::new(
        pipeline.clone(),
        StageRunner::new(pool.clone()),
    ));
    let state = AppState::new(controller, store);

    // router HTTP
    let app = handlers::build_router(state.clone(), settings.max_upload_bytes);

    // retención de tareas terminadas en segundo plano
    tokio::spawn(monitor::sweep_finished_tasks(
        state.registry.clone(),
        settings.task_retention,
        settings.sweep_interval,
    ));

    // carga de modelos
    tokio::spawn(warmup::warm_models(pipeline, pool, state.models_ready.clone()));

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", settings.bind_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
