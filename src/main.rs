use anyhow::Result;
use std::sync::Arc;

mod config;
mod context;
mod functions;
mod schema;
mod services;

use config::AppConfig;
use context::AppContext;
use functions::{ApiState, Orchestrator, TrainingScheduler};
use services::{
    AdmissionController, DirectoryLabelCorpus, JobStore, LabelCorpus, MemoryJobStore, PgJobStore,
    SystemProbe, TokioProcessLauncher,
};

async fn init_store(config: &AppConfig) -> Result<(Arc<dyn JobStore>, Arc<dyn LabelCorpus>)> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = Arc::new(PgJobStore::connect(url).await?);
            let jobs: Arc<dyn JobStore> = store.clone();
            let corpus: Arc<dyn LabelCorpus> = store;
            Ok((jobs, corpus))
        }
        None => {
            tracing::warn!(
                labeled_dir = %config.storage.labeled_dir.display(),
                "DATABASE_URL not set, using in-memory job store and on-disk labels"
            );
            let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
            let corpus: Arc<dyn LabelCorpus> =
                Arc::new(DirectoryLabelCorpus::new(&config.storage.labeled_dir));
            Ok((jobs, corpus))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    for dir in [&config.storage.temp_dir, &config.storage.models_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let (store, corpus) = init_store(&config).await?;
    let ctx = AppContext::new(
        config,
        store,
        corpus,
        AdmissionController::new(Arc::new(SystemProbe)),
        Arc::new(TokioProcessLauncher),
    );

    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    let orphaned = orchestrator.recover_orphaned_jobs().await?;
    if orphaned > 0 {
        tracing::warn!(orphaned, "failed training jobs left over from a previous run");
    }
    orchestrator.start();

    let scheduler = if ctx.config.scheduler.enabled {
        let scheduler = Arc::new(TrainingScheduler::new(ctx.clone(), orchestrator.clone())?);
        scheduler.start();
        Some(scheduler)
    } else {
        tracing::info!("scheduler disabled");
        None
    };

    let app = functions::router(ApiState {
        ctx: ctx.clone(),
        orchestrator: orchestrator.clone(),
        scheduler: scheduler.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&ctx.config.http_addr).await?;
    tracing::info!(addr = %ctx.config.http_addr, "admin API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    orchestrator.stop().await;
    served?;
    Ok(())
}
