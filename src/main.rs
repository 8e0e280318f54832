use anyhow::Context;
use lessonforge::config::Config;
use lessonforge::cron;
use lessonforge::db::{Database, TaskStore};
use lessonforge::provider::HttpProviderFactory;
use lessonforge::registry::TaskRegistry;
use lessonforge::{build_router, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lessonforge=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting lessonforge-server...");

    let config = Config::from_env();

    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;
    let orphaned = db
        .fail_orphaned_tasks("interrupted by server restart")
        .context("Failed to recover orphaned tasks")?;
    if orphaned > 0 {
        tracing::warn!("Marked {} interrupted task(s) as failed", orphaned);
    }

    let (tx, _rx) = tokio::sync::broadcast::channel(100);
    let registry = Arc::new(TaskRegistry::new(Arc::new(db), tx, config.eviction_grace));

    let cron_registry = registry.clone();
    let period = config.eviction_interval;
    tokio::spawn(async move {
        cron::start_eviction_task(cron_registry, period).await;
    });

    tracing::info!(
        "Provider defaults: {:?} model {}",
        config.provider.kind,
        config.provider.model
    );

    let state = AppState {
        registry,
        provider: config.provider.clone(),
        factory: Arc::new(HttpProviderFactory),
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
