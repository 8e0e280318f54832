pub mod config;
pub mod content;
pub mod cron;
pub mod db;
pub mod error;
pub mod events;
pub mod extract;
pub mod generate;
pub mod normalize;
pub mod provider;
pub mod registry;
pub mod salvage;
pub mod task;
pub mod tasks;
pub mod worker;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Router,
};
use config::ProviderSettings;
use futures::stream::{Stream, StreamExt};
use provider::ProviderFactory;
use registry::TaskRegistry;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    /// Server-wide provider defaults; a job's `providerConfig` is merged on top.
    pub provider: ProviderSettings,
    pub factory: Arc<dyn ProviderFactory>,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/tasks/running/count", get(tasks::running_count))
        .route(
            "/tasks/:id",
            get(tasks::get_task)
                .patch(tasks::update_task)
                .delete(tasks::cancel_task),
        )
        .route("/generate", post(generate::generate_questions))
        .route("/generate-structure", post(generate::generate_structure))
        .route("/events", get(sse_handler));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("New SSE connection established");
    let rx = state.registry.subscribe();

    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().event("task").data(data))
        }
        Err(_lag) => {
            tracing::warn!("SSE stream lagged");
            Ok(Event::default().comment("lagged"))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health_check() -> &'static str {
    "OK"
}
