use crate::config::ProviderOverrides;
use crate::tasks::status_for;
use crate::task::{summarize_input, NewTask, TaskKind, TaskPatch, TaskStatus};
use crate::worker::{spawn_generation, GenerationJob};
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};

const INPUT_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub content: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub provider_config: Option<ProviderOverrides>,
    pub owner_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub task_id: String,
}

pub async fn generate_questions(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, StatusCode> {
    submit(state, TaskKind::GenerateQuestions, req).await
}

pub async fn generate_structure(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, StatusCode> {
    submit(state, TaskKind::GenerateStructure, req).await
}

/// Create the task, then schedule it. The response never waits on the provider.
async fn submit(
    state: AppState,
    kind: TaskKind,
    req: GenerateRequest,
) -> Result<Json<GenerateResponse>, StatusCode> {
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let title = req
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| default_title(kind).to_string());
    let task = state
        .registry
        .create(NewTask {
            owner_id: req.owner_id,
            kind,
            title,
            input_summary: Some(summarize_input(&req.content, INPUT_SUMMARY_CHARS)),
            metadata: None,
        })
        .await
        .map_err(|e| status_for(e, "create generation task"))?;

    let settings = match &req.provider_config {
        Some(overrides) => state.provider.merged(overrides),
        None => state.provider.clone(),
    };

    // a bad provider config is the job's failure, not the request's
    let provider = match state.factory.build(&settings) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!("Task {} has unusable provider config: {}", task.id, e);
            for patch in [TaskPatch::status(TaskStatus::Running), TaskPatch::failed(e.to_string())] {
                state
                    .registry
                    .update(&task.id, patch)
                    .await
                    .map_err(|e| status_for(e, "fail generation task"))?;
            }
            return Ok(Json(GenerateResponse { task_id: task.id }));
        }
    };

    spawn_generation(
        state.registry.clone(),
        provider,
        GenerationJob {
            task_id: task.id.clone(),
            kind,
            system_prompt: req.system_prompt,
            content: req.content,
            settings,
        },
    );

    Ok(Json(GenerateResponse { task_id: task.id }))
}

fn default_title(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::GenerateStructure => "Generated course structure",
        _ => "Generated questions",
    }
}
