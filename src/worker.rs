//! Task executor: runs one generation job end to end in the background.
//!
//! Checkpoints, in order: cancelled? -> running (10%) -> cancelled? -> provider
//! call under a deadline -> cancelled? -> 60% -> extract + parse -> cancelled?
//! -> 90% -> completed. Provider errors fail the task with their message
//! verbatim. A cancelled task never receives another write from here, and every
//! failed task has been running first.

use crate::config::ProviderSettings;
use crate::content::ExpectedShape;
use crate::error::{ProviderError, RegistryError};
use crate::extract::extract;
use crate::provider::{CompletionRequest, TextGenerator};
use crate::registry::TaskRegistry;
use crate::salvage::{self, ParseOutcome};
use crate::task::{TaskKind, TaskPatch, TaskStatus};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PROGRESS_STARTED: u8 = 10;
pub const PROGRESS_GENERATED: u8 = 60;
pub const PROGRESS_PARSED: u8 = 90;

/// At most this many rescue fragments are copied into a task result.
pub const FRAGMENT_SAMPLE: usize = 5;

pub const EMPTY_NOTICE: &str = "No usable items were generated from this input";

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub task_id: String,
    pub kind: TaskKind,
    pub system_prompt: String,
    pub content: String,
    pub settings: ProviderSettings,
}

/// Record shape the executor parses for a kind. Image kinds are driven by
/// external workers through the task API and have none.
pub fn expected_shape(kind: TaskKind) -> Option<ExpectedShape> {
    match kind {
        TaskKind::GenerateQuestions => Some(ExpectedShape::Questions),
        TaskKind::GenerateStructure => Some(ExpectedShape::Units),
        TaskKind::GenerateImage | TaskKind::BatchImages => None,
    }
}

pub fn spawn_generation(
    registry: Arc<TaskRegistry>,
    provider: Arc<dyn TextGenerator>,
    job: GenerationJob,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_generation(&registry, provider.as_ref(), job).await;
    })
}

/// Run a job to completion. Never returns an error; anything that goes wrong is
/// recorded on the task or logged.
pub async fn run_generation(registry: &TaskRegistry, provider: &dyn TextGenerator, job: GenerationJob) {
    let task_id = job.task_id.clone();
    tracing::info!("Processing task {} ({}) via {}", task_id, job.kind.as_str(), provider.name());

    if let Err(e) = execute(registry, provider, job).await {
        tracing::error!("Task {} could not be recorded: {}", task_id, e);
    }
}

async fn execute(
    registry: &TaskRegistry,
    provider: &dyn TextGenerator,
    job: GenerationJob,
) -> Result<(), RegistryError> {
    let id = job.task_id.as_str();
    let cancel = registry
        .cancellation_token(id)
        .unwrap_or_else(CancellationToken::new);

    if cancel.is_cancelled() {
        tracing::info!("Task {} cancelled before dispatch", id);
        return Ok(());
    }

    let Some(shape) = expected_shape(job.kind) else {
        let msg = format!("task kind {} is not run by the text executor", job.kind.as_str());
        registry.update(id, TaskPatch::status(TaskStatus::Running)).await?;
        registry.update(id, TaskPatch::failed(msg)).await?;
        return Ok(());
    };

    let mut metadata = Map::new();
    metadata.insert("provider".into(), Value::String(provider.name().to_string()));
    metadata.insert("model".into(), Value::String(job.settings.model.clone()));
    registry
        .update(
            id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                progress: Some(PROGRESS_STARTED),
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await?;

    if cancel.is_cancelled() {
        tracing::info!("Task {} cancelled after start, skipping provider call", id);
        return Ok(());
    }

    let request = CompletionRequest {
        system: job.system_prompt,
        prompt: job.content,
        params: job.settings.params.clone(),
    };
    let deadline = job.settings.timeout;
    let raw = match tokio::time::timeout(deadline, provider.complete(&request)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return fail(registry, id, &cancel, e).await,
        Err(_) => return fail(registry, id, &cancel, ProviderError::Timeout(deadline)).await,
    };

    if cancel.is_cancelled() {
        tracing::info!("Task {} cancelled during provider call, discarding response", id);
        return Ok(());
    }
    registry.update(id, TaskPatch::progress(PROGRESS_GENERATED)).await?;

    let payload = extract(&raw);
    let outcome = salvage::parse(&payload, shape);
    if outcome.recovered {
        tracing::warn!(
            task_id = %id,
            rescued = outcome.rescued_count(),
            invalid = outcome.invalid_count(),
            spans = outcome.spans_found,
            "provider output needed span recovery, kept what could be parsed"
        );
    }

    if cancel.is_cancelled() {
        tracing::info!("Task {} cancelled before commit, discarding result", id);
        return Ok(());
    }
    registry.update(id, TaskPatch::progress(PROGRESS_PARSED)).await?;

    let item_count = outcome.items.len();
    registry
        .update(id, TaskPatch::completed(build_result(job.kind, &outcome)))
        .await?;
    tracing::info!("Task {} completed with {} item(s)", id, item_count);
    Ok(())
}

async fn fail(
    registry: &TaskRegistry,
    id: &str,
    cancel: &CancellationToken,
    error: ProviderError,
) -> Result<(), RegistryError> {
    if cancel.is_cancelled() {
        tracing::info!("Task {} cancelled, dropping provider error: {}", id, error);
        return Ok(());
    }
    tracing::error!(task_id = %id, "Task failed: {}", error);
    registry.update(id, TaskPatch::failed(error.to_string())).await?;
    Ok(())
}

/// Result envelope stored on a completed text task.
pub fn build_result(kind: TaskKind, outcome: &ParseOutcome) -> Value {
    let empty = kind.requires_items() && outcome.items.is_empty();
    let fragments: Vec<_> = outcome.fragments.iter().take(FRAGMENT_SAMPLE).collect();

    let mut result = json!({
        "items": outcome.items,
        "rescuedCount": outcome.rescued_count(),
        "invalidCount": outcome.invalid_count(),
        "fragments": fragments,
        "recovered": outcome.recovered,
        "empty": empty,
    });
    if empty {
        result["notice"] = Value::String(EMPTY_NOTICE.to_string());
    }
    result
}
