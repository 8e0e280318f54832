use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Job category. Decides how the raw provider output is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Quiz questions from free text
    GenerateQuestions,
    /// Units -> lessons -> questions from free text
    GenerateStructure,
    GenerateImage,
    BatchImages,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::GenerateQuestions => "generate_questions",
            TaskKind::GenerateStructure => "generate_structure",
            TaskKind::GenerateImage => "generate_image",
            TaskKind::BatchImages => "batch_images",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generate_questions" => Some(TaskKind::GenerateQuestions),
            "generate_structure" => Some(TaskKind::GenerateStructure),
            "generate_image" => Some(TaskKind::GenerateImage),
            "batch_images" => Some(TaskKind::BatchImages),
            _ => None,
        }
    }

    /// Whether a completed job of this kind is expected to carry at least one item.
    pub fn requires_items(&self) -> bool {
        matches!(self, TaskKind::GenerateQuestions | TaskKind::GenerateStructure)
    }
}

/// Lifecycle state.
///
/// ```text
/// Pending -> Running -> Completed
///                   \-> Failed
/// Pending | Running -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Position along the lifecycle; transitions may only move forward.
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            _ => 2,
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// One asynchronous generation job and its lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub owner_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub owner_id: String,
    pub kind: TaskKind,
    pub title: String,
    #[serde(default)]
    pub input_summary: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl Task {
    pub fn new(req: NewTask) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            owner_id: req.owner_id,
            kind: req.kind,
            status: TaskStatus::Pending,
            progress: 0,
            title: req.title,
            input_summary: req.input_summary,
            result: None,
            error: None,
            created_at: now(),
            started_at: None,
            completed_at: None,
            metadata: req.metadata.unwrap_or_default(),
        }
    }

    /// Merge a partial update into this task.
    ///
    /// Status only moves forward; a terminal task keeps its status and
    /// timestamps, but late `result`/`error` corrections are still applied.
    pub fn apply(&mut self, patch: TaskPatch, now: DateTime<Utc>) {
        let was_terminal = self.status.is_terminal();

        if let Some(next) = patch.status {
            if self.status.can_transition_to(next) {
                self.status = next;
            } else if next != self.status {
                tracing::debug!(
                    task_id = %self.id,
                    from = self.status.as_str(),
                    to = next.as_str(),
                    "ignoring backwards status transition"
                );
            }
        }

        if self.status == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }

        if !was_terminal {
            if let Some(p) = patch.progress {
                self.progress = self.progress.max(p.min(100));
            }
            if self.status == TaskStatus::Completed {
                self.progress = 100;
            }
            if let Some(title) = patch.title {
                self.title = title;
            }
            if let Some(metadata) = patch.metadata {
                self.metadata.extend(metadata);
            }
        }

        if let Some(result) = patch.result {
            self.result = Some(result);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
    }
}

/// Partial update merged by `TaskRegistry::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        TaskPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        TaskPatch {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn completed(result: Value) -> Self {
        TaskPatch {
            status: Some(TaskStatus::Completed),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskPatch {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Current time at the precision the store keeps, so a task reads back equal
/// from either view.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Char-safe preview of submitted input.
pub fn summarize_input(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task() -> Task {
        Task::new(NewTask {
            owner_id: "u1".into(),
            kind: TaskKind::GenerateQuestions,
            title: "Quiz".into(),
            input_summary: None,
            metadata: None,
        })
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = new_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_started_at_stamped_once() {
        let mut task = new_task();
        let t1 = Utc::now();
        task.apply(TaskPatch::status(TaskStatus::Running), t1);
        let t2 = t1 + chrono::Duration::seconds(5);
        task.apply(TaskPatch::status(TaskStatus::Running), t2);
        assert_eq!(task.started_at, Some(t1));
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut task = new_task();
        let t1 = Utc::now();
        task.apply(TaskPatch::completed(json!({"items": []})), t1);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);

        let t2 = t1 + chrono::Duration::seconds(5);
        task.apply(TaskPatch::failed("late"), t2);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, Some(t1));
        // late error write is still recorded
        assert_eq!(task.error.as_deref(), Some("late"));
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut task = new_task();
        task.apply(TaskPatch::status(TaskStatus::Running), Utc::now());
        task.apply(TaskPatch::status(TaskStatus::Pending), Utc::now());
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn test_progress_is_monotone_and_clamped() {
        let mut task = new_task();
        task.apply(TaskPatch::status(TaskStatus::Running), Utc::now());
        task.apply(TaskPatch::progress(40), Utc::now());
        task.apply(TaskPatch::progress(20), Utc::now());
        assert_eq!(task.progress, 40);
        task.apply(TaskPatch::progress(250), Utc::now());
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_kind_and_status_names_round_trip() {
        for kind in [
            TaskKind::GenerateQuestions,
            TaskKind::GenerateStructure,
            TaskKind::GenerateImage,
            TaskKind::BatchImages,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                json!(kind.as_str())
            );
        }
        assert_eq!(TaskStatus::parse("cancelled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse("processing"), None);
    }

    #[test]
    fn test_summarize_input() {
        assert_eq!(summarize_input("  short  ", 10), "short");
        assert_eq!(summarize_input("abcdef", 3), "abc...");
        assert_eq!(summarize_input("課程內容很長", 2), "課程...");
    }
}
