use crate::task::{Task, TaskKind, TaskStatus};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    pub owner_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        TaskEvent {
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            kind: task.kind,
            status: task.status,
            progress: task.progress,
        }
    }
}
