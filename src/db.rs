use crate::error::StoreError;
use crate::task::{Task, TaskKind, TaskStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

/// Durable record store for tasks, keyed by task id and owner id.
pub trait TaskStore: Send + Sync {
    fn upsert_task(&self, task: &Task) -> Result<(), StoreError>;

    fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Tasks of one owner, newest first.
    fn list_tasks(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Mark tasks left active by a previous process as failed. Returns how many were touched.
    fn fail_orphaned_tasks(&self, reason: &str) -> Result<usize, StoreError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, owner_id, kind, status, progress, title, input_summary, result, error, created_at, started_at, completed_at, metadata";

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL,
                input_summary TEXT,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_owner_created ON tasks(owner_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    // fixed width so lexical order == chronological order
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

/// Raw column values, decoded into a `Task` outside the rusqlite row closure.
struct TaskRow {
    id: String,
    owner_id: String,
    kind: String,
    status: String,
    progress: i64,
    title: String,
    input_summary: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    metadata: String,
}

impl TryFrom<&Row<'_>> for TaskRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(TaskRow {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            title: row.get(5)?,
            input_summary: row.get(6)?,
            result: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            metadata: row.get(12)?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let kind = TaskKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task kind {:?}", row.kind)))?;
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown task status {:?}", row.status)))?;
        let result = row.result.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Task {
            id: row.id,
            owner_id: row.owner_id,
            kind,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            title: row.title,
            input_summary: row.input_summary,
            result,
            error: row.error,
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_opt_ts(row.started_at)?,
            completed_at: parse_opt_ts(row.completed_at)?,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

impl TaskStore for Database {
    fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&task.metadata)?;
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO tasks (id, owner_id, kind, status, progress, title, input_summary, result, error, created_at, started_at, completed_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
               ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status,
                   progress = excluded.progress,
                   title = excluded.title,
                   input_summary = excluded.input_summary,
                   result = excluded.result,
                   error = excluded.error,
                   started_at = excluded.started_at,
                   completed_at = excluded.completed_at,
                   metadata = excluded.metadata"#,
            params![
                task.id,
                task.owner_id,
                task.kind.as_str(),
                task.status.as_str(),
                task.progress as i64,
                task.title,
                task.input_summary,
                result,
                task.error,
                ts(&task.created_at),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                metadata,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))?;
            let mut rows = stmt.query(params![id])?;
            let found = match rows.next()? {
                Some(row) => Some(TaskRow::try_from(row)?),
                None => None,
            };
            found
        };
        row.map(Task::try_from).transpose()
    }

    fn list_tasks(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let limit = limit as i64;
        let rows = {
            let conn = self.conn()?;
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM tasks WHERE owner_id = ?1 AND status = ?2 ORDER BY created_at DESC LIMIT ?3",
                        TASK_COLUMNS
                    ))?;
                    let mut rows = stmt.query(params![owner_id, status.as_str(), limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(TaskRow::try_from(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM tasks WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                        TASK_COLUMNS
                    ))?;
                    let mut rows = stmt.query(params![owner_id, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(TaskRow::try_from(row)?);
                    }
                }
            }
            out
        };
        rows.into_iter().map(Task::try_from).collect()
    }

    fn fail_orphaned_tasks(&self, reason: &str) -> Result<usize, StoreError> {
        let now = ts(&Utc::now());
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2 WHERE status IN ('pending', 'running')",
            params![reason, now],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskPatch};
    use serde_json::json;

    fn sample(owner: &str, title: &str) -> Task {
        Task::new(NewTask {
            owner_id: owner.into(),
            kind: TaskKind::GenerateStructure,
            title: title.into(),
            input_summary: Some("chapter one".into()),
            metadata: Some(json!({"courseId": "c1"}).as_object().cloned().unwrap()),
        })
    }

    #[test]
    fn test_upsert_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut task = sample("u1", "Unit plan");
        db.upsert_task(&task).unwrap();

        task.apply(TaskPatch::completed(json!({"items": [1, 2]})), Utc::now());
        db.upsert_task(&task).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result, Some(json!({"items": [1, 2]})));
        assert_eq!(loaded.metadata.get("courseId"), Some(&json!("c1")));
        assert_eq!(ts(&loaded.created_at), ts(&task.created_at));
    }

    #[test]
    fn test_get_missing_task() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_task("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_filters_and_orders() {
        let db = Database::open_in_memory().unwrap();
        let mut first = sample("u1", "first");
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = sample("u1", "second");
        let other = sample("u2", "other");
        db.upsert_task(&first).unwrap();
        db.upsert_task(&second).unwrap();
        db.upsert_task(&other).unwrap();

        let tasks = db.list_tasks("u1", None, 10).unwrap();
        let titles: Vec<_> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);

        let limited = db.list_tasks("u1", None, 1).unwrap();
        assert_eq!(limited.len(), 1);

        let none = db.list_tasks("u1", Some(TaskStatus::Failed), 10).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_fail_orphaned_tasks() {
        let db = Database::open_in_memory().unwrap();
        let pending = sample("u1", "pending");
        let mut done = sample("u1", "done");
        done.apply(TaskPatch::completed(json!({})), Utc::now());
        db.upsert_task(&pending).unwrap();
        db.upsert_task(&done).unwrap();

        assert_eq!(db.fail_orphaned_tasks("restart").unwrap(), 1);
        let loaded = db.get_task(&pending.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("restart"));
        assert!(loaded.completed_at.is_some());
    }
}
