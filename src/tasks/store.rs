use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::tasks::{AsyncTask, TaskState};

use super::TaskError;

/// Durable storage for [`AsyncTask`] records. The engine treats every
/// state mutation as write-through: a call only returns once the store
/// has persisted it (spec.md §4.E "write-through durability").
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &AsyncTask) -> Result<(), TaskError>;
    async fn get(&self, id: Uuid) -> Result<Option<AsyncTask>, TaskError>;
    async fn update(&self, task: &AsyncTask) -> Result<(), TaskError>;
    async fn list_due_for_retry(&self, now: chrono::DateTime<Utc>) -> Result<Vec<AsyncTask>, TaskError>;
    async fn list_by_virtual_key(&self, virtual_key_id: &str) -> Result<Vec<AsyncTask>, TaskError>;
}

/// In-process store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<Uuid, AsyncTask>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &AsyncTask) -> Result<(), TaskError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AsyncTask>, TaskError> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn update(&self, task: &AsyncTask) -> Result<(), TaskError> {
        if !self.tasks.contains_key(&task.id) {
            return Err(TaskError::NotFound(task.id));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn list_due_for_retry(&self, now: chrono::DateTime<Utc>) -> Result<Vec<AsyncTask>, TaskError> {
        Ok(self
            .tasks
            .iter()
            .filter(|e| e.state == TaskState::Pending && e.next_retry_at.map(|t| t <= now).unwrap_or(false))
            .map(|e| e.clone())
            .collect())
    }

    async fn list_by_virtual_key(&self, virtual_key_id: &str) -> Result<Vec<AsyncTask>, TaskError> {
        Ok(self
            .tasks
            .iter()
            .filter(|e| e.virtual_key_id == virtual_key_id)
            .map(|e| e.clone())
            .collect())
    }
}

/// Postgres-backed store, grounded on the same `sqlx::PgPool`
/// query-builder usage as [`crate::lock::PgAdvisoryLock`].
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: TaskRow) -> AsyncTask {
        AsyncTask {
            id: row.id,
            task_type: row.task_type,
            state: row.state,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            virtual_key_id: row.virtual_key_id,
            metadata_json: row.metadata_json,
            progress_percent: row.progress_percent as u8,
            result_json: row.result_json,
            error: row.error,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: row.next_retry_at,
            progress_message: row.progress_message,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task_type: String,
    state: TaskState,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
    virtual_key_id: String,
    metadata_json: serde_json::Value,
    progress_percent: i16,
    result_json: Option<serde_json::Value>,
    error: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<chrono::DateTime<Utc>>,
    progress_message: Option<String>,
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: &AsyncTask) -> Result<(), TaskError> {
        sqlx::query(
            "INSERT INTO async_tasks (id, task_type, state, created_at, updated_at, completed_at, \
             virtual_key_id, metadata_json, progress_percent, result_json, error, retry_count, \
             max_retries, next_retry_at, progress_message) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(task.id)
        .bind(&task.task_type)
        .bind(task.state)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(&task.virtual_key_id)
        .bind(&task.metadata_json)
        .bind(task.progress_percent as i16)
        .bind(&task.result_json)
        .bind(&task.error)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.next_retry_at)
        .bind(&task.progress_message)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AsyncTask>, TaskError> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM async_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TaskError::Store(e.to_string()))?;
        Ok(row.map(Self::row_to_task))
    }

    async fn update(&self, task: &AsyncTask) -> Result<(), TaskError> {
        let result = sqlx::query(
            "UPDATE async_tasks SET state = $2, updated_at = $3, completed_at = $4, \
             progress_percent = $5, result_json = $6, error = $7, retry_count = $8, \
             next_retry_at = $9, progress_message = $10 WHERE id = $1",
        )
        .bind(task.id)
        .bind(task.state)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(task.progress_percent as i16)
        .bind(&task.result_json)
        .bind(&task.error)
        .bind(task.retry_count as i32)
        .bind(task.next_retry_at)
        .bind(&task.progress_message)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::Store(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound(task.id));
        }
        Ok(())
    }

    async fn list_due_for_retry(&self, now: chrono::DateTime<Utc>) -> Result<Vec<AsyncTask>, TaskError> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM async_tasks WHERE state = 'Pending' AND next_retry_at <= $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| TaskError::Store(e.to_string()))?;
        Ok(rows.into_iter().map(Self::row_to_task).collect())
    }

    async fn list_by_virtual_key(&self, virtual_key_id: &str) -> Result<Vec<AsyncTask>, TaskError> {
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM async_tasks WHERE virtual_key_id = $1")
            .bind(virtual_key_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TaskError::Store(e.to_string()))?;
        Ok(rows.into_iter().map(Self::row_to_task).collect())
    }
}
