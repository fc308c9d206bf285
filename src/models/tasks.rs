use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "PascalCase")]
#[sqlx(type_name = "task_state", rename_all = "PascalCase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

/// Durable async task record (spec.md §3 `AsyncTask`).
///
/// Invariant: `state.is_terminal()` implies `completed_at.is_some()`;
/// `retry_count <= max_retries`; terminal states only accept further
/// mutation of `result_json`/`error`, never a state change, which is
/// enforced by [`crate::tasks::AsyncTaskEngine::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub id: Uuid,
    pub task_type: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub virtual_key_id: String,
    pub metadata_json: Value,
    pub progress_percent: u8,
    pub result_json: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub progress_message: Option<String>,
}

impl AsyncTask {
    pub fn new(task_type: impl Into<String>, virtual_key_id: impl Into<String>, metadata_json: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            state: TaskState::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            virtual_key_id: virtual_key_id.into(),
            metadata_json,
            progress_percent: 0,
            result_json: None,
            error: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            progress_message: None,
        }
    }
}
