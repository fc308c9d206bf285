//! Durable Async Task Engine (spec.md §4.E).
//!
//! Every mutation is write-through: the in-memory [`AsyncTask`] is only
//! considered updated once [`TaskStore::update`] has returned, mirroring
//! the durability contract the Lock Service applies to fencing values.
//! Retry backoff and cancellation grace period are sourced from
//! [`crate::config::TaskEngineSettings`].

mod cancellation;
mod store;

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TaskEngineSettings;
use crate::events::{GatewayEvent, GatewayEvents};
use crate::models::tasks::{AsyncTask, TaskState};

pub use cancellation::CancellationRegistry;
pub use store::{InMemoryTaskStore, PostgresTaskStore, TaskStore};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("task {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),
    #[error("store error: {0}")]
    Store(String),
    #[error("task {0} was cancelled")]
    Cancelled(Uuid),
    #[error("task {0} timed out")]
    TimedOut(Uuid),
}

/// Exponential backoff with jitter (spec.md §4.E "retry backoff
/// formula"): `min(maxDelay, base * 2^(retryCount-1))`, jittered by
/// `±jitterFraction`.
pub fn next_retry_delay(settings: &TaskEngineSettings, retry_count: u32) -> Duration {
    let base = settings.retry_base_delay_secs as f64;
    let max = settings.retry_max_delay_secs as f64;
    let exp = base * 2f64.powi(retry_count as i32 - 1);
    let capped = exp.min(max);

    let jitter_fraction = rand::thread_rng().gen_range(-settings.retry_jitter..=settings.retry_jitter);
    let jittered = (capped * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_secs_f64(jittered)
}

pub struct AsyncTaskEngine<S: TaskStore> {
    store: S,
    settings: TaskEngineSettings,
    cancellations: CancellationRegistry,
    events: Option<GatewayEvents>,
}

impl<S: TaskStore> AsyncTaskEngine<S> {
    pub fn new(store: S, settings: TaskEngineSettings, events: Option<GatewayEvents>) -> Self {
        Self {
            store,
            settings,
            cancellations: CancellationRegistry::new(),
            events,
        }
    }

    pub async fn create(
        &self,
        task_type: impl Into<String>,
        virtual_key_id: impl Into<String>,
        metadata_json: Value,
        max_retries: u32,
    ) -> Result<AsyncTask, TaskError> {
        let task = AsyncTask::new(task_type, virtual_key_id, metadata_json, max_retries);
        self.store.insert(&task).await?;
        self.cancellations.register(task.id);
        self.publish_created(&task).await;
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AsyncTask>, TaskError> {
        self.store.get(id).await
    }

    pub fn cancellation_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.cancellations.token_for(id)
    }

    pub async fn request_cancellation(&self, id: Uuid) -> Result<(), TaskError> {
        let mut task = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
        if task.state.is_terminal() {
            return Err(TaskError::AlreadyTerminal(id));
        }
        self.cancellations.cancel(id);
        task.state = TaskState::Cancelled;
        task.updated_at = Utc::now();
        task.completed_at = Some(task.updated_at);
        self.store.update(&task).await?;
        self.publish_updated(&task).await;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        id: Uuid,
        percent: u8,
        message: Option<String>,
    ) -> Result<AsyncTask, TaskError> {
        let mut task = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
        if task.state.is_terminal() {
            return Err(TaskError::AlreadyTerminal(id));
        }
        task.state = TaskState::Processing;
        task.progress_percent = percent.min(100);
        task.progress_message = message;
        task.updated_at = Utc::now();
        self.store.update(&task).await?;
        self.publish_updated(&task).await;
        Ok(task)
    }

    pub async fn complete(&self, id: Uuid, result_json: Value) -> Result<AsyncTask, TaskError> {
        let mut task = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
        if task.state.is_terminal() {
            return Err(TaskError::AlreadyTerminal(id));
        }
        let now = Utc::now();
        task.state = TaskState::Completed;
        task.progress_percent = 100;
        task.result_json = Some(result_json);
        task.updated_at = now;
        task.completed_at = Some(now);
        self.store.update(&task).await?;
        self.cancellations.complete(id);
        self.publish_updated(&task).await;
        Ok(task)
    }

    /// Records a failure. If `retry_count < max_retries`, schedules a
    /// retry via [`next_retry_delay`]; otherwise the task becomes
    /// terminally `Failed`.
    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<AsyncTask, TaskError> {
        let mut task = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
        if task.state.is_terminal() {
            return Err(TaskError::AlreadyTerminal(id));
        }
        task.error = Some(error.into());
        task.updated_at = Utc::now();

        if task.retry_count < task.max_retries {
            // Not terminal: the task goes back to `Pending` to await
            // its scheduled retry rather than sitting in `Failed`.
            task.state = TaskState::Pending;
            task.retry_count += 1;
            let delay = next_retry_delay(&self.settings, task.retry_count);
            task.next_retry_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            task.state = TaskState::Failed;
            task.completed_at = Some(task.updated_at);
            task.next_retry_at = None;
            self.cancellations.complete(id);
        }

        self.store.update(&task).await?;
        self.publish_updated(&task).await;
        Ok(task)
    }

    pub async fn sweep_retries(&self) -> Vec<AsyncTask> {
        match self.store.list_due_for_retry(Utc::now()).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "failed to list tasks due for retry");
                Vec::new()
            }
        }
    }

    pub async fn run_cancellation_purge_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.cancellation_grace_period_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cancellations.purge_expired(Duration::from_secs(self.settings.cancellation_grace_period_secs));
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Polls the store until the task reaches a terminal state or
    /// `timeout` elapses (spec.md §4.E `pollUntilCompleted`).
    pub async fn poll_until_completed(&self, id: Uuid, poll_interval: Duration, timeout: Duration) -> Result<AsyncTask, TaskError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.store.get(id).await?.ok_or(TaskError::NotFound(id))?;
            if task.state.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TaskError::TimedOut(id));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn publish_created(&self, task: &AsyncTask) {
        if let Some(events) = &self.events {
            events
                .publish(GatewayEvent::AsyncTaskCreated {
                    task_id: task.id,
                    task_type: task.task_type.clone(),
                    virtual_key_id: task.virtual_key_id.clone(),
                })
                .await;
        }
        info!(task_id = %task.id, task_type = %task.task_type, "async task created");
    }

    async fn publish_updated(&self, task: &AsyncTask) {
        if let Some(events) = &self.events {
            events
                .publish(GatewayEvent::AsyncTaskUpdated {
                    task_id: task.id,
                    state: format!("{:?}", task.state),
                    progress: task.progress_percent,
                    is_completed: task.state.is_terminal(),
                })
                .await;
        }
    }
}

impl From<TaskError> for crate::GatewayError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(id) => crate::GatewayError::NotFound(format!("task {id}")),
            TaskError::Cancelled(_) => crate::GatewayError::Cancelled,
            other => crate::GatewayError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> AsyncTaskEngine<InMemoryTaskStore> {
        AsyncTaskEngine::new(InMemoryTaskStore::new(), TaskEngineSettings::default(), None)
    }

    #[tokio::test]
    async fn create_then_complete_round_trips() {
        let engine = engine();
        let task = engine.create("video.generate", "vkey-1", json!({}), 3).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let completed = engine.complete(task.id, json!({"url": "s3://x"})).await.unwrap();
        assert_eq!(completed.state, TaskState::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_under_max_retries_schedules_retry() {
        let engine = engine();
        let task = engine.create("video.generate", "vkey-1", json!({}), 3).await.unwrap();
        let failed = engine.fail(task.id, "network blip").await.unwrap();
        assert_eq!(failed.state, TaskState::Pending);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn complete_after_terminal_state_is_rejected() {
        let engine = engine();
        let task = engine.create("video.generate", "vkey-1", json!({}), 3).await.unwrap();
        engine.complete(task.id, json!({})).await.unwrap();
        let result = engine.complete(task.id, json!({})).await;
        assert!(matches!(result, Err(TaskError::AlreadyTerminal(_))));
    }

    #[tokio::test]
    async fn fail_past_max_retries_is_terminal() {
        let engine = engine();
        let task = engine.create("video.generate", "vkey-1", json!({}), 0).await.unwrap();
        let failed = engine.fail(task.id, "fatal").await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.state.is_terminal());
        assert!(failed.completed_at.is_some());
        assert!(failed.next_retry_at.is_none());
    }

    #[test]
    fn retry_delay_is_capped_at_max_delay() {
        let settings = TaskEngineSettings {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
            retry_jitter: 0.0,
            cancellation_grace_period_secs: 5,
        };
        let delay = next_retry_delay(&settings, 20);
        assert_eq!(delay.as_secs(), 3600);
    }
}
