#![deny(missing_docs)]
//! Async Task Manager (C9, spec §4.8): queues, tracks, and cancels
//! long-running dispatches and RAG calls. Grounded on the job-table
//! pattern of a `Mutex<HashMap<_, _>>` plus `tokio::spawn` workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use turnflow_core::duration::DurationMs;
use turnflow_core::error::AsyncTaskError;
use turnflow_core::id::{TaskId, UserId};

/// Bound on the number of step events kept per task (spec §4.8
/// "Observability").
pub const DEFAULT_MAX_LOG_EVENTS: usize = 50;

/// State machine states (spec §4.8): `pending -> processing ->
/// (completed | failed | cancelled)`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is currently executing it.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecoverable error, or retries exhausted.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states cannot transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One entry in a task's bounded step-event log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepEvent {
    /// When the step was recorded.
    pub at: DateTime<Utc>,
    /// Human-readable description of the step.
    pub message: String,
}

/// A task as exposed by `status`/`listByOwner`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Registered executor type this task runs under.
    pub task_type: String,
    /// Owning user.
    pub owner: UserId,
    /// Submission payload.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Advisory, monotonically increasing progress in `0..=100`.
    pub progress: u8,
    /// Successful result, once `status == Completed`.
    pub result: Option<serde_json::Value>,
    /// Failure message, once `status == Failed`.
    pub error: Option<String>,
    /// Bounded log of step events, oldest evicted first.
    pub log: Vec<StepEvent>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task record was last updated.
    pub updated_at: DateTime<Utc>,
    /// Time-to-live from `created_at`; a non-terminal task past its TTL
    /// is lazily failed on next read.
    pub ttl: DurationMs,
}

impl Task {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now - self.created_at > chrono::Duration::milliseconds(self.ttl.as_millis() as i64)
    }
}

/// Optional filters for `listByOwner`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks of this registered type.
    pub task_type: Option<String>,
}

/// Executes one registered task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task to completion, returning its result JSON or an error
    /// message.
    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String>;

    /// Per-attempt timeout. Default 30s.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Maximum attempts for this task type (spec §4.8 "retries per task
    /// type policy"). Default 1 (no retry).
    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Tuning knobs for the manager and its worker pool.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Bounded submission queue depth (spec §5 "Backpressure"); overflow
    /// rejects with `Overloaded`.
    pub queue_capacity: usize,
    /// Number of concurrent worker tasks pulling from the queue.
    pub worker_count: usize,
    /// Cap on `Task::log` length.
    pub max_log_events: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self { queue_capacity: 256, worker_count: 4, max_log_events: DEFAULT_MAX_LOG_EVENTS }
    }
}

struct TaskRecord {
    task: Task,
    cancel: Arc<Notify>,
}

/// Queues, tracks, and cancels async tasks (spec §4.8 contract:
/// `submit`/`status`/`cancel`/`listByOwner`).
pub struct AsyncTaskManager {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    sender: mpsc::Sender<TaskId>,
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
    config: TaskManagerConfig,
}

impl AsyncTaskManager {
    /// Build the manager and spawn its worker pool. Returned wrapped in
    /// an `Arc` since workers hold a clone for the lifetime of the pool.
    pub fn spawn(executors: HashMap<String, Arc<dyn TaskExecutor>>, config: TaskManagerConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let manager = Arc::new(Self { tasks: Mutex::new(HashMap::new()), sender, executors, config });
        let receiver = Arc::new(Mutex::new(receiver));
        for _ in 0..manager.config.worker_count.max(1) {
            let manager = Arc::clone(&manager);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { worker_loop(manager, receiver).await });
        }
        manager
    }

    /// Submit a new task. Rejects with `Overloaded` if the queue is full.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        owner: UserId,
        ttl: DurationMs,
    ) -> Result<TaskId, AsyncTaskError> {
        let task_type = task_type.into();
        let id = TaskId::new(uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            task_type,
            owner,
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            log: vec![StepEvent { at: now, message: "submitted".to_string() }],
            created_at: now,
            updated_at: now,
            ttl,
        };

        self.sender.try_send(id.clone()).map_err(|_| AsyncTaskError::Overloaded)?;

        let mut tasks = self.tasks.lock().await;
        tasks.insert(id.clone(), TaskRecord { task, cancel: Arc::new(Notify::new()) });
        Ok(id)
    }

    /// Fetch a task's current state, lazily failing it if its TTL has
    /// elapsed since submission.
    pub async fn status(&self, id: &TaskId) -> Result<Task, AsyncTaskError> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(id).ok_or_else(|| AsyncTaskError::NotFound(id.to_string()))?;
        expire_if_due(record, self.config.max_log_events);
        Ok(record.task.clone())
    }

    /// Request cancellation. Returns `false` if the task was already
    /// terminal (spec §4.8: cancelled is unreachable from a terminal
    /// state).
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, AsyncTaskError> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(id).ok_or_else(|| AsyncTaskError::NotFound(id.to_string()))?;
        expire_if_due(record, self.config.max_log_events);
        if record.task.status.is_terminal() {
            return Ok(false);
        }
        if record.task.status == TaskStatus::Pending {
            transition(record, TaskStatus::Cancelled, None, None, self.config.max_log_events);
        } else {
            record.cancel.notify_one();
        }
        Ok(true)
    }

    /// List an owner's tasks, most recently created first, optionally
    /// filtered by status and/or task type.
    pub async fn list_by_owner(&self, owner: &UserId, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks = self.tasks.lock().await;
        let mut out: Vec<Task> = tasks
            .values_mut()
            .filter(|r| &r.task.owner == owner)
            .map(|r| {
                expire_if_due(r, self.config.max_log_events);
                r.task.clone()
            })
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| filter.task_type.as_deref().map(|ty| ty == t.task_type).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }
}

fn expire_if_due(record: &mut TaskRecord, max_log_events: usize) {
    let now = Utc::now();
    if record.task.is_expired(now) {
        record.task.status = TaskStatus::Failed;
        record.task.error = Some("task exceeded its ttl".to_string());
        record.task.updated_at = now;
        push_log(&mut record.task, "ttl expired".to_string(), max_log_events);
    }
}

fn push_log(task: &mut Task, message: String, cap: usize) {
    task.log.push(StepEvent { at: Utc::now(), message });
    while task.log.len() > cap.max(1) {
        task.log.remove(0);
    }
}

fn transition(
    record: &mut TaskRecord,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    max_log_events: usize,
) {
    record.task.status = status;
    record.task.result = result;
    record.task.error = error;
    record.task.updated_at = Utc::now();
    if status.is_terminal() {
        record.task.progress = if status == TaskStatus::Completed { 100 } else { record.task.progress };
    }
    push_log(&mut record.task, format!("{status:?}").to_lowercase(), max_log_events);
}

async fn worker_loop(manager: Arc<AsyncTaskManager>, receiver: Arc<Mutex<mpsc::Receiver<TaskId>>>) {
    loop {
        let id = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(id) = id else { break };
        process_one(&manager, id).await;
    }
}

async fn process_one(manager: &Arc<AsyncTaskManager>, id: TaskId) {
    let (executor, payload, cancel) = {
        let mut tasks = manager.tasks.lock().await;
        let Some(record) = tasks.get_mut(&id) else { return };
        expire_if_due(record, manager.config.max_log_events);
        if record.task.status != TaskStatus::Pending {
            return;
        }
        let executor = manager.executors.get(&record.task.task_type).cloned();
        let Some(executor) = executor else {
            transition(
                record,
                TaskStatus::Failed,
                None,
                Some(format!("no executor registered for task type '{}'", record.task.task_type)),
                manager.config.max_log_events,
            );
            return;
        };
        record.task.status = TaskStatus::Processing;
        push_log(&mut record.task, "processing started".to_string(), manager.config.max_log_events);
        (executor, record.task.payload.clone(), record.cancel.clone())
    };

    let max_attempts = executor.max_attempts().max(1);
    let mut last_error = None;
    let mut outcome = None;

    for attempt in 1..=max_attempts {
        {
            let mut tasks = manager.tasks.lock().await;
            if let Some(record) = tasks.get_mut(&id) {
                push_log(&mut record.task, format!("attempt {attempt}"), manager.config.max_log_events);
            }
        }

        let run = tokio::time::timeout(executor.timeout(), executor.execute(&payload));
        tokio::select! {
            _ = cancel.notified() => {
                outcome = Some(TaskStatus::Cancelled);
                break;
            }
            result = run => {
                match result {
                    Ok(Ok(value)) => {
                        outcome = Some(TaskStatus::Completed);
                        last_error = None;
                        let mut tasks = manager.tasks.lock().await;
                        if let Some(record) = tasks.get_mut(&id) {
                            transition(record, TaskStatus::Completed, Some(value), None, manager.config.max_log_events);
                        }
                        return;
                    }
                    Ok(Err(message)) => last_error = Some(message),
                    Err(_elapsed) => last_error = Some(format!("timed out after {:?}", executor.timeout())),
                }
            }
        }
    }

    let mut tasks = manager.tasks.lock().await;
    if let Some(record) = tasks.get_mut(&id) {
        match outcome {
            Some(TaskStatus::Cancelled) => {
                transition(record, TaskStatus::Cancelled, None, None, manager.config.max_log_events)
            }
            _ => transition(record, TaskStatus::Failed, None, last_error, manager.config.max_log_events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
            Ok(payload.clone())
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
    }

    struct AlwaysFailsExecutor {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor for AlwaysFailsExecutor {
        async fn execute(&self, _payload: &serde_json::Value) -> Result<serde_json::Value, String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err("downstream unavailable".to_string())
        }

        fn max_attempts(&self) -> u32 {
            3
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute(&self, _payload: &serde_json::Value) -> Result<serde_json::Value, String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::Value::Null)
        }
    }

    fn manager_with(executors: Vec<(&str, Arc<dyn TaskExecutor>)>) -> Arc<AsyncTaskManager> {
        let mut map = HashMap::new();
        for (ty, exec) in executors {
            map.insert(ty.to_string(), exec);
        }
        AsyncTaskManager::spawn(map, TaskManagerConfig { worker_count: 2, ..Default::default() })
    }

    #[tokio::test]
    async fn submit_then_status_completes() {
        let manager = manager_with(vec![("echo", Arc::new(EchoExecutor))]);
        let id = manager
            .submit("echo", serde_json::json!({"x": 1}), UserId::new("u1"), DurationMs::from_millis(60_000))
            .await
            .unwrap();

        let mut task = manager.status(&id).await.unwrap();
        for _ in 0..20 {
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            task = manager.status(&id).await.unwrap();
        }
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn failing_executor_retries_up_to_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(vec![("fail", Arc::new(AlwaysFailsExecutor { attempts: attempts.clone() }))]);
        let id = manager
            .submit("fail", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(60_000))
            .await
            .unwrap();

        let mut task = manager.status(&id).await.unwrap();
        for _ in 0..20 {
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            task = manager.status(&id).await.unwrap();
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_pending_task_is_immediate() {
        let manager = manager_with(vec![("slow", Arc::new(SlowExecutor))]);
        // Occupy both workers so this submission stays pending.
        let occupant_a = manager
            .submit("slow", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(60_000))
            .await
            .unwrap();
        let occupant_b = manager
            .submit("slow", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(60_000))
            .await
            .unwrap();
        let id = manager
            .submit("slow", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(60_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = manager.cancel(&id).await.unwrap();
        assert!(cancelled);
        let task = manager.status(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        manager.cancel(&occupant_a).await.ok();
        manager.cancel(&occupant_b).await.ok();
    }

    #[tokio::test]
    async fn overloaded_queue_rejects_submission() {
        let manager_raw = AsyncTaskManager {
            tasks: Mutex::new(HashMap::new()),
            sender: {
                let (tx, _rx) = mpsc::channel(1);
                tx
            },
            executors: HashMap::new(),
            config: TaskManagerConfig::default(),
        };
        let first = manager_raw
            .submit("echo", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(1_000))
            .await;
        assert!(first.is_ok());
        let second = manager_raw
            .submit("echo", serde_json::json!({}), UserId::new("u1"), DurationMs::from_millis(1_000))
            .await;
        assert!(matches!(second, Err(AsyncTaskError::Overloaded)));
    }

    #[tokio::test]
    async fn list_by_owner_filters_by_status_and_type() {
        let manager = manager_with(vec![("echo", Arc::new(EchoExecutor))]);
        let owner = UserId::new("u1");
        let id = manager.submit("echo", serde_json::json!({}), owner.clone(), DurationMs::from_millis(60_000)).await.unwrap();

        let mut filter = TaskFilter::default();
        filter.task_type = Some("echo".to_string());
        let listed = manager.list_by_owner(&owner, &filter).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        let other_owner = UserId::new("u2");
        let listed_other = manager.list_by_owner(&other_owner, &TaskFilter::default()).await;
        assert!(listed_other.is_empty());
    }
}
