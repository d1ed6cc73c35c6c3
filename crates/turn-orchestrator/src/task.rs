//! Wires `function-dispatcher` into the async task manager for calls
//! that exceed the synchronous dispatch threshold (spec §4.7
//! "Long-running calls").

use async_task_manager::TaskExecutor;
use async_trait::async_trait;
use function_dispatcher::FunctionDispatcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use turnflow_core::config::FunctionDef;
use turnflow_core::id::{SessionId, SlotName, TurnNumber};

/// Task type registered with the async task manager for dispatched
/// function calls.
pub const TASK_TYPE: &str = "function_dispatch";

/// Default per-attempt timeout budget handed to the task executor;
/// `FunctionDispatcher::dispatch` already bounds itself, this is the
/// outer ceiling the task manager enforces over the whole attempt loop.
const EXECUTOR_TIMEOUT: Duration = Duration::from_secs(120);

/// Inputs for one async dispatch, serialized into a task's payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatchPayload {
    /// The function to call.
    pub function: FunctionDef,
    /// Normalized slot values mapped into the request body.
    pub slots: HashMap<SlotName, serde_json::Value>,
    /// Owning session, for idempotency key derivation.
    pub session: SessionId,
    /// Turn that triggered this dispatch.
    pub turn: TurnNumber,
}

/// The task's result, mirroring `function_dispatcher::DispatchResult`
/// minus the non-`Serialize` timing type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatchTaskResult {
    /// Whether the call ultimately succeeded.
    pub ok: bool,
    /// The rendered success or error template.
    pub rendered: String,
    /// The parsed response body, on success.
    pub data: Option<serde_json::Value>,
    /// The last error message, on failure.
    pub error: Option<String>,
}

impl From<function_dispatcher::DispatchResult> for DispatchTaskResult {
    fn from(r: function_dispatcher::DispatchResult) -> Self {
        Self { ok: r.ok, rendered: r.rendered, data: r.data, error: r.error }
    }
}

/// Runs one `DispatchPayload` through the dispatcher; retries already
/// happen inside `dispatch`, so this executor never retries at its own
/// layer (`max_attempts() == 1`).
pub struct DispatchTaskExecutor {
    dispatcher: Arc<FunctionDispatcher>,
}

impl DispatchTaskExecutor {
    /// Build an executor over a shared dispatcher.
    pub fn new(dispatcher: Arc<FunctionDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl TaskExecutor for DispatchTaskExecutor {
    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
        let input: DispatchPayload = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
        let result = self.dispatcher.dispatch(&input.function, &input.slots, &input.session, input.turn).await;
        serde_json::to_value(DispatchTaskResult::from(result)).map_err(|e| e.to_string())
    }

    fn timeout(&self) -> Duration {
        EXECUTOR_TIMEOUT
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Build the executor table handed to `AsyncTaskManager::spawn`.
pub fn executors(dispatcher: Arc<FunctionDispatcher>) -> HashMap<String, Arc<dyn TaskExecutor>> {
    let mut map: HashMap<String, Arc<dyn TaskExecutor>> = HashMap::new();
    map.insert(TASK_TYPE.to_string(), Arc::new(DispatchTaskExecutor::new(dispatcher)));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::config::HttpMethod;

    fn function(url: String) -> FunctionDef {
        FunctionDef {
            name: "book_flight".to_string(),
            url,
            method: HttpMethod::Post,
            headers: HashMap::new(),
            parameter_mapping: HashMap::new(),
            timeout_ms: 2_000,
            retry_count: 1,
            success_template: "ok".to_string(),
            error_template: "fail".to_string(),
            asynchronous: true,
            expected_duration_ms: None,
        }
    }

    #[tokio::test]
    async fn executor_rejects_malformed_payload() {
        let executor = DispatchTaskExecutor::new(Arc::new(FunctionDispatcher::new()));
        let err = executor.execute(&serde_json::json!({"not": "a payload"})).await.unwrap_err();
        assert!(!err.is_empty());
    }

    #[tokio::test]
    async fn executor_runs_dispatch_against_unreachable_url() {
        let executor = DispatchTaskExecutor::new(Arc::new(FunctionDispatcher::new()));
        let payload = DispatchPayload {
            function: function("http://127.0.0.1:1/book".to_string()),
            slots: HashMap::new(),
            session: SessionId::new("s1"),
            turn: TurnNumber(1),
        };
        let out = executor.execute(&serde_json::to_value(&payload).unwrap()).await.unwrap();
        let result: DispatchTaskResult = serde_json::from_value(out).unwrap();
        assert!(!result.ok);
    }
}
