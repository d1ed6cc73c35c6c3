#![deny(missing_docs)]
//! Function Dispatcher (C7, spec §4.7): maps an intent's slots to an
//! HTTP call, executes it with per-attempt timeout and retry, attaches
//! an idempotency key, and renders the success/error response template.

mod backoff;
mod classify;
mod idempotency;
mod template;

use std::collections::HashMap;
use std::time::{Duration, Instant};
use turnflow_core::config::{FunctionDef, HttpMethod};
use turnflow_core::duration::DurationMs;
use turnflow_core::id::{SessionId, SlotName, TurnNumber};

pub use idempotency::derive as idempotency_key;

/// Default maximum retry attempts when a function definition does not
/// override `retry_count` (spec §4.7, R).
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// The outcome of one dispatch (spec §4.7 contract).
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Whether the call ultimately succeeded.
    pub ok: bool,
    /// The parsed response body, on success.
    pub data: Option<serde_json::Value>,
    /// The rendered success or error template.
    pub rendered: String,
    /// The last error message, on failure.
    pub error: Option<String>,
    /// Total wall-clock time spent across all attempts.
    pub elapsed: DurationMs,
    /// Number of attempts made.
    pub attempts: u32,
    /// The idempotency key attached to every attempt.
    pub idempotency_key: String,
}

/// Executes function dispatches over HTTP.
pub struct FunctionDispatcher {
    http: reqwest::Client,
}

impl FunctionDispatcher {
    /// Build a dispatcher with a fresh `reqwest::Client`.
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Build a dispatcher over a caller-supplied client (tests inject one
    /// pointed at a `wiremock` server).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Dispatch `function` with `slots` mapped into its request body.
    pub async fn dispatch(
        &self,
        function: &FunctionDef,
        slots: &HashMap<SlotName, serde_json::Value>,
        session: &SessionId,
        turn: TurnNumber,
    ) -> DispatchResult {
        let body = build_body(function, slots);
        let key = idempotency::derive(session, turn, &function.name, &body);
        let retry_count = function.retry_count.max(1);
        let started = Instant::now();

        let mut last_error = None;
        let mut last_attempt = 0;
        for attempt in 1..=retry_count {
            last_attempt = attempt;
            match self.attempt(function, &body, &key).await {
                Ok(response_json) => {
                    let mut context = response_json.clone();
                    if let serde_json::Value::Object(ref mut map) = context {
                        map.insert("elapsed_ms".to_string(), serde_json::json!(started.elapsed().as_millis()));
                    }
                    let rendered = template::render(&function.success_template, &context);
                    return DispatchResult {
                        ok: true,
                        data: Some(response_json),
                        rendered,
                        error: None,
                        elapsed: started.elapsed().into(),
                        attempts: attempt,
                        idempotency_key: key,
                    };
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_error = Some(err.to_string());
                    if !retryable || attempt == retry_count {
                        break;
                    }
                    tokio::time::sleep(backoff::delay(
                        attempt,
                        Duration::from_millis(200),
                        Duration::from_secs(10),
                    ))
                    .await;
                }
            }
        }

        let error_message = last_error.unwrap_or_else(|| "dispatch failed".to_string());
        let attempts = last_attempt;
        let context = serde_json::json!({ "error_message": error_message, "attempts": attempts });
        let rendered = template::render(&function.error_template, &context);
        DispatchResult {
            ok: false,
            data: None,
            rendered,
            error: Some(error_message),
            elapsed: started.elapsed().into(),
            attempts,
            idempotency_key: key,
        }
    }

    async fn attempt(
        &self,
        function: &FunctionDef,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<serde_json::Value, turnflow_core::error::DispatchError> {
        use turnflow_core::error::DispatchError;

        let method = match function.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.http.request(method, &function.url).header("Idempotency-Key", idempotency_key);
        for (name, value) in &function.headers {
            request = request.header(name, resolve_placeholder(value));
        }
        if !matches!(function.method, HttpMethod::Get) {
            request = request.json(body);
        }

        let timeout = Duration::from_millis(function.timeout_ms);
        let sent = tokio::time::timeout(timeout, request.send()).await;

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify::classify_reqwest_error(&e)),
            Err(_elapsed) => return Err(DispatchError::Transient(format!("timed out after {timeout:?}"))),
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            serde_json::from_str(&text)
                .map_err(|e| DispatchError::Permanent(format!("response body is not valid JSON: {e}")))
        } else {
            Err(classify::classify_status(status, &text))
        }
    }
}

impl Default for FunctionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_placeholder(value: &str) -> String {
    if let Some(var) = value.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

fn build_body(function: &FunctionDef, slots: &HashMap<SlotName, serde_json::Value>) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    for (slot_name, field_path) in &function.parameter_mapping {
        if let Some(value) = slots.get(slot_name) {
            set_path(&mut body, field_path, value.clone());
        }
    }
    serde_json::Value::Object(body)
}

fn set_path(map: &mut serde_json::Map<String, serde_json::Value>, path: &str, value: serde_json::Value) {
    let mut segments = path.split('.').peekable();
    let mut current = map;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        current = current
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
            .as_object_mut()
            .expect("intermediate path segment is not an object");
    }
}
