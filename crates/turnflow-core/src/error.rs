//! Per-protocol error types. One enum per component boundary, matching
//! the shape each boundary actually fails in — callers match on the
//! variant that applies to them, not a single catch-all error.

use thiserror::Error;

/// Errors from the cache layer (C2).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CacheError {
    /// The configured backend is unreachable. Callers should bypass the
    /// cache and read/write the source of truth directly (spec §4 failure
    /// semantics: "Cache unavailable").
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A `getOrCompute` builder failed; the single-flight group is
    /// released and the error is returned to every waiter.
    #[error("cache builder failed: {0}")]
    BuildFailed(String),

    /// Serialization/deserialization of a cached value failed.
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// Errors from the session & slot store (C3).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A write violated an invariant (e.g. a non-contiguous turn number).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The underlying persistent backend failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A cache-aside read/write through the cache layer failed in a way
    /// that could not be masked by falling back to the source of truth.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Errors from config loading/validation (C1).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config source could not be reached.
    #[error("config source unavailable: {0}")]
    SourceUnavailable(String),

    /// An intent failed validation at load time (spec §4.3): missing
    /// required fields, a validation-rule shape mismatch, a cyclic slot
    /// dependency graph, a dangling template reference, or a regex that
    /// does not compile. The intent named here is marked inactive.
    #[error("intent '{intent}' failed validation: {reason}")]
    InvalidIntent {
        /// The intent that failed to validate.
        intent: String,
        /// Why it failed.
        reason: String,
    },

    /// A lookup was made for a name that is not configured (or not
    /// active).
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors from the LLM capability boundary. Used by both the intent
/// classifier's model call and the slot extractor's structured-JSON call.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LlmError {
    /// The call did not return within its deadline.
    #[error("llm call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Network/transport failure reaching the model endpoint.
    #[error("llm transport error: {0}")]
    Transport(String),

    /// The endpoint rejected the request (bad prompt, auth, etc.) in a
    /// way retrying will not fix.
    #[error("llm request rejected: {0}")]
    Rejected(String),

    /// The response did not match the requested schema (defensive parse
    /// failure in the slot extractor).
    #[error("llm response failed schema validation: {0}")]
    SchemaMismatch(String),
}

impl LlmError {
    /// Whether the caller should treat this as recoverable by degrading
    /// (lexical-only classification, prior slot values) rather than
    /// failing the turn. Per spec §4.3/§4.4, every `LlmError` is
    /// recoverable — the LLM boundary never aborts a turn outright.
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Errors from the arbiter (C6). The arbiter is a pure function; this
/// exists only for genuinely malformed input (e.g. an empty candidate list
/// reaching a code path that assumed at least one candidate), never for
/// business outcomes like "no intent matched" — those are `Decision`
/// variants, not errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// The arbiter was asked to decide without the inputs it needs.
    #[error("malformed arbiter input: {0}")]
    MalformedInput(String),
}

/// Errors from the function dispatcher (C7).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connect error, 5xx, 429, or timeout — retryable per policy.
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// 4xx other than 408/429, or a template render failure — not
    /// retried.
    #[error("permanent dispatch failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    /// Whether this failure should be retried by the dispatcher's backoff
    /// policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

/// Errors from the async task manager (C9).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AsyncTaskError {
    /// No task with this id is known.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task is in a terminal state and cannot be transitioned.
    #[error("task {task} is already terminal ({status})")]
    AlreadyTerminal {
        /// The task id.
        task: String,
        /// Its current (terminal) status.
        status: String,
    },

    /// The submission queue is full.
    #[error("async task queue overloaded")]
    Overloaded,
}

/// Top-level errors that are allowed to escape the turn orchestrator to
/// the transport layer (spec §7: only these three ever do).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Empty or oversize input (spec §6: input must be 1..=1000 chars).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The session's per-turn queue (depth Q) is full.
    #[error("session busy, retry later")]
    SessionBusy,

    /// The session id was supplied but no session exists for it and no
    /// id-less fallback applies.
    #[error("session expired or unknown: {0}")]
    SessionExpired(String),

    /// Classifier, extractor, dispatcher, and RAG all failed for this
    /// turn.
    #[error("all upstream dependencies unavailable")]
    UpstreamUnavailable,

    /// Unexpected internal failure. Always carries a trace id so it can
    /// be correlated with logs.
    #[error("internal error (trace_id={trace_id}): {message}")]
    Internal {
        /// Message for operators; never shown verbatim to end users.
        message: String,
        /// Trace id returned to the caller for correlation.
        trace_id: String,
    },

    /// A turn's dispatch already executed its side effect and produced a
    /// result, but the subsequent persistence write failed. The result is
    /// recorded in a compensation log (spec §7 "Persistence write failure
    /// after dispatch") rather than silently discarded; it is surfaced here
    /// alongside the error so the caller can still report it.
    #[error("turn persistence failed after dispatch succeeded (trace_id={trace_id}): {message}")]
    PersistenceFailedAfterDispatch {
        /// Message for operators; never shown verbatim to end users.
        message: String,
        /// Trace id returned to the caller for correlation.
        trace_id: String,
        /// The dispatch result that was preserved in the compensation log.
        api_result: serde_json::Value,
    },
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Internal {
            message: e.to_string(),
            trace_id: "n/a".to_string(),
        }
    }
}
