//! The external turn request/response contract (spec §6). Transport
//! (HTTP routes, auth) is an external collaborator; these types are the
//! `data` payload it wraps.

use crate::duration::DurationMs;
use crate::id::{IntentName, RequestId, SessionId, SlotName};
use crate::session::{ResponseType, TurnStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One inbound turn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Owning user.
    pub user_id: String,
    /// Raw utterance, 1..=1000 chars.
    pub input: String,
    /// Existing session to continue, or `None` to mint a new one.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Free-form passthrough context merged into the session's context map.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Maximum accepted length of `TurnRequest::input`, in characters.
pub const MAX_INPUT_CHARS: usize = 1000;

impl TurnRequest {
    /// Validate the request shape (spec §6, §8 boundary behaviors).
    /// Business-level errors (session, classifier, dispatch) are not
    /// checked here — only the `InvalidInput` boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.input.is_empty() {
            return Err("input must not be empty".to_string());
        }
        if self.input.chars().count() > MAX_INPUT_CHARS {
            return Err(format!("input exceeds {MAX_INPUT_CHARS} characters"));
        }
        Ok(())
    }
}

/// A reported slot value, as surfaced in `TurnResponseData::slots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotReport {
    /// The substring or LLM span the value came from.
    pub original: String,
    /// Raw extracted value.
    pub extracted: serde_json::Value,
    /// Normalized, typed value.
    pub normalized: serde_json::Value,
    /// Extraction confidence.
    pub confidence: f64,
    /// How the value was produced (serialized as its `Display`-ish tag).
    pub method: String,
    /// Validation status tag.
    pub validation: String,
}

/// One disambiguation candidate (spec §6 `candidate_intents`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateIntent {
    /// Candidate intent name.
    pub intent: IntentName,
    /// Classifier confidence.
    pub confidence: f64,
    /// Human-facing name.
    pub display_name: String,
}

/// The `data` object of a turn response (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponseData {
    /// User-visible reply text.
    pub response: String,
    /// The session this turn belongs to (minted if the request had none).
    pub session_id: SessionId,
    /// 1-based turn number within the session.
    pub conversation_turn: u64,
    /// Recognized intent, if any.
    pub intent: Option<IntentName>,
    /// Classifier confidence for `intent`.
    pub confidence: f64,
    /// Slot reports keyed by slot name.
    pub slots: HashMap<SlotName, SlotReport>,
    /// Machine-readable status.
    pub status: TurnStatus,
    /// Machine-readable response type.
    pub response_type: ResponseType,
    /// Present when `status == Incomplete`: required slots still missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_slots: Vec<SlotName>,
    /// Present when `status == Ambiguous`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_intents: Vec<CandidateIntent>,
    /// Present when `response_type == ApiResult`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_result: Option<serde_json::Value>,
    /// Free-form session metadata echoed back (e.g. remaining TTL).
    #[serde(default)]
    pub session_metadata: serde_json::Value,
    /// Wall-clock time spent processing this turn.
    pub processing_time_ms: DurationMs,
}

/// The outer response envelope (spec §6): `{ success, code, message, data,
/// timestamp, request_id }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponseEnvelope {
    /// Whether this is a business success (HTTP 200 either way for
    /// recognized business outcomes; see spec §7 propagation policy).
    pub success: bool,
    /// Stable string code (e.g. `"ok"`, `"session_busy"`).
    pub code: String,
    /// Human-facing summary message.
    pub message: String,
    /// The turn payload, absent on transport-level failures.
    pub data: Option<TurnResponseData>,
    /// Server timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Correlates this response with server-side traces/logs.
    pub request_id: RequestId,
}

impl TurnResponseEnvelope {
    /// Wrap a successful turn result.
    pub fn ok(data: TurnResponseData, request_id: RequestId) -> Self {
        Self {
            success: true,
            code: "ok".to_string(),
            message: "ok".to_string(),
            data: Some(data),
            timestamp: chrono::Utc::now(),
            request_id,
        }
    }
}
