//! Session-time data model (spec §3): sessions, conversation turns, slot
//! values, and the records the arbiter writes when it disambiguates or
//! transfers.

use crate::id::{IntentName, SessionId, SlotName, TurnNumber, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A conversation session (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id.
    pub id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// The intent currently being filled, if any.
    pub current_intent: Option<IntentName>,
    /// Lifecycle state.
    pub state: SessionState,
    /// Free-form context map (device info, location, request metadata,
    /// and anything a prior turn chose to carry forward).
    #[serde(default)]
    pub context: serde_json::Value,
    /// When this session expires absent further activity.
    pub expires_at: DateTime<Utc>,
    /// How many conversation turns have been recorded for this session.
    /// Invariant: recorded turn numbers are exactly `1..=turn_count`.
    pub turn_count: u64,
}

/// Lifecycle states a session can be in (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Normal, in-progress conversation.
    Active,
    /// Explicitly suspended (e.g. a postponed intent), resumable.
    Paused,
    /// Reached a terminal, successful state.
    Completed,
    /// TTL elapsed with no terminating action.
    Expired,
    /// Terminated by an unrecoverable error.
    Error,
}

impl Session {
    /// Start a new, active session for a user.
    pub fn new(id: SessionId, user_id: UserId, expires_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            current_intent: None,
            state: SessionState::Active,
            context: serde_json::Value::Null,
            expires_at,
            turn_count: 0,
        }
    }

    /// Whether `now` is past this session's expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One append-only conversation turn record (spec §3 "Conversation Turn").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Owning session.
    pub session_id: SessionId,
    /// 1-based, gapless turn number within the session.
    pub turn_number: TurnNumber,
    /// The raw user input for this turn.
    pub input_text: String,
    /// The intent recognized for this turn, if any.
    pub intent: Option<IntentName>,
    /// Classifier confidence for `intent`.
    pub confidence: f64,
    /// The system's user-facing response text.
    pub response_text: String,
    /// Machine-readable response type (spec §6).
    pub response_type: ResponseType,
    /// Machine-readable status (spec §6).
    pub status: TurnStatus,
    /// Wall-clock time spent processing this turn.
    pub processing_latency: crate::duration::DurationMs,
    /// Set when this turn ended in an internal error despite best-effort
    /// recovery (spec §4.1 "Persistence ordering").
    pub error: Option<String>,
    /// When this record was written.
    pub created_at: DateTime<Utc>,
}

/// Status enum (spec §6).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The intent's function was dispatched and succeeded.
    Completed,
    /// Required slots are still missing.
    Incomplete,
    /// Two or more candidate intents are near-equally likely.
    Ambiguous,
    /// The dispatched function failed permanently (or retries exhausted).
    ApiError,
    /// A slot value failed validation.
    ValidationError,
    /// Handed off to the RAG/knowledge-base fallback.
    RagflowHandled,
    /// An interrupting intent was handled and control returned.
    InterruptionHandled,
    /// Multiple intents are being processed for this input.
    MultiIntentProcessing,
    /// The user explicitly cancelled the in-progress intent.
    IntentCancelled,
    /// The user postponed the in-progress intent (paused, resumable).
    IntentPostponed,
    /// A prior suggestion/disambiguation candidate was rejected.
    SuggestionRejected,
    /// The session's current intent changed mid-conversation.
    IntentTransfer,
    /// A slot prompt was emitted.
    SlotFilling,
    /// Context from a prior intent was preserved across a small-talk
    /// detour.
    ContextMaintained,
    /// The dispatched function was handed to the async task manager
    /// instead of called synchronously; its outcome is reported on a
    /// later turn (spec §4.7 "Long-running calls").
    TaskSubmitted,
}

/// Response type enum (spec §6).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Rendered from a successful (or failed) function call.
    ApiResult,
    /// An async task's completion being reported back.
    TaskCompletion,
    /// A prompt for a missing/invalid slot.
    SlotPrompt,
    /// A disambiguation prompt with candidate intents.
    Disambiguation,
    /// A RAG/knowledge-base answer.
    QaResponse,
    /// Small talk handled while preserving a prior active intent.
    SmallTalkWithContextReturn,
    /// An intent transfer completed in the same turn.
    IntentTransferWithCompletion,
    /// Confirmation that an intent was cancelled.
    CancellationConfirmation,
    /// Confirmation that an intent was postponed with context saved.
    PostponementWithSave,
    /// Acknowledgement that a suggestion was rejected.
    RejectionAcknowledgment,
    /// A validation error prompt.
    ValidationErrorPrompt,
    /// An error response offering alternative next steps.
    ErrorWithAlternatives,
    /// Multiple intents processed, with a continuation prompt.
    MultiIntentWithContinuation,
    /// A request was rejected for security reasons upstream of the core.
    SecurityError,
}

/// Extraction method recorded alongside a slot value (spec §3).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Matched by a configured regex rule.
    Regex,
    /// Matched by a configured keyword rule.
    Keyword,
    /// Resolved via an entity dictionary lookup.
    EntityDictionary,
    /// Produced by the LLM's structured JSON output.
    Llm,
    /// Carried forward unchanged from a prior turn.
    Carried,
    /// Supplied from the slot's configured default.
    Default,
}

/// Validation status of a slot value (spec §3).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Passed all validation rules and satisfied dependencies.
    Valid,
    /// Failed a validation rule.
    Invalid,
    /// Awaiting a dependency that is not yet valid.
    Pending,
    /// User corrected a previously invalid value.
    Corrected,
}

/// A slot value, keyed by (conversation turn, slot) (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotValue {
    /// The session this value belongs to.
    pub session_id: SessionId,
    /// The turn that produced this value.
    pub turn_number: TurnNumber,
    /// The slot this value fills.
    pub slot_name: SlotName,
    /// The exact substring (or LLM-supplied span) the value came from.
    pub original_text: String,
    /// The raw extracted value before normalization.
    pub extracted: serde_json::Value,
    /// The normalized, typed value.
    pub normalized: serde_json::Value,
    /// Extraction confidence in `[0,1]`.
    pub confidence: f64,
    /// How this value was produced.
    pub method: ExtractionMethod,
    /// Current validation status.
    pub status: ValidationStatus,
    /// Any validation error messages (empty when `status == Valid`).
    #[serde(default)]
    pub errors: Vec<String>,
    /// Whether the user has explicitly confirmed this value.
    #[serde(default)]
    pub confirmed: bool,
}

/// A snapshot of a session's effective slot map: for each slot, the most
/// recent turn's value whose status is `Valid` or `Corrected` (spec §3
/// "effective value" invariant).
pub type EffectiveSlots = HashMap<SlotName, SlotValue>;

/// Compute the effective slot map from an ordered (ascending turn number)
/// history of slot values. Later turns win; a slot absent from every turn
/// is simply absent from the result.
pub fn effective_slots<'a>(history: impl Iterator<Item = &'a SlotValue>) -> EffectiveSlots {
    let mut effective: EffectiveSlots = HashMap::new();
    for value in history {
        if matches!(value.status, ValidationStatus::Valid | ValidationStatus::Corrected) {
            effective.insert(value.slot_name.clone(), value.clone());
        }
    }
    effective
}

/// Created when the arbiter asks the user to disambiguate between
/// candidates (spec §3 "Intent Ambiguity Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentAmbiguityRecord {
    /// The session this ambiguity belongs to.
    pub session_id: SessionId,
    /// The turn that raised the ambiguity.
    pub turn_number: TurnNumber,
    /// Candidate intents, highest confidence first.
    pub candidates: Vec<(IntentName, f64)>,
    /// Set once the next turn resolves it, either way.
    pub resolved: bool,
}

/// Written when the session's current intent changes mid-conversation
/// (spec §3 "Intent Transfer Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentTransferRecord {
    /// The session this transfer belongs to.
    pub session_id: SessionId,
    /// The turn at which the transfer happened.
    pub turn_number: TurnNumber,
    /// The intent transferred away from, if any.
    pub from: Option<IntentName>,
    /// The intent transferred to.
    pub to: IntentName,
    /// Why the transfer happened (e.g. "higher-confidence classification").
    pub reason: String,
    /// A snapshot of `from`'s effective slots at the moment of transfer,
    /// kept for an optional resume.
    pub saved_context: serde_json::Value,
    /// The confidence that triggered the transfer.
    pub confidence: f64,
    /// Whether the transfer completed cleanly.
    pub success: bool,
}

/// Written when a persistence write fails after a dispatch already
/// executed its side effect, so the already-produced result is not
/// silently lost (spec §7 "Persistence write failure after dispatch").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationLogRecord {
    /// The session this record belongs to.
    pub session_id: SessionId,
    /// The turn whose persistence write failed.
    pub turn_number: TurnNumber,
    /// The dispatch result that would otherwise have been lost.
    pub api_result: serde_json::Value,
    /// The store error that triggered this record.
    pub store_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(slot: &str, turn: u64, status: ValidationStatus) -> SlotValue {
        SlotValue {
            session_id: SessionId::new("s1"),
            turn_number: TurnNumber(turn),
            slot_name: SlotName::new(slot),
            original_text: "x".into(),
            extracted: serde_json::Value::String("x".into()),
            normalized: serde_json::Value::String("x".into()),
            confidence: 0.9,
            method: ExtractionMethod::Regex,
            status,
            errors: vec![],
            confirmed: false,
        }
    }

    #[test]
    fn effective_slots_takes_latest_valid_value() {
        let history = vec![
            value("city", 1, ValidationStatus::Valid),
            value("city", 2, ValidationStatus::Invalid),
            value("city", 3, ValidationStatus::Corrected),
        ];
        let effective = effective_slots(history.iter());
        assert_eq!(effective["city"].turn_number, TurnNumber(3));
    }

    #[test]
    fn effective_slots_ignores_invalid_only_history() {
        let history = vec![value("city", 1, ValidationStatus::Invalid)];
        let effective = effective_slots(history.iter());
        assert!(!effective.contains_key(&SlotName::new("city")));
    }
}
