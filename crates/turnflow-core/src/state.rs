//! The session & slot store capability (C3, spec §3/§8): persistence for
//! sessions, conversation turns, slot values, and the arbiter's
//! ambiguity/transfer records.

use crate::error::StoreError;
use crate::id::{SessionId, TurnNumber};
use crate::session::{
    CompensationLogRecord, ConversationTurn, IntentAmbiguityRecord, IntentTransferRecord, Session,
    SlotValue,
};
use async_trait::async_trait;

/// Durable storage for conversation state. A single implementation is
/// expected to back both reads and writes consistently; cache-aside
/// layering (if any) lives inside the implementation, not in this trait.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session by id.
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Insert or replace a session record.
    async fn put_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Append one conversation turn. Returns `InvariantViolation` if
    /// `turn.turn_number` is not exactly the session's `turn_count + 1`
    /// (spec §3, §8 gapless-numbering invariant).
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError>;

    /// Fetch recorded turns for a session, ascending by turn number.
    async fn list_turns(&self, session: &SessionId) -> Result<Vec<ConversationTurn>, StoreError>;

    /// Record a slot value for a given turn.
    async fn put_slot_value(&self, value: &SlotValue) -> Result<(), StoreError>;

    /// Fetch the slot-value history for a session, ascending by turn
    /// number, suitable for `session::effective_slots`.
    async fn list_slot_values(&self, session: &SessionId) -> Result<Vec<SlotValue>, StoreError>;

    /// Record an intent ambiguity raised at `turn`.
    async fn put_ambiguity(&self, record: &IntentAmbiguityRecord) -> Result<(), StoreError>;

    /// Fetch the most recent unresolved ambiguity for a session, if any.
    async fn latest_unresolved_ambiguity(
        &self,
        session: &SessionId,
    ) -> Result<Option<IntentAmbiguityRecord>, StoreError>;

    /// Mark the ambiguity raised at `turn` as resolved.
    async fn resolve_ambiguity(
        &self,
        session: &SessionId,
        turn: TurnNumber,
    ) -> Result<(), StoreError>;

    /// Record an intent transfer.
    async fn put_transfer(&self, record: &IntentTransferRecord) -> Result<(), StoreError>;

    /// Delete a session and all of its turns/slot values/records. Used
    /// when a session expires and is reaped (spec §8 TTL sweep).
    async fn delete_session(&self, session: &SessionId) -> Result<(), StoreError>;

    /// Record a compensation-log entry for a dispatch result that could not
    /// be persisted alongside its turn.
    async fn put_compensation_log(&self, record: &CompensationLogRecord) -> Result<(), StoreError>;
}
