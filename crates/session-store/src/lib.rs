#![deny(missing_docs)]
//! In-process implementation of [`turnflow_core::SessionStore`].
//!
//! Backed by a `HashMap` behind a `RwLock`, one record per session
//! holding its turns, slot values, ambiguity records, and transfer
//! records together so a whole session can be dropped atomically on
//! expiry (spec §8 TTL sweep). Not persisted across restarts — the SQL
//! schema that would back a durable deployment is an external
//! collaborator (spec §1).

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use turnflow_core::error::StoreError;
use turnflow_core::id::{SessionId, TurnNumber};
use turnflow_core::session::{
    CompensationLogRecord, ConversationTurn, IntentAmbiguityRecord, IntentTransferRecord, Session,
    SlotValue,
};
use turnflow_core::state::SessionStore;

#[derive(Default)]
struct SessionRecord {
    session: Option<Session>,
    turns: Vec<ConversationTurn>,
    slot_values: Vec<SlotValue>,
    ambiguities: Vec<IntentAmbiguityRecord>,
    transfers: Vec<IntentTransferRecord>,
    compensation_log: Vec<CompensationLogRecord>,
}

/// In-process session store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).and_then(|r| r.session.clone()))
    }

    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.entry(session.id.clone()).or_default();
        record.session = Some(session.clone());
        Ok(())
    }

    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.entry(turn.session_id.clone()).or_default();
        let expected = TurnNumber(record.turns.len() as u64 + 1);
        if turn.turn_number != expected {
            return Err(StoreError::InvariantViolation(format!(
                "session {} expected turn {expected} but got {}",
                turn.session_id, turn.turn_number
            )));
        }
        record.turns.push(turn.clone());
        if let Some(session) = record.session.as_mut() {
            session.turn_count = record.turns.len() as u64;
        }
        Ok(())
    }

    async fn list_turns(&self, session: &SessionId) -> Result<Vec<ConversationTurn>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session).map(|r| r.turns.clone()).unwrap_or_default())
    }

    async fn put_slot_value(&self, value: &SlotValue) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.entry(value.session_id.clone()).or_default();
        record.slot_values.push(value.clone());
        Ok(())
    }

    async fn list_slot_values(&self, session: &SessionId) -> Result<Vec<SlotValue>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session).map(|r| r.slot_values.clone()).unwrap_or_default())
    }

    async fn put_ambiguity(&self, record: &IntentAmbiguityRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(record.session_id.clone()).or_default();
        entry.ambiguities.push(record.clone());
        Ok(())
    }

    async fn latest_unresolved_ambiguity(
        &self,
        session: &SessionId,
    ) -> Result<Option<IntentAmbiguityRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session)
            .and_then(|r| r.ambiguities.iter().rev().find(|a| !a.resolved).cloned()))
    }

    async fn resolve_ambiguity(
        &self,
        session: &SessionId,
        turn: TurnNumber,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::SessionNotFound(session.to_string()))?;
        for ambiguity in record.ambiguities.iter_mut() {
            if ambiguity.turn_number == turn {
                ambiguity.resolved = true;
            }
        }
        Ok(())
    }

    async fn put_transfer(&self, record: &IntentTransferRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(record.session_id.clone()).or_default();
        entry.transfers.push(record.clone());
        Ok(())
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session);
        Ok(())
    }

    async fn put_compensation_log(&self, record: &CompensationLogRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(record.session_id.clone()).or_default();
        entry.compensation_log.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::duration::DurationMs;
    use turnflow_core::id::UserId;
    use turnflow_core::session::{ResponseType, SessionState, TurnStatus};

    fn turn(session: &SessionId, n: u64) -> ConversationTurn {
        ConversationTurn {
            session_id: session.clone(),
            turn_number: TurnNumber(n),
            input_text: "hi".into(),
            intent: None,
            confidence: 0.0,
            response_text: "hello".into(),
            response_type: ResponseType::QaResponse,
            status: TurnStatus::RagflowHandled,
            processing_latency: DurationMs::from_millis(5),
            error: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_turn_enforces_gapless_numbering() {
        let store = MemorySessionStore::new();
        let session = SessionId::new("s1");
        store.append_turn(&turn(&session, 1)).await.unwrap();
        let err = store.append_turn(&turn(&session, 3)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn put_session_then_get_round_trips() {
        let store = MemorySessionStore::new();
        let session = Session::new(
            SessionId::new("s1"),
            UserId::new("u1"),
            chrono::Utc::now() + chrono::Duration::hours(1),
        );
        store.put_session(&session).await.unwrap();
        let fetched = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, SessionState::Active);
    }

    #[tokio::test]
    async fn resolve_ambiguity_only_marks_matching_turn() {
        let store = MemorySessionStore::new();
        let session = SessionId::new("s1");
        store
            .put_ambiguity(&IntentAmbiguityRecord {
                session_id: session.clone(),
                turn_number: TurnNumber(1),
                candidates: vec![],
                resolved: false,
            })
            .await
            .unwrap();
        assert!(store.latest_unresolved_ambiguity(&session).await.unwrap().is_some());
        store.resolve_ambiguity(&session, TurnNumber(1)).await.unwrap();
        assert!(store.latest_unresolved_ambiguity(&session).await.unwrap().is_none());
    }
}
