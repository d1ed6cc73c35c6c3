//! Turn Orchestrator (C10): wires every other component together into
//! one conversation turn — classify, decide, extract, validate,
//! dispatch, or fall back — under a per-session serialization lock, a
//! global worker budget, and a per-turn deadline (spec §4.1, §5).

mod lock;
mod task;

pub mod llm_http;

use arbiter::{decide_intent, decide_slots, Decision, IntentDecisionInput, SlotIssue, Thresholds};
use async_task_manager::{AsyncTaskManager, TaskManagerConfig};
use cache_memory::MemoryCache;
use chrono::{DateTime, Utc};
use config_registry::ConfigRegistry;
use fallback_engine::FallbackEngine;
use function_dispatcher::FunctionDispatcher;
use intent_classifier::{ClassifierContext, IntentClassifier};
use lock::SessionLocks;
use slot_extractor::{should_replace, validate_intent, ExtractedSlot, SlotExtractor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use turnflow_core::config::CancelCategory;
use turnflow_core::duration::DurationMs;
use turnflow_core::error::OrchestratorError;
use turnflow_core::id::{IntentName, RequestId, SlotName, UserId};
use turnflow_core::llm::LlmClient;
use turnflow_core::session::{
    effective_slots, CompensationLogRecord, ConversationTurn, EffectiveSlots, ExtractionMethod,
    IntentAmbiguityRecord, IntentTransferRecord, ResponseType, Session, SessionState, SlotValue,
    TurnStatus, ValidationStatus,
};
use turnflow_core::state::SessionStore;
use turnflow_core::turn::{CandidateIntent, SlotReport, TurnRequest, TurnResponseData, TurnResponseEnvelope};

/// Default depth of each session's FIFO wait queue (spec §5 `Q`).
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Default system-wide concurrent-turn budget (spec §5 worker pool).
pub const DEFAULT_WORKER_BUDGET: usize = 64;

/// Default per-turn processing deadline (spec §5 `D`).
pub const DEFAULT_TURN_DEADLINE: Duration = Duration::from_secs(60);

/// Default session inactivity TTL, applied to sessions minted without an
/// explicit one carried over from the request.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// A dispatched function at or above this expected duration is routed to
/// the async task manager instead of called synchronously (spec §4.7).
pub const DEFAULT_ASYNC_DISPATCH_THRESHOLD_MS: u64 = 5_000;

/// Tuning knobs for one orchestrator instance.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Per-session wait queue depth.
    pub queue_depth: usize,
    /// System-wide concurrent-turn budget.
    pub worker_budget: usize,
    /// Per-turn processing deadline.
    pub turn_deadline: Duration,
    /// TTL applied to freshly minted sessions.
    pub session_ttl: Duration,
    /// Async-dispatch threshold, in milliseconds.
    pub async_dispatch_threshold_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            worker_budget: DEFAULT_WORKER_BUDGET,
            turn_deadline: DEFAULT_TURN_DEADLINE,
            session_ttl: DEFAULT_SESSION_TTL,
            async_dispatch_threshold_ms: DEFAULT_ASYNC_DISPATCH_THRESHOLD_MS,
        }
    }
}

/// Ties every component (C1-C9) together to answer one [`TurnRequest`].
pub struct TurnOrchestrator {
    config: Arc<ConfigRegistry>,
    store: Arc<dyn SessionStore>,
    classifier: IntentClassifier,
    extractor: SlotExtractor,
    dispatcher: Arc<FunctionDispatcher>,
    fallback: FallbackEngine,
    tasks: Arc<AsyncTaskManager>,
    locks: SessionLocks,
    worker_budget: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl TurnOrchestrator {
    /// Build an orchestrator. `llm` backs both classification and slot
    /// extraction; `rag` backs the fallback engine's knowledge-base call
    /// (often the same endpoint, kept distinct since a deployment may
    /// point them at different models).
    pub fn new(
        config: Arc<ConfigRegistry>,
        store: Arc<dyn SessionStore>,
        cache: Arc<MemoryCache>,
        llm: Arc<dyn LlmClient>,
        rag: Arc<dyn LlmClient>,
        dispatcher: Arc<FunctionDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        let classifier = IntentClassifier::new(config.clone(), cache, llm.clone());
        let extractor = SlotExtractor::new(config.clone(), llm);
        let fallback = FallbackEngine::new(config.clone(), rag);
        let tasks = AsyncTaskManager::spawn(task::executors(dispatcher.clone()), TaskManagerConfig::default());
        Self {
            config,
            store,
            classifier,
            extractor,
            dispatcher,
            fallback,
            tasks,
            locks: SessionLocks::new(settings.queue_depth),
            worker_budget: Arc::new(Semaphore::new(settings.worker_budget.max(1))),
            settings,
        }
    }

    /// Process one turn end to end, returning the outer response
    /// envelope (spec §6). Only `InvalidInput`, `SessionBusy`, and
    /// `Internal` ever surface as an `Err`; every other outcome is a
    /// valid, wrapped business response (spec §7).
    pub async fn process_turn(&self, request: TurnRequest) -> Result<TurnResponseEnvelope, OrchestratorError> {
        let request_id = RequestId::new(uuid::Uuid::new_v4().to_string());
        request.validate().map_err(OrchestratorError::InvalidInput)?;

        let now = Utc::now();
        let session = self.resolve_session(&request, now).await?;

        let guard = self.locks.try_enter(&session.id).await.ok_or(OrchestratorError::SessionBusy)?;

        let _worker_permit = self.worker_budget.clone().acquire_owned().await.map_err(|_| {
            OrchestratorError::Internal {
                message: "worker budget semaphore closed".to_string(),
                trace_id: request_id.to_string(),
            }
        })?;

        let data = tokio::time::timeout(self.settings.turn_deadline, self.run_turn(request, session, now, &guard))
            .await
            .map_err(|_| OrchestratorError::Internal {
                message: "turn exceeded its processing deadline".to_string(),
                trace_id: request_id.to_string(),
            })??;

        Ok(TurnResponseEnvelope::ok(data, request_id))
    }

    async fn resolve_session(&self, request: &TurnRequest, now: DateTime<Utc>) -> Result<Session, OrchestratorError> {
        match &request.session_id {
            Some(id) => match self.store.get_session(id).await? {
                Some(session) if !session.is_expired(now) => Ok(session),
                Some(_) => {
                    self.store.delete_session(id).await?;
                    Err(OrchestratorError::SessionExpired(id.to_string()))
                }
                None => Err(OrchestratorError::SessionExpired(id.to_string())),
            },
            None => {
                let id = turnflow_core::id::SessionId::new(uuid::Uuid::new_v4().to_string());
                let expires_at = now + chrono::Duration::milliseconds(self.settings.session_ttl.as_millis() as i64);
                Ok(Session::new(id, UserId::new(request.user_id.clone()), expires_at))
            }
        }
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        mut session: Session,
        now: DateTime<Utc>,
        guard: &lock::SessionGuard,
    ) -> Result<TurnResponseData, OrchestratorError> {
        let started = Instant::now();
        let _serialize = guard.serialize().await;

        let turn_number = turnflow_core::id::TurnNumber(session.turn_count + 1);

        let slot_history = self.store.list_slot_values(&session.id).await?;
        let effective = effective_slots(slot_history.iter());

        let recorded_turns = self.store.list_turns(&session.id).await?;
        let recent_intents: Vec<IntentName> = recorded_turns
            .iter()
            .rev()
            .take(3)
            .filter_map(|t| t.intent.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let classifier_ctx =
            ClassifierContext { current_intent: session.current_intent.clone(), recent_intents };
        let candidates = self.classifier.classify(&request.input, &classifier_ctx).await;
        let top_confidence = candidates.first().map(|(_, c)| *c).unwrap_or(0.0);

        let cancel_intents: HashMap<IntentName, CancelCategory> = self
            .config
            .intents_active()
            .into_iter()
            .filter_map(|i| i.cancel_category.map(|c| (i.name, c)))
            .collect();
        let threshold_fn = |name: &IntentName| self.config.intent(name).map(|i| i.confidence_threshold).unwrap_or(1.0);

        let decision = decide_intent(&IntentDecisionInput {
            candidates: &candidates,
            current_intent: session.current_intent.as_ref(),
            intent_threshold: &threshold_fn,
            cancel_intents: &cancel_intents,
            thresholds: Thresholds::default(),
        })
        .map_err(|e| OrchestratorError::Internal { message: e.to_string(), trace_id: "n/a".to_string() })?;

        let is_disambiguate = matches!(decision, Decision::Disambiguate { .. });

        let mut outcome = match decision {
            Decision::Fallback => {
                let result = self.fallback.handle(&request.input, session.current_intent.as_ref()).await;
                TurnOutcome {
                    response_text: result.response,
                    status: result.status,
                    response_type: result.response_type,
                    missing_slots: vec![],
                    candidate_intents: vec![],
                    api_result: None,
                    recognized_intent: None,
                    next_session_intent: session.current_intent.clone(),
                    slots_report: HashMap::new(),
                    fresh_slots: vec![],
                    transfer: None,
                    ambiguity: None,
                    session_state: session.state,
                }
            }
            Decision::Cancel { from, category } => {
                let default_reply = match category {
                    CancelCategory::Cancel => "好的，已为您取消。",
                    CancelCategory::Postpone => "好的，已为您保留，需要时可以随时继续。",
                    CancelCategory::Reject => "好的，已忽略该建议。",
                };
                let template_name = match category {
                    CancelCategory::Cancel => "cancellation_confirmation",
                    CancelCategory::Postpone => "postponement_confirmation",
                    CancelCategory::Reject => "rejection_acknowledgment",
                };
                let reply = self
                    .config
                    .template(template_name, from.as_ref())
                    .map(|t| t.body)
                    .unwrap_or_else(|| default_reply.to_string());
                let (status, response_type, session_state, next_session_intent) = match category {
                    CancelCategory::Cancel => (
                        TurnStatus::IntentCancelled,
                        ResponseType::CancellationConfirmation,
                        SessionState::Active,
                        None,
                    ),
                    CancelCategory::Postpone => (
                        TurnStatus::IntentPostponed,
                        ResponseType::PostponementWithSave,
                        SessionState::Paused,
                        from.clone(),
                    ),
                    CancelCategory::Reject => (
                        TurnStatus::SuggestionRejected,
                        ResponseType::RejectionAcknowledgment,
                        SessionState::Active,
                        session.current_intent.clone(),
                    ),
                };
                TurnOutcome {
                    response_text: reply,
                    status,
                    response_type,
                    missing_slots: vec![],
                    candidate_intents: vec![],
                    api_result: None,
                    recognized_intent: from,
                    next_session_intent,
                    slots_report: HashMap::new(),
                    fresh_slots: vec![],
                    transfer: None,
                    ambiguity: None,
                    session_state,
                }
            }
            Decision::Disambiguate { candidates } => {
                let candidate_intents = candidates
                    .iter()
                    .map(|(name, confidence)| CandidateIntent {
                        intent: name.clone(),
                        confidence: *confidence,
                        display_name: self.config.intent(name).map(|i| i.display_name).unwrap_or_else(|| name.to_string()),
                    })
                    .collect();
                let reply = self
                    .config
                    .template("disambiguation_prompt", None)
                    .map(|t| t.body)
                    .unwrap_or_else(|| "您是想说以下哪一项呢？".to_string());
                TurnOutcome {
                    response_text: reply,
                    status: TurnStatus::Ambiguous,
                    response_type: ResponseType::Disambiguation,
                    missing_slots: vec![],
                    candidate_intents,
                    api_result: None,
                    recognized_intent: None,
                    next_session_intent: session.current_intent.clone(),
                    slots_report: HashMap::new(),
                    fresh_slots: vec![],
                    transfer: None,
                    ambiguity: Some(IntentAmbiguityRecord {
                        session_id: session.id.clone(),
                        turn_number,
                        candidates,
                        resolved: false,
                    }),
                    session_state: session.state,
                }
            }
            Decision::Continue { intent } => {
                self.fill_and_maybe_dispatch(&intent, &request.input, &session, turn_number, now, &effective).await?
            }
            Decision::Switch { from, to } => {
                let mut outcome =
                    self.fill_and_maybe_dispatch(&to, &request.input, &session, turn_number, now, &effective).await?;
                // A session with no prior intent "switching" into its first one isn't
                // a transfer in any user-visible sense; only override when one intent
                // was actually active and is being handed off from.
                if from.is_some() {
                    if outcome.status == TurnStatus::Completed {
                        outcome.response_type = ResponseType::IntentTransferWithCompletion;
                    } else {
                        outcome.status = TurnStatus::IntentTransfer;
                    }
                    outcome.transfer = Some(IntentTransferRecord {
                        session_id: session.id.clone(),
                        turn_number,
                        from,
                        to,
                        reason: "classifier confidence exceeded the transfer threshold".to_string(),
                        saved_context: serde_json::to_value(
                            effective.iter().map(|(k, v)| (k.to_string(), v.normalized.clone())).collect::<HashMap<_, _>>(),
                        )
                        .unwrap_or(serde_json::Value::Null),
                        confidence: top_confidence,
                        success: true,
                    });
                }
                outcome
            }
            Decision::SlotPrompt { .. } | Decision::Dispatch => {
                unreachable!("decide_intent never returns a slot-stage decision")
            }
        };

        let turn_record = ConversationTurn {
            session_id: session.id.clone(),
            turn_number,
            input_text: request.input.clone(),
            intent: outcome.recognized_intent.clone(),
            confidence: top_confidence,
            response_text: outcome.response_text.clone(),
            response_type: outcome.response_type,
            status: outcome.status,
            processing_latency: DurationMs::from(started.elapsed()),
            error: None,
            created_at: Utc::now(),
        };

        if let Err(store_err) =
            self.persist_turn(&mut session, turn_number, &outcome, &turn_record, is_disambiguate).await
        {
            if let Some(api_result) = outcome.api_result.clone() {
                let compensation = CompensationLogRecord {
                    session_id: session.id.clone(),
                    turn_number,
                    api_result: api_result.clone(),
                    store_error: store_err.to_string(),
                };
                let _ = self.store.put_compensation_log(&compensation).await;
                return Err(OrchestratorError::PersistenceFailedAfterDispatch {
                    message: store_err.to_string(),
                    trace_id: "n/a".to_string(),
                    api_result,
                });
            }
            return Err(store_err.into());
        }

        Ok(TurnResponseData {
            response: outcome.response_text,
            session_id: session.id.clone(),
            conversation_turn: turn_number.0,
            intent: outcome.recognized_intent,
            confidence: top_confidence,
            slots: outcome.slots_report,
            status: outcome.status,
            response_type: outcome.response_type,
            missing_slots: outcome.missing_slots,
            candidate_intents: outcome.candidate_intents,
            api_result: outcome.api_result,
            session_metadata: serde_json::json!({ "expires_at": session.expires_at }),
            processing_time_ms: DurationMs::from(started.elapsed()),
        })
    }

    /// Write every record a turn produces, then advance and persist the
    /// session itself. Isolated from `run_turn` so a failure here, after a
    /// dispatch already ran, can be distinguished from a pre-dispatch store
    /// failure and routed to the compensation log instead of discarding
    /// `outcome.api_result`.
    async fn persist_turn(
        &self,
        session: &mut Session,
        turn_number: turnflow_core::id::TurnNumber,
        outcome: &TurnOutcome,
        turn_record: &ConversationTurn,
        is_disambiguate: bool,
    ) -> Result<(), turnflow_core::error::StoreError> {
        for slot_value in &outcome.fresh_slots {
            self.store.put_slot_value(slot_value).await?;
        }
        if let Some(ambiguity) = &outcome.ambiguity {
            self.store.put_ambiguity(ambiguity).await?;
        }
        self.store.append_turn(turn_record).await?;

        session.current_intent = outcome.next_session_intent.clone();
        session.turn_count = turn_number.0;
        session.state = outcome.session_state;
        self.store.put_session(session).await?;

        if let Some(transfer) = &outcome.transfer {
            self.store.put_transfer(transfer).await?;
        }
        if !is_disambiguate {
            if let Some(prior) = self.store.latest_unresolved_ambiguity(&session.id).await? {
                self.store.resolve_ambiguity(&session.id, prior.turn_number).await?;
            }
        }
        Ok(())
    }

    /// Shared by `Continue` and `Switch`: extract, merge, validate, and
    /// either prompt for the next slot or dispatch (spec §4.5/§4.6/§4.7).
    async fn fill_and_maybe_dispatch(
        &self,
        intent_name: &IntentName,
        text: &str,
        session: &Session,
        turn_number: turnflow_core::id::TurnNumber,
        now: DateTime<Utc>,
        effective: &EffectiveSlots,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let Some(intent) = self.config.intent(intent_name) else {
            return Ok(TurnOutcome {
                response_text: "抱歉，这个请求暂时无法处理，请换个说法试试。".to_string(),
                status: TurnStatus::ApiError,
                response_type: ResponseType::ErrorWithAlternatives,
                missing_slots: vec![],
                candidate_intents: vec![],
                api_result: None,
                recognized_intent: None,
                next_session_intent: None,
                slots_report: HashMap::new(),
                fresh_slots: vec![],
                transfer: None,
                ambiguity: None,
                session_state: SessionState::Active,
            });
        };

        let extracted = self.extractor.extract(&intent, text, now).await;

        let mut merged_values: HashMap<SlotName, serde_json::Value> =
            effective.iter().map(|(name, value)| (name.clone(), value.normalized.clone())).collect();
        let mut fresh: HashMap<SlotName, ExtractedSlot> = HashMap::new();

        for (name, candidate) in extracted {
            let previous = effective.get(&name);
            if should_replace(previous.map(|v| v.confidence), previous.map(|v| v.status), candidate.confidence) {
                merged_values.insert(name.clone(), candidate.normalized.clone());
                fresh.insert(name, candidate);
            }
        }

        for slot in &intent.slots {
            if !slot.required && !merged_values.contains_key(&slot.name) {
                if let Some(default) = &slot.default_value {
                    merged_values.insert(slot.name.clone(), default.clone());
                    fresh.insert(
                        slot.name.clone(),
                        ExtractedSlot {
                            original_text: String::new(),
                            extracted: default.clone(),
                            normalized: default.clone(),
                            confidence: 1.0,
                            method: ExtractionMethod::Default,
                        },
                    );
                }
            }
        }

        let results = validate_intent(&intent, &merged_values);

        let mut pending = Vec::new();
        for slot in &intent.slots {
            if !slot.required {
                continue;
            }
            match merged_values.get(&slot.name) {
                None => pending.push(SlotIssue { slot: slot.name.clone(), priority: slot.extraction_priority, error: None }),
                Some(_) => {
                    if let Some(validation) = results.get(&slot.name) {
                        if validation.status == ValidationStatus::Invalid {
                            pending.push(SlotIssue {
                                slot: slot.name.clone(),
                                priority: slot.extraction_priority,
                                error: validation.errors.first().cloned(),
                            });
                        }
                    }
                }
            }
        }

        let fresh_slots: Vec<SlotValue> = fresh
            .iter()
            .map(|(name, candidate)| {
                let status = results.get(name).map(|r| r.status).unwrap_or(ValidationStatus::Valid);
                let errors = results.get(name).map(|r| r.errors.clone()).unwrap_or_default();
                SlotValue {
                    session_id: session.id.clone(),
                    turn_number,
                    slot_name: name.clone(),
                    original_text: candidate.original_text.clone(),
                    extracted: candidate.extracted.clone(),
                    normalized: candidate.normalized.clone(),
                    confidence: candidate.confidence,
                    method: candidate.method,
                    status,
                    errors,
                    confirmed: false,
                }
            })
            .collect();

        let slots_report: HashMap<SlotName, SlotReport> = merged_values
            .iter()
            .map(|(name, value)| {
                let validation = results.get(name).map(|r| r.status).unwrap_or(ValidationStatus::Valid);
                let (original, extracted_value, confidence, method) = if let Some(candidate) = fresh.get(name) {
                    (candidate.original_text.clone(), candidate.extracted.clone(), candidate.confidence, candidate.method)
                } else if let Some(prior) = effective.get(name) {
                    (prior.original_text.clone(), prior.extracted.clone(), prior.confidence, prior.method)
                } else {
                    (String::new(), value.clone(), 1.0, ExtractionMethod::Carried)
                };
                let report = SlotReport {
                    original,
                    extracted: extracted_value,
                    normalized: value.clone(),
                    confidence,
                    method: format!("{method:?}").to_lowercase(),
                    validation: format!("{validation:?}").to_lowercase(),
                };
                (name.clone(), report)
            })
            .collect();

        match decide_slots(&pending) {
            Decision::SlotPrompt { slot, error } => {
                let prompt = intent
                    .slots
                    .iter()
                    .find(|s| s.name == slot)
                    .map(|s| s.prompt_template.replace("${slot}", s.name.as_str()))
                    .unwrap_or_else(|| format!("请提供{slot}"));
                let (status, response_type) = if error.is_some() {
                    (TurnStatus::ValidationError, ResponseType::ValidationErrorPrompt)
                } else {
                    (TurnStatus::Incomplete, ResponseType::SlotPrompt)
                };
                let missing_slots = if error.is_none() {
                    pending.iter().filter(|i| i.error.is_none()).map(|i| i.slot.clone()).collect()
                } else {
                    vec![]
                };
                Ok(TurnOutcome {
                    response_text: prompt,
                    status,
                    response_type,
                    missing_slots,
                    candidate_intents: vec![],
                    api_result: None,
                    recognized_intent: Some(intent_name.clone()),
                    next_session_intent: Some(intent_name.clone()),
                    slots_report,
                    fresh_slots,
                    transfer: None,
                    ambiguity: None,
                    session_state: SessionState::Active,
                })
            }
            Decision::Dispatch => match &intent.function {
                None => {
                    let reply = if intent.fallback_reply.is_empty() { "已完成".to_string() } else { intent.fallback_reply.clone() };
                    Ok(TurnOutcome {
                        response_text: reply,
                        status: TurnStatus::Completed,
                        response_type: ResponseType::ApiResult,
                        missing_slots: vec![],
                        candidate_intents: vec![],
                        api_result: None,
                        recognized_intent: Some(intent_name.clone()),
                        next_session_intent: None,
                        slots_report,
                        fresh_slots,
                        transfer: None,
                        ambiguity: None,
                        session_state: SessionState::Active,
                    })
                }
                Some(function) => {
                    let is_async = function.asynchronous
                        || function.expected_duration_ms.unwrap_or(0) > self.settings.async_dispatch_threshold_ms;
                    if is_async {
                        let payload = task::DispatchPayload {
                            function: function.clone(),
                            slots: merged_values.clone(),
                            session: session.id.clone(),
                            turn: turn_number,
                        };
                        let payload_json = serde_json::to_value(&payload).map_err(|e| OrchestratorError::Internal {
                            message: e.to_string(),
                            trace_id: "n/a".to_string(),
                        })?;
                        let ttl = DurationMs::from_millis(function.timeout_ms.saturating_mul(function.retry_count.max(1) as u64).max(60_000));
                        let task_id = self
                            .tasks
                            .submit(task::TASK_TYPE, payload_json, session.user_id.clone(), ttl)
                            .await
                            .map_err(|e| OrchestratorError::Internal { message: e.to_string(), trace_id: "n/a".to_string() })?;
                        Ok(TurnOutcome {
                            response_text: "请求已提交，正在处理中。".to_string(),
                            status: TurnStatus::TaskSubmitted,
                            response_type: ResponseType::ApiResult,
                            missing_slots: vec![],
                            candidate_intents: vec![],
                            api_result: Some(serde_json::json!({ "task_id": task_id.to_string() })),
                            recognized_intent: Some(intent_name.clone()),
                            next_session_intent: Some(intent_name.clone()),
                            slots_report,
                            fresh_slots,
                            transfer: None,
                            ambiguity: None,
                            session_state: SessionState::Active,
                        })
                    } else {
                        let result = self.dispatcher.dispatch(function, &merged_values, &session.id, turn_number).await;
                        let (status, response_type) = if result.ok {
                            (TurnStatus::Completed, ResponseType::ApiResult)
                        } else {
                            (TurnStatus::ApiError, ResponseType::ErrorWithAlternatives)
                        };
                        Ok(TurnOutcome {
                            response_text: result.rendered,
                            status,
                            response_type,
                            missing_slots: vec![],
                            candidate_intents: vec![],
                            api_result: result.data,
                            recognized_intent: Some(intent_name.clone()),
                            next_session_intent: if status == TurnStatus::Completed { None } else { Some(intent_name.clone()) },
                            slots_report,
                            fresh_slots,
                            transfer: None,
                            ambiguity: None,
                            session_state: SessionState::Active,
                        })
                    }
                }
            },
            _ => unreachable!("decide_slots only ever returns SlotPrompt or Dispatch"),
        }
    }
}

/// Everything one decision branch needs to hand back to `run_turn` for
/// persistence and response assembly.
struct TurnOutcome {
    response_text: String,
    status: TurnStatus,
    response_type: ResponseType,
    missing_slots: Vec<SlotName>,
    candidate_intents: Vec<CandidateIntent>,
    api_result: Option<serde_json::Value>,
    recognized_intent: Option<IntentName>,
    next_session_intent: Option<IntentName>,
    slots_report: HashMap<SlotName, SlotReport>,
    fresh_slots: Vec<SlotValue>,
    transfer: Option<IntentTransferRecord>,
    ambiguity: Option<IntentAmbiguityRecord>,
    session_state: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use config_registry::{ConfigSource, RawConfig};
    use std::collections::HashMap as Map;
    use turnflow_core::config::{
        CancelCategory, FunctionDef, HttpMethod, Intent, Slot, SlotType, Template, ValidationRule,
    };
    use turnflow_core::error::{ConfigError, LlmError};
    use turnflow_core::id::IntentName as Name;
    use turnflow_core::llm::{CompletionRequest, CompletionResponse};

    struct FixedSource(RawConfig);

    #[async_trait]
    impl ConfigSource for FixedSource {
        async fn load(&self) -> Result<RawConfig, ConfigError> {
            Ok(self.0.clone())
        }
    }

    struct ErroringLlm;

    #[async_trait]
    impl LlmClient for ErroringLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::Transport("no model configured in this fixture".to_string()))
        }
    }

    struct CannedLlm(String);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse { content: self.0.clone(), model: "fixture".to_string() })
        }
    }

    fn greet_intent() -> Intent {
        Intent {
            name: Name::new("say_hello"),
            display_name: "Say Hello".to_string(),
            category: "smalltalk".to_string(),
            priority: 0,
            confidence_threshold: 0.1,
            examples: vec!["hello there".to_string(), "say hello".to_string()],
            fallback_reply: "你好！".to_string(),
            active: true,
            slots: vec![],
            dependencies: vec![],
            function: None,
            cancel_category: None,
        }
    }

    fn book_flight_intent(function_url: String) -> Intent {
        Intent {
            name: Name::new("book_flight"),
            display_name: "Book Flight".to_string(),
            category: "travel".to_string(),
            priority: 0,
            confidence_threshold: 0.1,
            examples: vec!["book a flight".to_string(), "book flight to beijing".to_string()],
            fallback_reply: String::new(),
            active: true,
            slots: vec![Slot {
                name: SlotName::new("departure_city"),
                slot_type: SlotType::Text,
                entity_type: None,
                required: true,
                list: false,
                validation_rules: vec![ValidationRule::AllowedSet {
                    values: vec!["beijing".to_string()],
                    message: "unknown city".to_string(),
                }],
                default_value: None,
                prompt_template: "Which city are you departing from?".to_string(),
                extraction_priority: 1,
                extraction_rules: vec![turnflow_core::config::ExtractionRule::Keyword {
                    keywords: vec!["beijing".to_string()],
                    confidence_boost: 0.9,
                }],
                boolean_tokens: None,
            }],
            dependencies: vec![],
            function: Some(FunctionDef {
                name: "book_flight".to_string(),
                url: function_url,
                method: HttpMethod::Post,
                headers: Map::new(),
                parameter_mapping: Map::from([(SlotName::new("departure_city"), "from".to_string())]),
                timeout_ms: 2_000,
                retry_count: 1,
                success_template: "booked from ${from}".to_string(),
                error_template: "failed: ${error_message}".to_string(),
                asynchronous: false,
                expected_duration_ms: None,
            }),
            cancel_category: None,
        }
    }

    fn cancel_intent() -> Intent {
        Intent {
            name: Name::new("cancel"),
            display_name: "Cancel".to_string(),
            category: "control".to_string(),
            priority: 0,
            confidence_threshold: 0.1,
            examples: vec!["cancel that".to_string(), "never mind cancel".to_string()],
            fallback_reply: String::new(),
            active: true,
            slots: vec![],
            dependencies: vec![],
            function: None,
            cancel_category: Some(CancelCategory::Cancel),
        }
    }

    fn postpone_intent() -> Intent {
        Intent {
            name: Name::new("postpone"),
            display_name: "Postpone".to_string(),
            category: "control".to_string(),
            priority: 0,
            confidence_threshold: 0.1,
            examples: vec!["hold on".to_string(), "remind me later".to_string()],
            fallback_reply: String::new(),
            active: true,
            slots: vec![],
            dependencies: vec![],
            function: None,
            cancel_category: Some(CancelCategory::Postpone),
        }
    }

    fn global_templates() -> Vec<Template> {
        vec![
            Template {
                template_type: "slot_filling".to_string(),
                intent: None,
                body: "Extract slots: ${slots}".to_string(),
            },
            Template {
                template_type: "cancellation_confirmation".to_string(),
                intent: None,
                body: "好的，已为您取消。".to_string(),
            },
            Template {
                template_type: "postponement_confirmation".to_string(),
                intent: None,
                body: "好的，已为您保留，需要时可以随时继续。".to_string(),
            },
            Template {
                template_type: "rejection_acknowledgment".to_string(),
                intent: None,
                body: "好的，已忽略该建议。".to_string(),
            },
        ]
    }

    async fn orchestrator_with(intents: Vec<Intent>, rag: Arc<dyn LlmClient>) -> TurnOrchestrator {
        let source = Arc::new(FixedSource(RawConfig {
            intents,
            entity_dicts: vec![],
            templates: global_templates(),
            synonym_groups: vec![],
        }));
        let (registry, _report) = ConfigRegistry::load(source).await.unwrap();
        TurnOrchestrator::new(
            Arc::new(registry),
            Arc::new(session_store::MemorySessionStore::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(ErroringLlm),
            rag,
            Arc::new(FunctionDispatcher::new()),
            OrchestratorSettings::default(),
        )
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_any_lookup() {
        let orchestrator = orchestrator_with(vec![], Arc::new(ErroringLlm)).await;
        let err = orchestrator
            .process_turn(TurnRequest { user_id: "u1".to_string(), input: String::new(), session_id: None, context: None })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unmatched_input_falls_back_to_rag() {
        let orchestrator = orchestrator_with(vec![], Arc::new(CannedLlm("天气晴朗".to_string()))).await;
        let response = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "今天天气真好".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data.status, TurnStatus::RagflowHandled);
        assert_eq!(data.response, "天气晴朗");
    }

    #[tokio::test]
    async fn missing_required_slot_prompts_for_it() {
        let orchestrator = orchestrator_with(vec![book_flight_intent("http://127.0.0.1:1/book".to_string())], Arc::new(ErroringLlm)).await;
        let response = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "book a flight".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data.status, TurnStatus::Incomplete);
        assert_eq!(data.missing_slots, vec![SlotName::new("departure_city")]);
    }

    #[tokio::test]
    async fn filled_slot_dispatches_and_completes() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"from": "beijing"})))
            .mount(&server)
            .await;

        let orchestrator = orchestrator_with(vec![book_flight_intent(server.uri())], Arc::new(ErroringLlm)).await;
        let response = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "book flight to beijing".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data.status, TurnStatus::Completed);
        assert_eq!(data.response, "booked from beijing");
    }

    #[tokio::test]
    async fn cancel_intent_clears_session_state() {
        let orchestrator = orchestrator_with(vec![cancel_intent()], Arc::new(ErroringLlm)).await;
        let response = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "never mind cancel".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap();
        let data = response.data.unwrap();
        assert_eq!(data.status, TurnStatus::IntentCancelled);
        assert_eq!(data.response_type, ResponseType::CancellationConfirmation);
    }

    #[tokio::test]
    async fn postpone_intent_suspends_rather_than_clears() {
        let orchestrator = orchestrator_with(
            vec![book_flight_intent("http://127.0.0.1:1/book".to_string()), postpone_intent()],
            Arc::new(ErroringLlm),
        )
        .await;
        let first = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "book a flight".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap();
        let first_data = first.data.unwrap();
        assert_eq!(first_data.status, TurnStatus::Incomplete);

        let second = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "hold on".to_string(),
                session_id: Some(first_data.session_id),
                context: None,
            })
            .await
            .unwrap();
        let second_data = second.data.unwrap();
        assert_eq!(second_data.status, TurnStatus::IntentPostponed);
        assert_eq!(second_data.response_type, ResponseType::PostponementWithSave);
        assert_eq!(second_data.intent, Some(IntentName::new("book_flight")));
    }

    #[tokio::test]
    async fn second_turn_continues_the_same_session() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"from": "beijing"})))
            .mount(&server)
            .await;

        let orchestrator = orchestrator_with(vec![book_flight_intent(server.uri())], Arc::new(ErroringLlm)).await;
        let first = orchestrator
            .process_turn(TurnRequest { user_id: "u1".to_string(), input: "book a flight".to_string(), session_id: None, context: None })
            .await
            .unwrap();
        let first_data = first.data.unwrap();
        assert_eq!(first_data.status, TurnStatus::Incomplete);

        let second = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "beijing".to_string(),
                session_id: Some(first_data.session_id),
                context: None,
            })
            .await
            .unwrap();
        let second_data = second.data.unwrap();
        assert_eq!(second_data.conversation_turn, 2);
        assert_eq!(second_data.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_session_id_is_rejected() {
        let orchestrator = orchestrator_with(vec![greet_intent()], Arc::new(ErroringLlm)).await;
        let err = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "hello there".to_string(),
                session_id: Some(turnflow_core::id::SessionId::new("does-not-exist")),
                context: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionExpired(_)));
    }

    /// Delegates every read/write to an inner `MemorySessionStore` except
    /// `put_session`, which always fails, to exercise the compensation-log
    /// path for a persistence write failing right after a dispatch ran.
    struct FailingStore {
        inner: session_store::MemorySessionStore,
    }

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn get_session(
            &self,
            id: &turnflow_core::id::SessionId,
        ) -> Result<Option<Session>, turnflow_core::error::StoreError> {
            self.inner.get_session(id).await
        }

        async fn put_session(&self, _session: &Session) -> Result<(), turnflow_core::error::StoreError> {
            Err(turnflow_core::error::StoreError::Backend("disk full".to_string()))
        }

        async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.append_turn(turn).await
        }

        async fn list_turns(
            &self,
            session: &turnflow_core::id::SessionId,
        ) -> Result<Vec<ConversationTurn>, turnflow_core::error::StoreError> {
            self.inner.list_turns(session).await
        }

        async fn put_slot_value(&self, value: &SlotValue) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.put_slot_value(value).await
        }

        async fn list_slot_values(
            &self,
            session: &turnflow_core::id::SessionId,
        ) -> Result<Vec<SlotValue>, turnflow_core::error::StoreError> {
            self.inner.list_slot_values(session).await
        }

        async fn put_ambiguity(&self, record: &IntentAmbiguityRecord) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.put_ambiguity(record).await
        }

        async fn latest_unresolved_ambiguity(
            &self,
            session: &turnflow_core::id::SessionId,
        ) -> Result<Option<IntentAmbiguityRecord>, turnflow_core::error::StoreError> {
            self.inner.latest_unresolved_ambiguity(session).await
        }

        async fn resolve_ambiguity(
            &self,
            session: &turnflow_core::id::SessionId,
            turn: turnflow_core::id::TurnNumber,
        ) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.resolve_ambiguity(session, turn).await
        }

        async fn put_transfer(&self, record: &IntentTransferRecord) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.put_transfer(record).await
        }

        async fn delete_session(&self, session: &turnflow_core::id::SessionId) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.delete_session(session).await
        }

        async fn put_compensation_log(
            &self,
            record: &CompensationLogRecord,
        ) -> Result<(), turnflow_core::error::StoreError> {
            self.inner.put_compensation_log(record).await
        }
    }

    #[tokio::test]
    async fn dispatch_result_preserved_when_persistence_fails_after_success() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"from": "beijing"})))
            .mount(&server)
            .await;

        let source = Arc::new(FixedSource(RawConfig {
            intents: vec![book_flight_intent(server.uri())],
            entity_dicts: vec![],
            templates: global_templates(),
            synonym_groups: vec![],
        }));
        let (registry, _report) = ConfigRegistry::load(source).await.unwrap();
        let orchestrator = TurnOrchestrator::new(
            Arc::new(registry),
            Arc::new(FailingStore { inner: session_store::MemorySessionStore::new() }),
            Arc::new(MemoryCache::new()),
            Arc::new(ErroringLlm),
            Arc::new(ErroringLlm),
            Arc::new(FunctionDispatcher::new()),
            OrchestratorSettings::default(),
        );

        let err = orchestrator
            .process_turn(TurnRequest {
                user_id: "u1".to_string(),
                input: "book flight to beijing".to_string(),
                session_id: None,
                context: None,
            })
            .await
            .unwrap_err();

        match err {
            OrchestratorError::PersistenceFailedAfterDispatch { api_result, .. } => {
                assert_eq!(api_result, serde_json::json!({"from": "beijing"}));
            }
            other => panic!("expected PersistenceFailedAfterDispatch, got {other:?}"),
        }
    }
}
