#![deny(missing_docs)]
//! Arbiter (C6, spec §4.6): a pure, I/O-free decision function over
//! classifier output, session state, and slot validation results. The
//! closed `Decision` enum keeps every branch exhaustiveness-checked —
//! callers match on it rather than inspecting ad hoc flags.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use turnflow_core::config::CancelCategory;
use turnflow_core::error::ArbiterError;
use turnflow_core::id::{IntentName, SlotName};

/// The arbiter's decision (spec §4.6 table).
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Continue with the session's current intent; proceed to extraction.
    Continue {
        /// The (unchanged) current intent.
        intent: IntentName,
    },
    /// Switch to a new intent, recording a transfer.
    Switch {
        /// The intent switched away from, if any.
        from: Option<IntentName>,
        /// The intent switched to.
        to: IntentName,
    },
    /// Ask the user to disambiguate between near-equal candidates.
    Disambiguate {
        /// Candidates to present, highest confidence first.
        candidates: Vec<(IntentName, f64)>,
    },
    /// Clear, suspend, or dismiss-in-place the current intent, depending
    /// on `category`.
    Cancel {
        /// The intent cancelled/postponed, if any. `None` for `Reject`,
        /// which applies to a suggestion rather than an in-progress intent.
        from: Option<IntentName>,
        /// Which of cancel/postpone/reject this decision represents.
        category: CancelCategory,
    },
    /// Hand off to the fallback engine.
    Fallback,
    /// Prompt for the highest-priority missing or invalid slot.
    SlotPrompt {
        /// The slot to prompt for.
        slot: SlotName,
        /// Its validation error, if it was invalid rather than missing.
        error: Option<String>,
    },
    /// Invoke the function dispatcher; every required slot is valid.
    Dispatch,
}

/// Confidence thresholds and gaps (spec §4.1, §9: `δ` and `δ_transfer`
/// are distinct symbols, not inferred as a single shared value).
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Global floor `τ₀` below which no intent is considered a match.
    pub tau0: f64,
    /// Ambiguity gap `δ`: top-two within this triggers `Disambiguate`.
    pub delta: f64,
    /// Minimum confidence `τ_transfer` to switch away from a current intent.
    pub tau_transfer: f64,
    /// Minimum gap `δ_transfer` over the runner-up to switch intents.
    pub delta_transfer: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { tau0: 0.3, delta: 0.1, tau_transfer: 0.75, delta_transfer: 0.15 }
    }
}

/// Input to the classification-stage decision (`Continue`/`Switch`/
/// `Disambiguate`/`Cancel`/`Fallback`).
pub struct IntentDecisionInput<'a> {
    /// Classifier candidates, sorted descending by confidence.
    pub candidates: &'a [(IntentName, f64)],
    /// The session's current intent, if any.
    pub current_intent: Option<&'a IntentName>,
    /// Per-intent confidence threshold `τᵢ`.
    pub intent_threshold: &'a dyn Fn(&IntentName) -> f64,
    /// Intents configured as cancel/postpone/reject intents, mapped to
    /// which category each is.
    pub cancel_intents: &'a HashMap<IntentName, CancelCategory>,
    /// Thresholds and gaps to apply.
    pub thresholds: Thresholds,
}

/// Decide the classification-stage action. Returns `MalformedInput` only
/// for genuinely invalid call shapes; "no intent matched" is `Fallback`,
/// not an error.
pub fn decide_intent(input: &IntentDecisionInput<'_>) -> Result<Decision, ArbiterError> {
    if !input.candidates.windows(2).all(|w| w[0].1 >= w[1].1) {
        return Err(ArbiterError::MalformedInput(
            "candidates must be sorted descending by confidence".to_string(),
        ));
    }

    let Some((top_name, top_conf)) = input.candidates.first() else {
        return Ok(Decision::Fallback);
    };

    if let Some(category) = input.cancel_intents.get(top_name) {
        return Ok(Decision::Cancel { from: input.current_intent.cloned(), category: *category });
    }

    if *top_conf < input.thresholds.tau0 {
        return Ok(Decision::Fallback);
    }

    let runner_up = input.candidates.get(1);
    let gap = runner_up.map(|(_, c)| top_conf - c).unwrap_or(f64::INFINITY);
    let runner_up_above_floor = runner_up.is_some_and(|(_, c)| *c >= input.thresholds.tau0);

    if gap < input.thresholds.delta && runner_up_above_floor {
        return Ok(Decision::Disambiguate { candidates: input.candidates.to_vec() });
    }

    match input.current_intent {
        Some(current) if current == top_name => {
            let tau_i = (input.intent_threshold)(top_name);
            if *top_conf >= tau_i {
                Ok(Decision::Continue { intent: top_name.clone() })
            } else {
                Ok(Decision::Fallback)
            }
        }
        _ => {
            if *top_conf >= input.thresholds.tau_transfer && gap >= input.thresholds.delta_transfer {
                Ok(Decision::Switch { from: input.current_intent.cloned(), to: top_name.clone() })
            } else if input.current_intent.is_none() {
                let tau_i = (input.intent_threshold)(top_name);
                if *top_conf >= tau_i {
                    Ok(Decision::Switch { from: None, to: top_name.clone() })
                } else {
                    Ok(Decision::Fallback)
                }
            } else {
                Ok(Decision::Fallback)
            }
        }
    }
}

/// One outstanding slot issue considered by the slot-stage decision.
#[derive(Debug, Clone)]
pub struct SlotIssue {
    /// The slot in question.
    pub slot: SlotName,
    /// Its configured extraction priority; higher is prompted first.
    pub priority: i32,
    /// Its validation error, `None` if simply missing.
    pub error: Option<String>,
}

/// Decide the slot-stage action (`SlotPrompt`/`Dispatch`). `pending`
/// holds every slot that is either missing-and-required or invalid,
/// already filtered for dependency gating (a slot still `pending` on an
/// unmet dependency is not reported here).
pub fn decide_slots(pending: &[SlotIssue]) -> Decision {
    match pending.iter().max_by_key(|issue| issue.priority) {
        Some(issue) => Decision::SlotPrompt { slot: issue.slot.clone(), error: issue.error.clone() },
        None => Decision::Dispatch,
    }
}
