#![deny(missing_docs)]
//! Slot Extractor & Validator (C5, spec §4.5): extracts typed slot
//! values from an utterance using rules, entity dictionaries, and an LLM
//! fallback, then validates and normalizes them.

mod normalize;
mod rules;
pub mod validate;

use chrono::{DateTime, Utc};
use config_registry::ConfigRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use turnflow_core::config::{Intent, Slot};
use turnflow_core::error::LlmError;
use turnflow_core::id::SlotName;
use turnflow_core::llm::{ChatMessage, CompletionRequest, LlmClient};
use turnflow_core::session::ExtractionMethod;

pub use rules::{apply_entity_dictionary, apply_extraction_rules};
pub use validate::{validate_intent, SlotValidation};

/// Confidence a rule-based match must clear before the extractor skips
/// the LLM fallback for that slot (spec §4.5 step 3, "slot threshold" —
/// not separately configurable per slot in the source material, so a
/// single fixed floor is used across all slots).
pub const RULE_CONFIDENCE_FLOOR: f64 = 0.5;

/// One freshly extracted slot value, before merge-into-session logic.
#[derive(Debug, Clone)]
pub struct ExtractedSlot {
    /// The substring (or LLM-reported span) the value came from.
    pub original_text: String,
    /// Raw value before normalization.
    pub extracted: serde_json::Value,
    /// Normalized, typed value.
    pub normalized: serde_json::Value,
    /// Extraction confidence in `[0,1]`.
    pub confidence: f64,
    /// How the value was produced.
    pub method: ExtractionMethod,
}

/// Extracts and validates slots for a single intent.
pub struct SlotExtractor {
    config: Arc<ConfigRegistry>,
    llm: Arc<dyn LlmClient>,
}

impl SlotExtractor {
    /// Build an extractor bound to the given config registry and LLM.
    pub fn new(config: Arc<ConfigRegistry>, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, llm }
    }

    /// Run the extraction pipeline for every slot of `intent`, in
    /// descending extraction-priority order (spec §4.5).
    pub async fn extract(
        &self,
        intent: &Intent,
        text: &str,
        now: DateTime<Utc>,
    ) -> HashMap<SlotName, ExtractedSlot> {
        let mut ordered: Vec<&Slot> = intent.slots.iter().collect();
        ordered.sort_by(|a, b| b.extraction_priority.cmp(&a.extraction_priority));

        let mut out = HashMap::new();
        let mut pending_llm = Vec::new();

        for slot in ordered {
            if let Some(found) = self.extract_by_rules(slot, text, now) {
                out.insert(slot.name.clone(), found);
            } else {
                pending_llm.push(slot);
            }
        }

        if !pending_llm.is_empty() {
            match self.extract_by_llm(intent, &pending_llm, text, now).await {
                Ok(llm_values) => out.extend(llm_values),
                Err(e) => {
                    tracing::warn!(error = %e, intent = %intent.name, "llm slot extraction failed; keeping prior values only");
                }
            }
        }

        out
    }

    fn extract_by_rules(&self, slot: &Slot, text: &str, now: DateTime<Utc>) -> Option<ExtractedSlot> {
        let rule_match = rules::apply_extraction_rules(slot, text);
        let entity_match = slot
            .entity_type
            .as_deref()
            .and_then(|et| self.config.entity_dict(et))
            .and_then(|dict| rules::apply_entity_dictionary(slot, text, &dict));

        let (raw, method) = match (rule_match, entity_match) {
            (Some(r), Some(e)) if e.confidence >= r.confidence => (e, ExtractionMethod::EntityDictionary),
            (Some(r), _) => (r, ExtractionMethod::Regex),
            (None, Some(e)) => (e, ExtractionMethod::EntityDictionary),
            (None, None) => return None,
        };

        if raw.confidence < RULE_CONFIDENCE_FLOOR {
            return None;
        }

        let normalized = normalize::normalize(slot.slot_type, &raw.original_text, now, slot.boolean_tokens.as_ref())?;
        Some(ExtractedSlot {
            original_text: raw.original_text.clone(),
            extracted: serde_json::Value::String(raw.original_text),
            normalized,
            confidence: raw.confidence,
            method,
        })
    }

    async fn extract_by_llm(
        &self,
        intent: &Intent,
        slots: &[&Slot],
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<HashMap<SlotName, ExtractedSlot>, LlmError> {
        let template = self.config.template("slot_filling", Some(&intent.name));
        let slot_names: Vec<String> = slots.iter().map(|s| s.name.to_string()).collect();
        let prompt = match &template {
            Some(t) => t.body.replace("${slots}", &slot_names.join(", ")),
            None => format!("Extract these slots as JSON {{\"slots\": {{name: value}}}}: {}", slot_names.join(", ")),
        };

        let response = self
            .llm
            .complete(CompletionRequest::deterministic(
                vec![ChatMessage::system(prompt), ChatMessage::user(text.to_string())],
                std::time::Duration::from_secs(10),
            ))
            .await?;

        let parsed: LlmSlotsResponse =
            serde_json::from_str(&response.content).map_err(|e| LlmError::SchemaMismatch(e.to_string()))?;

        let allowed: std::collections::HashSet<&str> = slots.iter().map(|s| s.name.as_str()).collect();
        let mut out = HashMap::new();
        for (name, value) in parsed.slots {
            if !allowed.contains(name.as_str()) {
                continue; // reject extra slots the LLM was not asked for
            }
            let slot_name = SlotName::new(name);
            let Some(slot) = slots.iter().find(|s| s.name == slot_name) else { continue };
            let raw_text = value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string());
            if let Some(normalized) = normalize::normalize(slot.slot_type, &raw_text, now, slot.boolean_tokens.as_ref()) {
                out.insert(
                    slot_name,
                    ExtractedSlot {
                        original_text: raw_text.clone(),
                        extracted: value,
                        normalized,
                        confidence: 0.75,
                        method: ExtractionMethod::Llm,
                    },
                );
            }
        }
        Ok(out)
    }
}

#[derive(serde::Deserialize)]
struct LlmSlotsResponse {
    slots: HashMap<String, serde_json::Value>,
}

/// Merge a freshly extracted value into the session's effective slot map
/// (spec §4.5 step 4): a new extraction replaces the previous value only
/// if its confidence is strictly higher, or the previous status was
/// `invalid`.
pub fn should_replace(
    previous_confidence: Option<f64>,
    previous_status: Option<turnflow_core::session::ValidationStatus>,
    new_confidence: f64,
) -> bool {
    use turnflow_core::session::ValidationStatus;
    match (previous_confidence, previous_status) {
        (None, _) => true,
        (Some(_), Some(ValidationStatus::Invalid)) => true,
        (Some(prev), _) => new_confidence > prev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::session::ValidationStatus;

    #[test]
    fn replaces_when_no_previous_value() {
        assert!(should_replace(None, None, 0.3));
    }

    #[test]
    fn replaces_when_previous_was_invalid_regardless_of_confidence() {
        assert!(should_replace(Some(0.9), Some(ValidationStatus::Invalid), 0.1));
    }

    #[test]
    fn keeps_previous_when_new_confidence_not_strictly_higher() {
        assert!(!should_replace(Some(0.6), Some(ValidationStatus::Valid), 0.6));
    }

    #[test]
    fn replaces_when_new_confidence_strictly_higher() {
        assert!(should_replace(Some(0.6), Some(ValidationStatus::Valid), 0.7));
    }
}
