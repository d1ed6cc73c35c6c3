//! Rule-based extraction (spec §4.5 step 1-2): regex/keyword rules, then
//! entity-dictionary lookup for `entity`-typed slots.

use turnflow_core::config::{EntityDictionary, ExtractionRule, Slot, SlotType};

/// One candidate extraction before normalization.
#[derive(Debug, Clone)]
pub struct RawMatch {
    /// The exact substring matched.
    pub original_text: String,
    /// Confidence contributed by the rule that produced this match.
    pub confidence: f64,
}

/// Try every configured extraction rule against `text`, returning the
/// highest-confidence match, if any.
pub fn apply_extraction_rules(slot: &Slot, text: &str) -> Option<RawMatch> {
    let mut best: Option<RawMatch> = None;
    for rule in &slot.extraction_rules {
        let candidate = match rule {
            ExtractionRule::Regex { pattern, confidence_boost } => {
                regex::Regex::new(pattern).ok().and_then(|re| re.find(text)).map(|m| RawMatch {
                    original_text: m.as_str().to_string(),
                    confidence: *confidence_boost,
                })
            }
            ExtractionRule::Keyword { keywords, confidence_boost } => {
                let lower = text.to_lowercase();
                keywords
                    .iter()
                    .find(|kw| lower.contains(&kw.to_lowercase()))
                    .map(|kw| RawMatch { original_text: kw.clone(), confidence: *confidence_boost })
            }
        };
        if let Some(candidate) = candidate {
            if best.as_ref().is_none_or(|b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }
    }
    best
}

/// Resolve an `entity`-typed slot against its dictionary.
pub fn apply_entity_dictionary(slot: &Slot, text: &str, dict: &EntityDictionary) -> Option<RawMatch> {
    if slot.slot_type != SlotType::Entity {
        return None;
    }
    for window in text.split(|c: char| !c.is_alphanumeric() && !matches!(c, '\u{4e00}'..='\u{9fff}')) {
        if window.is_empty() {
            continue;
        }
        if let Some(entry) = dict.resolve(window) {
            return Some(RawMatch { original_text: window.to_string(), confidence: entry.weight.clamp(0.0, 1.0) });
        }
    }
    dict.resolve(text).map(|entry| RawMatch { original_text: text.to_string(), confidence: entry.weight.clamp(0.0, 1.0) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::config::EntityEntry;
    use turnflow_core::id::SlotName;

    fn slot(slot_type: SlotType, rules: Vec<ExtractionRule>) -> Slot {
        Slot {
            name: SlotName::new("departure_city"),
            slot_type,
            entity_type: None,
            required: true,
            list: false,
            validation_rules: vec![],
            default_value: None,
            prompt_template: String::new(),
            extraction_priority: 0,
            extraction_rules: rules,
            boolean_tokens: None,
        }
    }

    #[test]
    fn regex_rule_extracts_match() {
        let s = slot(
            SlotType::Text,
            vec![ExtractionRule::Regex { pattern: r"\d{4}-\d{2}-\d{2}".to_string(), confidence_boost: 0.9 }],
        );
        let m = apply_extraction_rules(&s, "depart on 2026-08-01 please").unwrap();
        assert_eq!(m.original_text, "2026-08-01");
    }

    #[test]
    fn keyword_rule_is_case_insensitive() {
        let s = slot(
            SlotType::Text,
            vec![ExtractionRule::Keyword { keywords: vec!["beijing".to_string()], confidence_boost: 0.6 }],
        );
        let m = apply_extraction_rules(&s, "flying to BEIJING tomorrow").unwrap();
        assert_eq!(m.confidence, 0.6);
    }

    #[test]
    fn entity_dictionary_resolves_embedded_city_name() {
        let dict = EntityDictionary {
            entity_type: "city".to_string(),
            entries: vec![EntityEntry {
                canonical: "北京".to_string(),
                aliases: vec!["beijing".to_string()],
                weight: 0.8,
                metadata: serde_json::Value::Null,
            }],
        };
        let s = slot(SlotType::Entity, vec![]);
        let m = apply_entity_dictionary(&s, "从北京出发", &dict).unwrap();
        assert_eq!(m.original_text, "北京");
    }
}
