//! Validation (spec §4.5 "Validation"): per-slot rules in order, then
//! dependency gating over the effective slot map.

use std::collections::HashMap;
use turnflow_core::config::{CrossFieldOperator, DependencyKind, Intent, ValidationRule};
use turnflow_core::id::SlotName;
use turnflow_core::session::ValidationStatus;

/// The validation outcome for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotValidation {
    /// The resulting status.
    pub status: ValidationStatus,
    /// Error messages accumulated (only ever one, for the first failing
    /// rule — spec: "first failure marks the slot invalid").
    pub errors: Vec<String>,
}

/// Validate every slot of `intent` against `values` (normalized JSON
/// values keyed by slot name). Slots absent from `values` are not
/// reported — the caller treats "absent" and "missing required" as
/// distinct concerns (arbiter's `SlotPrompt` input).
pub fn validate_intent(
    intent: &Intent,
    values: &HashMap<SlotName, serde_json::Value>,
) -> HashMap<SlotName, SlotValidation> {
    let mut results = HashMap::new();

    for slot in &intent.slots {
        let Some(value) = values.get(&slot.name) else { continue };
        results.insert(slot.name.clone(), validate_slot(value, &slot.validation_rules, values));
    }

    for dep in &intent.dependencies {
        if dep.kind != DependencyKind::Required {
            continue;
        }
        let required_valid = results
            .get(&dep.required)
            .map(|r| r.status == ValidationStatus::Valid)
            .unwrap_or(false);
        if !required_valid {
            if let Some(dependent) = results.get_mut(&dep.dependent) {
                if dependent.status == ValidationStatus::Valid {
                    dependent.status = ValidationStatus::Pending;
                }
            }
        }
    }

    results
}

fn validate_slot(
    value: &serde_json::Value,
    rules: &[ValidationRule],
    all_values: &HashMap<SlotName, serde_json::Value>,
) -> SlotValidation {
    for rule in rules {
        if let Some(error) = check_rule(value, rule, all_values) {
            return SlotValidation { status: ValidationStatus::Invalid, errors: vec![error] };
        }
    }
    SlotValidation { status: ValidationStatus::Valid, errors: vec![] }
}

fn check_rule(
    value: &serde_json::Value,
    rule: &ValidationRule,
    all_values: &HashMap<SlotName, serde_json::Value>,
) -> Option<String> {
    match rule {
        ValidationRule::Pattern { pattern, message } => {
            let text = value.as_str()?;
            let re = regex::Regex::new(pattern).ok()?;
            if re.is_match(text) { None } else { Some(message.clone()) }
        }
        ValidationRule::Range { min, max, message } => {
            let n = value.as_f64()?;
            let below = min.is_some_and(|m| n < m);
            let above = max.is_some_and(|m| n > m);
            if below || above { Some(message.clone()) } else { None }
        }
        ValidationRule::AllowedSet { values, message } => {
            let text = value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string());
            if values.contains(&text) { None } else { Some(message.clone()) }
        }
        ValidationRule::Format { format, message } => match format.as_str() {
            "iso8601-date" => {
                let text = value.as_str()?;
                if chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok() {
                    None
                } else {
                    Some(message.clone())
                }
            }
            _ => None,
        },
        ValidationRule::CrossField { other_slot, operator, message } => {
            let other = all_values.get(other_slot)?;
            let ok = match operator {
                CrossFieldOperator::NotEqual => value != other,
                CrossFieldOperator::GreaterThan => compare(value, other)? == std::cmp::Ordering::Greater,
                CrossFieldOperator::LessThan => compare(value, other)? == std::cmp::Ordering::Less,
            };
            if ok { None } else { Some(message.clone()) }
        }
    }
}

fn compare(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}
