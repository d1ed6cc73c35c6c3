//! Config-load-time validation (spec §4.3): acyclic dependency graphs,
//! compiling regexes, and placeholder references that resolve against
//! the owning intent's slot schema.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use turnflow_core::config::{CancelCategory, ExtractionRule, Intent, SlotType, ValidationRule};
use turnflow_core::id::IntentName;

/// Extract `${name}` placeholders from a template body, in first-seen
/// order, de-duplicated.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + end];
                if seen.insert(name.to_string()) {
                    out.push(name.to_string());
                }
                i += 2 + end + 1;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Validate that `intent`'s slot dependency graph contains no cycle.
/// Returns the name of a slot participating in a cycle, if any.
pub fn find_dependency_cycle(intent: &Intent) -> Option<String> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in &intent.dependencies {
        edges.entry(dep.dependent.as_str()).or_default().push(dep.required.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node.to_string()),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if let Some(cycle_node) = visit(dep, edges, marks) {
                    return Some(cycle_node);
                }
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    for slot in &intent.slots {
        if let Some(cycle_node) = visit(slot.name.as_str(), &edges, &mut marks) {
            return Some(cycle_node);
        }
    }
    None
}

/// Whether `template_type` (optionally scoped to `intent`) resolves in
/// `templates`, falling back to the global (`intent = None`) entry of the
/// same type — mirrors `ConfigRegistry::template`'s own lookup order.
fn template_exists(
    templates: &HashSet<(String, Option<IntentName>)>,
    template_type: &str,
    intent: Option<&IntentName>,
) -> bool {
    if let Some(intent) = intent {
        if templates.contains(&(template_type.to_string(), Some(intent.clone()))) {
            return true;
        }
    }
    templates.contains(&(template_type.to_string(), None))
}

/// Validate that every compiled-regex-bearing rule on `intent` compiles,
/// that placeholder templates only reference known names, that every
/// validation rule's shape is compatible with its slot's declared type,
/// and that every template this intent would need at runtime actually
/// resolves in `templates` (scoped or global). Returns the first failure
/// reason, if any.
pub fn validate_intent_shape(
    intent: &Intent,
    templates: &HashSet<(String, Option<IntentName>)>,
) -> Result<(), String> {
    if intent.name.as_str().is_empty() {
        return Err("intent name must not be empty".to_string());
    }
    if !(0.0..=1.0).contains(&intent.confidence_threshold) {
        return Err(format!(
            "confidence_threshold {} out of range [0,1]",
            intent.confidence_threshold
        ));
    }

    if let Some(cycle_node) = find_dependency_cycle(intent) {
        return Err(format!("dependency cycle involving slot '{cycle_node}'"));
    }

    let slot_names: HashSet<&str> = intent.slots.iter().map(|s| s.name.as_str()).collect();

    for slot in &intent.slots {
        for rule in &slot.validation_rules {
            if let ValidationRule::Pattern { pattern, .. } = rule {
                Regex::new(pattern)
                    .map_err(|e| format!("slot '{}' pattern rule does not compile: {e}", slot.name))?;
            }
            if let ValidationRule::CrossField { other_slot, .. } = rule {
                if !slot_names.contains(other_slot.as_str()) {
                    return Err(format!(
                        "slot '{}' cross-field rule references unknown slot '{}'",
                        slot.name, other_slot
                    ));
                }
            }
            match rule {
                ValidationRule::Range { .. } if slot.slot_type != SlotType::Number => {
                    return Err(format!(
                        "slot '{}' declares a range rule but its type {:?} does not normalize to a number",
                        slot.name, slot.slot_type
                    ));
                }
                ValidationRule::Pattern { .. } | ValidationRule::Format { .. }
                    if matches!(slot.slot_type, SlotType::Number | SlotType::Boolean) =>
                {
                    return Err(format!(
                        "slot '{}' declares a pattern/format rule but its type {:?} does not normalize to text",
                        slot.name, slot.slot_type
                    ));
                }
                _ => {}
            }
        }
        for rule in &slot.extraction_rules {
            if let ExtractionRule::Regex { pattern, .. } = rule {
                Regex::new(pattern)
                    .map_err(|e| format!("slot '{}' extraction regex does not compile: {e}", slot.name))?;
            }
        }

        let placeholders = extract_placeholders(&slot.prompt_template);
        for name in &placeholders {
            if name != &slot.name.as_str().to_string() && !slot_names.contains(name.as_str()) {
                return Err(format!(
                    "slot '{}' prompt template references unknown placeholder '{name}'",
                    slot.name
                ));
            }
        }
    }

    if let Some(function) = &intent.function {
        let allowed: HashSet<&str> = ["error_message", "attempts"].into_iter().collect();
        for name in extract_placeholders(&function.error_template) {
            if !allowed.contains(name.as_str()) {
                return Err(format!(
                    "function '{}' error template references unknown placeholder '{name}'",
                    function.name
                ));
            }
        }
        for slot_name in function.parameter_mapping.keys() {
            if !slot_names.contains(slot_name.as_str()) {
                return Err(format!(
                    "function '{}' parameter mapping references unknown slot '{}'",
                    function.name, slot_name
                ));
            }
        }
    }

    for dep in &intent.dependencies {
        if dep.dependent == dep.required {
            return Err(format!("slot '{}' cannot depend on itself", dep.dependent));
        }
    }

    if !intent.slots.is_empty() && !template_exists(templates, "slot_filling", Some(&intent.name)) {
        return Err(format!(
            "intent '{}' has slots but no 'slot_filling' template resolves for it (scoped or global)",
            intent.name
        ));
    }

    if let Some(category) = intent.cancel_category {
        let template_type = match category {
            CancelCategory::Cancel => "cancellation_confirmation",
            CancelCategory::Postpone => "postponement_confirmation",
            CancelCategory::Reject => "rejection_acknowledgment",
        };
        if !template_exists(templates, template_type, Some(&intent.name)) {
            return Err(format!(
                "intent '{}' is configured as {category:?} but no '{template_type}' template resolves for it (scoped or global)",
                intent.name
            ));
        }
    }

    Ok(())
}
