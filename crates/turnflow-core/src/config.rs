//! Config-time data model (spec §3): intents, slots, dependencies, entity
//! dictionaries, and the function definitions they dispatch to. Created
//! and updated out-of-band (admin CRUD is an external collaborator, spec
//! §1); from the core's perspective this is read-only, cached config.

use crate::id::{IntentName, SlotName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured intent: a labeled user goal with a fixed slot schema and
/// an optional function to invoke once filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique, stable identifier.
    pub name: IntentName,
    /// Human-facing name.
    pub display_name: String,
    /// Grouping category (for admin UIs and metrics; opaque to the core).
    pub category: String,
    /// Higher priority wins ties between otherwise-equal candidates.
    pub priority: i32,
    /// Confidence threshold τᵢ ∈ [0,1] the classifier's top candidate
    /// must clear for this intent to be selected outright.
    pub confidence_threshold: f64,
    /// Example utterances used as lexical training data and/or included
    /// in the LLM classification prompt.
    pub examples: Vec<String>,
    /// Reply used when this intent is reached but cannot proceed (rare;
    /// most replies come from templates).
    pub fallback_reply: String,
    /// Whether this intent is eligible for classification. Set to
    /// `false` automatically when config validation fails (spec §4.3).
    pub active: bool,
    /// This intent's slot schema, in extraction-priority order is NOT
    /// guaranteed here — see `Slot::extraction_priority`.
    pub slots: Vec<Slot>,
    /// Directed dependency edges between this intent's slots.
    pub dependencies: Vec<SlotDependency>,
    /// The function to invoke once all required slots are valid, if any.
    pub function: Option<FunctionDef>,
    /// Categorizes this intent for the arbiter's `Cancel` decision (spec
    /// §4.6): `Cancel` clears the in-progress intent, `Postpone` suspends
    /// it (resumable), `Reject` acknowledges a declined suggestion
    /// without touching the in-progress intent. `None` for ordinary
    /// intents.
    #[serde(default)]
    pub cancel_category: Option<CancelCategory>,
}

/// The three-way category an intent can take in the arbiter's `Cancel`
/// decision (spec §4.6 arbiter table: cancel/postpone/reject are
/// distinct outcomes, not one collapsed behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCategory {
    /// Clears the session's in-progress intent outright.
    Cancel,
    /// Suspends the in-progress intent; resumable on a later turn.
    Postpone,
    /// Rejects a previously suggested candidate; the in-progress intent,
    /// if any, is left untouched.
    Reject,
}

/// A slot belonging to exactly one intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    /// Name, unique within the owning intent.
    pub name: SlotName,
    /// The slot's declared type.
    pub slot_type: SlotType,
    /// For `SlotType::Entity` slots, the entity dictionary to resolve
    /// against (`EntityDictionary::entity_type`). Ignored otherwise.
    #[serde(default)]
    pub entity_type: Option<String>,
    /// Whether a value must be present (and valid) before dispatch.
    pub required: bool,
    /// Whether this slot accepts multiple values.
    #[serde(default)]
    pub list: bool,
    /// Validation rules applied in order; the first failure wins.
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Value used when extraction yields nothing and the slot is not
    /// required.
    pub default_value: Option<serde_json::Value>,
    /// Template used to prompt the user when this slot is missing or
    /// invalid.
    pub prompt_template: String,
    /// Slots are extracted in descending priority order (spec §4.5).
    pub extraction_priority: i32,
    /// Rule-based extractors tried before falling back to the LLM.
    #[serde(default)]
    pub extraction_rules: Vec<ExtractionRule>,
    /// For `SlotType::Boolean` slots, the configured token list to
    /// normalize against. `None` falls back to the built-in default list
    /// (spec §4.5: "booleans map from a configured token list").
    #[serde(default)]
    pub boolean_tokens: Option<BooleanTokens>,
}

/// Token lists a `SlotType::Boolean` slot normalizes raw text against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BooleanTokens {
    /// Tokens (matched trimmed, case-insensitive) that normalize to `true`.
    pub true_tokens: Vec<String>,
    /// Tokens that normalize to `false`.
    pub false_tokens: Vec<String>,
}

/// The type of value a slot holds. Drives normalization (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    /// Free text, no further normalization.
    Text,
    /// Numeric, grouped-form parsing (e.g. "1,000").
    Number,
    /// A calendar date, including relative forms ("tomorrow").
    Date,
    /// A time of day.
    Time,
    /// A combined date and time.
    DateTime,
    /// An email address.
    Email,
    /// A phone number.
    Phone,
    /// A value resolved against an entity dictionary.
    Entity,
    /// A boolean, mapped from a configured token list.
    Boolean,
}

/// A single validation rule attached to a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Value must match this regex.
    Pattern {
        /// The regex pattern (validated to compile at config load time).
        pattern: String,
        /// Message surfaced to the user on failure.
        message: String,
    },
    /// Numeric/date/time bounds.
    Range {
        /// Inclusive minimum, if any (compared after normalization).
        min: Option<f64>,
        /// Inclusive maximum, if any.
        max: Option<f64>,
        /// Message surfaced to the user on failure.
        message: String,
    },
    /// Value must be one of a fixed set.
    AllowedSet {
        /// The permitted normalized values.
        values: Vec<String>,
        /// Message surfaced to the user on failure.
        message: String,
    },
    /// Value must match a named built-in format (e.g. "iso8601-date").
    Format {
        /// Format name understood by the validator.
        format: String,
        /// Message surfaced to the user on failure.
        message: String,
    },
    /// Declarative cross-slot comparison, e.g. `return_date > departure_date`.
    CrossField {
        /// The other slot this rule compares against.
        other_slot: SlotName,
        /// Comparison operator.
        operator: CrossFieldOperator,
        /// Message surfaced to the user on failure.
        message: String,
    },
}

/// Comparison operators for `ValidationRule::CrossField`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossFieldOperator {
    /// This slot's value must be strictly greater than the other's.
    GreaterThan,
    /// This slot's value must be strictly less than the other's.
    LessThan,
    /// This slot's value must differ from the other's.
    NotEqual,
}

/// A rule-based slot extractor tried before the LLM (spec §4.5 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionRule {
    /// Match a regex capture group against the input text.
    Regex {
        /// The pattern to match.
        pattern: String,
        /// Confidence contributed when this rule fires.
        confidence_boost: f64,
    },
    /// Match one of a fixed set of keywords (case-insensitive).
    Keyword {
        /// The keywords to look for.
        keywords: Vec<String>,
        /// Confidence contributed when this rule fires.
        confidence_boost: f64,
    },
}

/// A directed dependency edge between two slots of the same intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDependency {
    /// The slot that depends on another.
    pub dependent: SlotName,
    /// The slot it depends on.
    pub required: SlotName,
    /// The nature of the dependency.
    pub kind: DependencyKind,
    /// Optional predicate, evaluated over the effective slot map, that
    /// must hold for the dependency to apply.
    pub condition: Option<String>,
}

/// The kind of a slot dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// `dependent` cannot be valid until `required` is valid.
    Required,
    /// `dependent` only applies when `condition` holds.
    Conditional,
    /// `dependent` and `required` cannot both be filled.
    Exclusive,
    /// Informational relation; does not gate validity.
    Related,
}

/// An entity dictionary: entity type to canonical entries, for
/// `SlotType::Entity` resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDictionary {
    /// The entity type this dictionary covers (e.g. "city").
    pub entity_type: String,
    /// Canonical entries.
    pub entries: Vec<EntityEntry>,
}

/// One canonical entry in an entity dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// The canonical form returned on a match.
    pub canonical: String,
    /// Alternate surface forms, matched case- and whitespace-insensitively.
    pub aliases: Vec<String>,
    /// Relative weight, used to break ties between overlapping matches.
    pub weight: f64,
    /// Free-form metadata passed through to the caller.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EntityDictionary {
    /// Look up a surface form, matching case- and whitespace-insensitively.
    pub fn resolve(&self, surface: &str) -> Option<&EntityEntry> {
        let needle = normalize_for_match(surface);
        self.entries
            .iter()
            .filter(|e| {
                normalize_for_match(&e.canonical) == needle
                    || e.aliases.iter().any(|a| normalize_for_match(a) == needle)
            })
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal))
    }
}

fn normalize_for_match(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// The external function an intent dispatches to once filled (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Name, used in idempotency key derivation and logs.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Request headers; values may contain `${VAR}` placeholders resolved
    /// against the environment/secret source before each call.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Maps slot names to JSON field paths in the request body.
    pub parameter_mapping: HashMap<SlotName, String>,
    /// Total per-call timeout.
    pub timeout_ms: u64,
    /// Maximum retry attempts for transient failures.
    pub retry_count: u32,
    /// `${path}`-interpolated template for a successful response.
    pub success_template: String,
    /// `${error_message}`/`${attempts}`-interpolated template for a
    /// failed response.
    pub error_template: String,
    /// If true, or if `expected_duration_ms` exceeds the async threshold,
    /// the dispatcher delegates to the async task manager instead of
    /// calling synchronously (spec §4.7 "Long-running calls").
    #[serde(default)]
    pub asynchronous: bool,
    /// Best-effort expected call duration, used for the async-threshold
    /// decision.
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,
}

/// HTTP method for a `FunctionDef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

/// A named response/prompt template (spec §4.3 `template(type, intent?)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier, e.g. `"intent_recognition"`, `"slot_filling"`.
    pub template_type: String,
    /// The intent this template is scoped to, or `None` for a global
    /// template.
    pub intent: Option<IntentName>,
    /// Raw template body with `${field}` placeholders.
    pub body: String,
}

/// A synonym group: a set of interchangeable terms sharing a canonical
/// form, looked up via `synonyms(term) → group` (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynonymGroup {
    /// Stable group id.
    pub id: String,
    /// The canonical term, used as the lexical match's display form.
    pub canonical: String,
    /// Every term (including the canonical one) that maps to this group.
    pub terms: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_dictionary_resolves_case_and_whitespace_insensitively() {
        let dict = EntityDictionary {
            entity_type: "city".into(),
            entries: vec![EntityEntry {
                canonical: "Beijing".into(),
                aliases: vec!["  beijing  ".into(), "北京".into()],
                weight: 1.0,
                metadata: serde_json::Value::Null,
            }],
        };
        assert_eq!(dict.resolve("BEIJING").unwrap().canonical, "Beijing");
        assert_eq!(dict.resolve("北京").unwrap().canonical, "Beijing");
        assert!(dict.resolve("shanghai").is_none());
    }

    #[test]
    fn entity_dictionary_breaks_ties_by_weight() {
        let dict = EntityDictionary {
            entity_type: "airport".into(),
            entries: vec![
                EntityEntry {
                    canonical: "PEK".into(),
                    aliases: vec!["beijing".into()],
                    weight: 0.5,
                    metadata: serde_json::Value::Null,
                },
                EntityEntry {
                    canonical: "PKX".into(),
                    aliases: vec!["beijing".into()],
                    weight: 0.9,
                    metadata: serde_json::Value::Null,
                },
            ],
        };
        assert_eq!(dict.resolve("beijing").unwrap().canonical, "PKX");
    }
}
