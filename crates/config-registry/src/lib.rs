#![deny(missing_docs)]
//! Config Registry (C1, spec §4.3): loads intents/slots/functions/entity
//! dictionaries/templates from an external source at startup and on
//! invalidation, validates them, and exposes O(1)-on-hit synchronous
//! lookups over an immutable snapshot.
//!
//! Readers never block: they clone an `Arc<Snapshot>` under a
//! `std::sync::RwLock` read guard and then look up against their own
//! clone. Writers (reload/invalidation) build a brand new snapshot and
//! swap it in, matching the teacher's read-mostly `RwLock`-guarded
//! collections generalized to whole-snapshot swaps (spec §5 "Shared
//! resources").

mod validate;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use turnflow_core::config::{EntityDictionary, FunctionDef, Intent, Slot, SynonymGroup, Template};
use turnflow_core::error::ConfigError;
use turnflow_core::id::IntentName;

/// The raw, unvalidated config payload returned by a `ConfigSource`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RawConfig {
    /// All configured intents, valid or not.
    pub intents: Vec<Intent>,
    /// All configured entity dictionaries, keyed by `entity_type`.
    pub entity_dicts: Vec<EntityDictionary>,
    /// All configured templates.
    pub templates: Vec<Template>,
    /// All configured synonym groups.
    pub synonym_groups: Vec<SynonymGroup>,
}

/// External collaborator that supplies raw config (spec §1: admin CRUD
/// and the backing store are out of scope here).
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load the full current config.
    async fn load(&self) -> Result<RawConfig, ConfigError>;
}

struct Snapshot {
    intents: HashMap<IntentName, Intent>,
    entity_dicts: HashMap<String, EntityDictionary>,
    templates: HashMap<(String, Option<IntentName>), Template>,
    synonyms: HashMap<String, SynonymGroup>,
    version: u64,
}

/// A report of intents that failed validation during a load/reload, each
/// marked inactive in the resulting snapshot.
pub type ValidationReport = Vec<ConfigError>;

/// The config registry.
pub struct ConfigRegistry {
    source: Arc<dyn ConfigSource>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ConfigRegistry {
    /// Load config from `source` for the first time.
    pub async fn load(source: Arc<dyn ConfigSource>) -> Result<(Self, ValidationReport), ConfigError> {
        let raw = source.load().await?;
        let (snapshot, report) = build_snapshot(raw, 1);
        Ok((
            Self { source, snapshot: RwLock::new(Arc::new(snapshot)) },
            report,
        ))
    }

    /// Reload from the source, validating again and bumping the version
    /// salt used by NLU cache keys (spec §4.2 invalidation).
    pub async fn reload(&self) -> Result<ValidationReport, ConfigError> {
        let raw = self.source.load().await?;
        let next_version = self.snapshot.read().expect("snapshot lock poisoned").version + 1;
        let (snapshot, report) = build_snapshot(raw, next_version);
        let mut guard = self.snapshot.write().expect("snapshot lock poisoned");
        *guard = Arc::new(snapshot);
        for err in &report {
            tracing::warn!(error = %err, "intent failed validation on reload; marked inactive");
        }
        Ok(report)
    }

    /// A salt that changes every reload; mixed into NLU cache keys so a
    /// config change invalidates them without an explicit delete pass
    /// (spec §4.2 `intent_set_version`).
    pub fn intent_set_version(&self) -> u64 {
        self.snapshot.read().expect("snapshot lock poisoned").version
    }

    /// Look up a single intent by name, active or not.
    pub fn intent(&self, name: &IntentName) -> Option<Intent> {
        self.snapshot.read().expect("snapshot lock poisoned").intents.get(name).cloned()
    }

    /// All currently active intents.
    pub fn intents_active(&self) -> Vec<Intent> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .intents
            .values()
            .filter(|i| i.active)
            .cloned()
            .collect()
    }

    /// The slots of `intent`, or an empty slice if unknown.
    pub fn slots_of(&self, intent: &IntentName) -> Vec<Slot> {
        self.intent(intent).map(|i| i.slots).unwrap_or_default()
    }

    /// The dispatch function bound to `intent`, if any.
    pub fn function_of(&self, intent: &IntentName) -> Option<FunctionDef> {
        self.intent(intent).and_then(|i| i.function)
    }

    /// Look up an entity dictionary by entity type.
    pub fn entity_dict(&self, entity_type: &str) -> Option<EntityDictionary> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .entity_dicts
            .get(entity_type)
            .cloned()
    }

    /// Look up a template by type, optionally scoped to an intent; falls
    /// back to the global (`intent = None`) template of the same type.
    pub fn template(&self, template_type: &str, intent: Option<&IntentName>) -> Option<Template> {
        let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
        if let Some(intent) = intent {
            if let Some(t) = snapshot.templates.get(&(template_type.to_string(), Some(intent.clone()))) {
                return Some(t.clone());
            }
        }
        snapshot.templates.get(&(template_type.to_string(), None)).cloned()
    }

    /// Look up the synonym group a term belongs to, if any.
    pub fn synonyms(&self, term: &str) -> Option<SynonymGroup> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .synonyms
            .get(&term.to_lowercase())
            .cloned()
    }
}

fn build_snapshot(raw: RawConfig, version: u64) -> (Snapshot, ValidationReport) {
    let mut report = Vec::new();

    let templates: HashMap<(String, Option<IntentName>), Template> = raw
        .templates
        .into_iter()
        .map(|t| ((t.template_type.clone(), t.intent.clone()), t))
        .collect();
    let template_keys: std::collections::HashSet<(String, Option<IntentName>)> =
        templates.keys().cloned().collect();

    let mut intents = HashMap::new();
    for mut intent in raw.intents {
        if let Err(reason) = validate::validate_intent_shape(&intent, &template_keys) {
            report.push(ConfigError::InvalidIntent {
                intent: intent.name.to_string(),
                reason,
            });
            intent.active = false;
        }
        intents.insert(intent.name.clone(), intent);
    }

    let entity_dicts = raw.entity_dicts.into_iter().map(|d| (d.entity_type.clone(), d)).collect();

    let mut synonyms = HashMap::new();
    for group in raw.synonym_groups {
        for term in &group.terms {
            synonyms.insert(term.to_lowercase(), group.clone());
        }
        synonyms.insert(group.canonical.to_lowercase(), group.clone());
    }

    (Snapshot { intents, entity_dicts, templates, synonyms, version }, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(RawConfig);

    #[async_trait::async_trait]
    impl ConfigSource for FixedSource {
        async fn load(&self) -> Result<RawConfig, ConfigError> {
            Ok(self.0.clone())
        }
    }

    fn base_intent(name: &str) -> Intent {
        Intent {
            name: IntentName::new(name),
            display_name: name.to_string(),
            category: "test".to_string(),
            priority: 0,
            confidence_threshold: 0.7,
            examples: vec![],
            fallback_reply: "sorry".to_string(),
            active: true,
            slots: vec![],
            dependencies: vec![],
            function: None,
            cancel_category: None,
        }
    }

    #[tokio::test]
    async fn valid_intent_stays_active() {
        let source = Arc::new(FixedSource(RawConfig {
            intents: vec![base_intent("book_flight")],
            entity_dicts: vec![],
            templates: vec![],
            synonym_groups: vec![],
        }));
        let (registry, report) = ConfigRegistry::load(source).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(registry.intents_active().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_threshold_marks_intent_inactive() {
        let mut intent = base_intent("book_flight");
        intent.confidence_threshold = 1.5;
        let source = Arc::new(FixedSource(RawConfig {
            intents: vec![intent],
            entity_dicts: vec![],
            templates: vec![],
            synonym_groups: vec![],
        }));
        let (registry, report) = ConfigRegistry::load(source).await.unwrap();
        assert_eq!(report.len(), 1);
        assert!(registry.intents_active().is_empty());
        assert!(!registry.intent(&IntentName::new("book_flight")).unwrap().active);
    }

    #[tokio::test]
    async fn reload_bumps_intent_set_version() {
        let source = Arc::new(FixedSource(RawConfig {
            intents: vec![base_intent("book_flight")],
            entity_dicts: vec![],
            templates: vec![],
            synonym_groups: vec![],
        }));
        let (registry, _) = ConfigRegistry::load(source).await.unwrap();
        let v1 = registry.intent_set_version();
        registry.reload().await.unwrap();
        assert_eq!(registry.intent_set_version(), v1 + 1);
    }
}
