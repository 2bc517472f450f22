//! Target selectors
//!
//! A selector names a namespace (owner) glob, an optional object pattern
//! matched against `name` or `name.subobject`, and optional tag filters.
//! Selectors are compiled once per policy revision and cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::definition::{Policy, PolicyId};
use crate::error::ValidationError;
use crate::target::TargetObject;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelector {
    /// Glob over target owners, `*` and `?` wildcards
    pub namespace: String,
    #[serde(default)]
    pub object: ObjectPattern,
    /// Tags a target must carry with exactly these values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum ObjectPattern {
    #[default]
    Any,
    Glob(String),
    Regex(String),
}

impl TargetSelector {
    /// Every object in namespaces matching `namespace`.
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object: ObjectPattern::Any,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_object_glob(mut self, pattern: &str) -> Self {
        self.object = ObjectPattern::Glob(pattern.to_string());
        self
    }

    pub fn with_object_regex(mut self, pattern: &str) -> Self {
        self.object = ObjectPattern::Regex(pattern.to_string());
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn compile(&self) -> Result<CompiledSelector, ValidationError> {
        if self.namespace.trim().is_empty() {
            return Err(ValidationError::InvalidSelector {
                pattern: self.namespace.clone(),
                message: "namespace pattern must not be empty".to_string(),
            });
        }
        let namespace = compile_pattern(&self.namespace, &glob_to_regex(&self.namespace))?;

        let object = match &self.object {
            ObjectPattern::Any => None,
            ObjectPattern::Glob(glob) => Some(compile_pattern(glob, &glob_to_regex(glob))?),
            ObjectPattern::Regex(pattern) => {
                Some(compile_pattern(pattern, &format!("^(?:{pattern})$"))?)
            }
        };

        Ok(CompiledSelector {
            namespace,
            object,
            tags: self.tags.clone(),
        })
    }
}

fn compile_pattern(source: &str, regex: &str) -> Result<Regex, ValidationError> {
    Regex::new(regex).map_err(|e| ValidationError::InvalidSelector {
        pattern: source.to_string(),
        message: e.to_string(),
    })
}

/// Translate a `*`/`?` glob into an anchored regular expression.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// A selector ready for matching
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    namespace: Regex,
    object: Option<Regex>,
    tags: BTreeMap<String, String>,
}

impl CompiledSelector {
    pub fn matches_namespace(&self, owner: &str) -> bool {
        self.namespace.is_match(owner)
    }

    pub fn matches(&self, target: &TargetObject) -> bool {
        if !self.matches_namespace(&target.owner) {
            return false;
        }
        if let Some(object) = &self.object {
            if !object.is_match(&target.object_path()) {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(key, value)| target.tags.get(key) == Some(value))
    }
}

/// Compiled selectors keyed by policy, invalidated when the policy changes
#[derive(Debug, Default)]
pub struct SelectorCache {
    entries: Mutex<HashMap<PolicyId, (DateTime<Utc>, Arc<CompiledSelector>)>>,
}

impl SelectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, policy: &Policy) -> Result<Arc<CompiledSelector>, ValidationError> {
        let mut entries = self.entries.lock().await;
        if let Some((revision, compiled)) = entries.get(&policy.id) {
            if *revision == policy.modified_at {
                return Ok(compiled.clone());
            }
        }
        let compiled = Arc::new(policy.definition.selector.compile()?);
        entries.insert(policy.id, (policy.modified_at, compiled.clone()));
        Ok(compiled)
    }

    /// Drop entries for policies that no longer exist.
    pub async fn retain(&self, live: &[PolicyId]) {
        self.entries.lock().await.retain(|id, _| live.contains(id));
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::definition::{ActionType, PolicyCategory, PolicyDefinition};
    use crate::policy::definition::{ActionParameters, Condition};

    fn target(owner: &str, name: &str, sub: Option<&str>) -> TargetObject {
        TargetObject {
            owner: owner.to_string(),
            name: name.to_string(),
            subobject: sub.map(str::to_string),
            size_bytes: 1,
            created_at: Utc::now(),
            tier: "standard".to_string(),
            compression_profile: "NONE".to_string(),
            read_only: false,
            tags: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        }
    }

    #[test]
    fn test_glob_translation_escapes_metacharacters() {
        assert_eq!(glob_to_regex("sales_*"), "^sales_.*$");
        assert_eq!(glob_to_regex("a.b?"), r"^a\.b.$");
    }

    #[test]
    fn test_namespace_and_object_matching() {
        let selector = TargetSelector::namespace("sales*")
            .with_object_glob("orders.*")
            .compile()
            .unwrap();
        assert!(selector.matches(&target("sales", "orders", Some("p2024_01"))));
        assert!(selector.matches(&target("sales_eu", "orders", Some("p1"))));
        assert!(!selector.matches(&target("sales", "orders", None)));
        assert!(!selector.matches(&target("hr", "orders", Some("p1"))));
        assert!(!selector.matches(&target("sales", "customers", Some("p1"))));

        let by_regex = TargetSelector::namespace("sales")
            .with_object_regex(r"orders\.p20(23|24)_\d{2}")
            .compile()
            .unwrap();
        assert!(by_regex.matches(&target("sales", "orders", Some("p2023_11"))));
        assert!(!by_regex.matches(&target("sales", "orders", Some("p2022_11"))));
    }

    #[test]
    fn test_tag_filters() {
        let prod = TargetSelector::namespace("*")
            .with_tag("env", "prod")
            .compile()
            .unwrap();
        assert!(prod.matches(&target("sales", "orders", None)));

        let dev = TargetSelector::namespace("*")
            .with_tag("env", "dev")
            .compile()
            .unwrap();
        assert!(!dev.matches(&target("sales", "orders", None)));
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        let err = TargetSelector::namespace("sales")
            .with_object_regex("orders(")
            .compile()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSelector { .. }));

        assert!(TargetSelector::namespace("  ").compile().is_err());
    }

    #[tokio::test]
    async fn test_cache_recompiles_after_modification() {
        let definition = PolicyDefinition {
            name: "p".to_string(),
            description: None,
            selector: TargetSelector::namespace("sales"),
            category: PolicyCategory::Purge,
            action: ActionType::Drop,
            conditions: vec![Condition::AgeDays { min_days: 1 }],
            parameters: ActionParameters::default(),
            priority: 1,
            enabled: true,
        };
        let mut policy = Policy::new(definition, "test", Utc::now());
        let cache = SelectorCache::new();

        let first = cache.get(&policy).await.unwrap();
        assert!(first.matches_namespace("sales"));
        let again = cache.get(&policy).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        policy.definition.selector = TargetSelector::namespace("hr");
        policy.modified_at = policy.modified_at + chrono::Duration::seconds(1);
        let updated = cache.get(&policy).await.unwrap();
        assert!(updated.matches_namespace("hr"));
        assert!(!updated.matches_namespace("sales"));
        assert_eq!(cache.len().await, 1);

        cache.retain(&[]).await;
        assert_eq!(cache.len().await, 0);
    }
}
