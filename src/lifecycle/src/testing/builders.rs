//! Builders for policy definitions and targets.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::policy::{
    ActionParameters, ActionType, Condition, PolicyCategory, PolicyDefinition, Predicate,
    TargetSelector,
};
use crate::target::{NO_COMPRESSION, TargetObject};
use crate::tracker::Temperature;

/// Builds a [`PolicyDefinition`]. Defaults to a compression policy with
/// profile `HIGH` at priority 100 and no conditions.
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    definition: PolicyDefinition,
}

impl PolicyBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            definition: PolicyDefinition {
                name: name.to_string(),
                description: None,
                selector: TargetSelector::namespace(namespace),
                category: PolicyCategory::Compression,
                action: ActionType::Compress,
                conditions: Vec::new(),
                parameters: ActionParameters {
                    compression_profile: Some("HIGH".to_string()),
                    ..Default::default()
                },
                priority: 100,
                enabled: true,
            },
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.definition.description = Some(description.to_string());
        self
    }

    pub fn compress(mut self, profile: &str) -> Self {
        self.definition.category = PolicyCategory::Compression;
        self.definition.action = ActionType::Compress;
        self.definition.parameters.compression_profile = Some(profile.to_string());
        self
    }

    pub fn move_to(mut self, tier: &str) -> Self {
        self.definition.category = PolicyCategory::Tiering;
        self.definition.action = ActionType::Move;
        self.definition.parameters.compression_profile = None;
        self.definition.parameters.destination_tier = Some(tier.to_string());
        self
    }

    pub fn mark_read_only(mut self) -> Self {
        self.definition.category = PolicyCategory::Archival;
        self.definition.action = ActionType::MarkReadOnly;
        self.definition.parameters.compression_profile = None;
        self
    }

    pub fn purge(mut self) -> Self {
        self.definition.category = PolicyCategory::Purge;
        self.definition.action = ActionType::Drop;
        self.definition.parameters.compression_profile = None;
        self
    }

    pub fn custom(mut self, operation: &str) -> Self {
        self.definition.category = PolicyCategory::Custom;
        self.definition.action = ActionType::Custom;
        self.definition.parameters.compression_profile = None;
        self.definition.parameters.custom_operation = Some(operation.to_string());
        self
    }

    /// Override the category without touching the action.
    pub fn category(mut self, category: PolicyCategory) -> Self {
        self.definition.category = category;
        self
    }

    pub fn parameters(mut self, parameters: ActionParameters) -> Self {
        self.definition.parameters = parameters;
        self
    }

    pub fn object_glob(mut self, pattern: &str) -> Self {
        self.definition.selector = self.definition.selector.with_object_glob(pattern);
        self
    }

    pub fn object_regex(mut self, pattern: &str) -> Self {
        self.definition.selector = self.definition.selector.with_object_regex(pattern);
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.definition.selector = self.definition.selector.with_tag(key, value);
        self
    }

    pub fn older_than_days(self, min_days: u32) -> Self {
        self.condition(Condition::AgeDays { min_days })
    }

    pub fn older_than_months(self, min_months: u32) -> Self {
        self.condition(Condition::AgeMonths { min_months })
    }

    pub fn larger_than(self, min_bytes: u64) -> Self {
        self.condition(Condition::SizeAtLeast { min_bytes })
    }

    pub fn at_least(self, class: Temperature) -> Self {
        self.condition(Condition::Temperature { class })
    }

    pub fn matching(self, predicate: Predicate) -> Self {
        self.condition(Condition::Custom { predicate })
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.definition.conditions.push(condition);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.definition.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.definition.enabled = false;
        self
    }

    pub fn parallel_degree(mut self, degree: u32) -> Self {
        self.definition.parameters.parallel_degree = Some(degree);
        self
    }

    pub fn refresh_statistics(mut self) -> Self {
        self.definition.parameters.refresh_statistics = true;
        self
    }

    pub fn rebuild_secondary_structures(mut self) -> Self {
        self.definition.parameters.rebuild_secondary_structures = true;
        self
    }

    pub fn build(self) -> PolicyDefinition {
        self.definition
    }
}

/// Builds a [`TargetObject`]. Defaults to an uncompressed, writable 1 GiB
/// object on the `standard` tier created at the Unix epoch.
#[derive(Debug, Clone)]
pub struct TargetBuilder {
    target: TargetObject,
}

impl TargetBuilder {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            target: TargetObject {
                owner: owner.to_string(),
                name: name.to_string(),
                subobject: None,
                size_bytes: 1 << 30,
                created_at: DateTime::<Utc>::UNIX_EPOCH,
                tier: "standard".to_string(),
                compression_profile: NO_COMPRESSION.to_string(),
                read_only: false,
                tags: BTreeMap::new(),
            },
        }
    }

    pub fn subobject(mut self, subobject: &str) -> Self {
        self.target.subobject = Some(subobject.to_string());
        self
    }

    pub fn size(mut self, size_bytes: u64) -> Self {
        self.target.size_bytes = size_bytes;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.target.created_at = created_at;
        self
    }

    /// Created `days` before `now`.
    pub fn aged_days(self, days: i64, now: DateTime<Utc>) -> Self {
        self.created_at(now - Duration::days(days))
    }

    pub fn tier(mut self, tier: &str) -> Self {
        self.target.tier = tier.to_string();
        self
    }

    pub fn compressed(mut self, profile: &str) -> Self {
        self.target.compression_profile = profile.to_string();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.target.read_only = true;
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.target.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TargetObject {
        self.target
    }
}
