//! Policy validation
//!
//! Runs every structural check on a definition before anything is
//! persisted. Name uniqueness needs the store and is checked by the
//! registry.

use std::collections::BTreeSet;

use common::config::RegistryConfig;

use super::definition::{Condition, PolicyDefinition};
use super::selector::CompiledSelector;
use crate::error::ValidationError;

#[derive(Debug, Clone)]
pub struct PolicyValidator {
    priority_min: u32,
    priority_max: u32,
}

impl From<&RegistryConfig> for PolicyValidator {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            priority_min: config.priority_min,
            priority_max: config.priority_max,
        }
    }
}

impl PolicyValidator {
    pub fn new(priority_min: u32, priority_max: u32) -> Self {
        Self {
            priority_min,
            priority_max,
        }
    }

    /// Validate `definition` against the namespaces currently known to
    /// the system. Returns the compiled selector on success.
    pub fn validate(
        &self,
        definition: &PolicyDefinition,
        known_namespaces: &BTreeSet<String>,
    ) -> Result<CompiledSelector, ValidationError> {
        if definition.name.trim().is_empty() {
            return Err(ValidationError::InvalidName(
                "policy name must not be empty".to_string(),
            ));
        }

        let selector = definition.selector.compile()?;
        if !known_namespaces
            .iter()
            .any(|ns| selector.matches_namespace(ns))
        {
            return Err(ValidationError::UnknownTarget {
                namespace: definition.selector.namespace.clone(),
            });
        }

        if !definition.category.permits(definition.action) {
            return Err(ValidationError::CategoryActionMismatch {
                category: definition.category,
                action: definition.action,
            });
        }

        if let Some(parameter) = definition.action.required_parameter() {
            if !definition.parameters.has(parameter) {
                return Err(ValidationError::MissingParameter {
                    action: definition.action,
                    parameter,
                });
            }
        }

        if definition.conditions.is_empty() {
            return Err(ValidationError::NoCondition);
        }
        for condition in &definition.conditions {
            validate_condition(condition)?;
        }

        if definition.priority < self.priority_min || definition.priority > self.priority_max {
            return Err(ValidationError::PriorityOutOfRange {
                priority: definition.priority,
                min: self.priority_min,
                max: self.priority_max,
            });
        }

        if definition.parameters.parallel_degree == Some(0) {
            return Err(ValidationError::InvalidCondition(
                "parallel_degree must be at least 1".to_string(),
            ));
        }

        Ok(selector)
    }
}

fn validate_condition(condition: &Condition) -> Result<(), ValidationError> {
    match condition {
        Condition::AgeMonths { min_months: 0 } => Err(ValidationError::InvalidCondition(
            "age_months threshold must be at least 1".to_string(),
        )),
        Condition::SizeAtLeast { min_bytes: 0 } => Err(ValidationError::InvalidCondition(
            "size_at_least threshold must be positive".to_string(),
        )),
        Condition::Custom { predicate } => predicate.validate(),
        _ => Ok(()),
    }
}
