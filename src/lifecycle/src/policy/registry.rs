//! Policy registry
//!
//! Validates and persists policy definitions. Every mutation writes the
//! new state and an audit record together; a rejected definition leaves
//! nothing behind.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::config::RegistryConfig;
use tracing::{info, warn};

use super::definition::{Policy, PolicyAuditRecord, PolicyChange, PolicyDefinition, PolicyId};
use super::validator::PolicyValidator;
use crate::error::{LifecycleError, Result, StoreError, ValidationError};
use crate::store::LifecycleStore;

pub struct PolicyRegistry {
    store: Arc<dyn LifecycleStore>,
    validator: PolicyValidator,
    configured_namespaces: BTreeSet<String>,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn LifecycleStore>, config: &RegistryConfig) -> Self {
        Self {
            store,
            validator: PolicyValidator::from(config),
            configured_namespaces: config.known_namespaces.iter().cloned().collect(),
        }
    }

    /// Namespaces a selector may resolve to: owners of registered targets
    /// plus those declared in configuration.
    pub async fn known_namespaces(&self) -> Result<BTreeSet<String>> {
        let mut namespaces = self.store.list_namespaces().await?;
        namespaces.extend(self.configured_namespaces.iter().cloned());
        Ok(namespaces)
    }

    /// Run every check `register` would, without persisting anything.
    pub async fn validate(&self, definition: &PolicyDefinition) -> Result<()> {
        self.check(definition, None).await
    }

    async fn check(&self, definition: &PolicyDefinition, existing: Option<PolicyId>) -> Result<()> {
        let namespaces = self.known_namespaces().await?;
        self.validator.validate(definition, &namespaces)?;

        if let Some(other) = self.store.get_policy_by_name(&definition.name).await? {
            if Some(other.id) != existing {
                return Err(ValidationError::DuplicateName(definition.name.clone()).into());
            }
        }
        Ok(())
    }

    pub async fn register(&self, definition: PolicyDefinition, actor: &str) -> Result<Policy> {
        self.register_at(definition, actor, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        definition: PolicyDefinition,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy> {
        if let Err(e) = self.check(&definition, None).await {
            warn!(policy = %definition.name, error = %e, "Policy rejected");
            return Err(e);
        }

        let policy = Policy::new(definition, actor, now);
        let audit = PolicyAuditRecord::for_policy(&policy, PolicyChange::Registered);
        self.store
            .insert_policy(&policy, &audit)
            .await
            .map_err(|e| duplicate_or_store(e, policy.name()))?;

        info!(
            policy = %policy.name(),
            policy_id = %policy.id,
            priority = policy.priority(),
            action = %policy.action(),
            actor = %actor,
            "Policy registered"
        );
        Ok(policy)
    }

    /// Replace the definition of an existing policy.
    pub async fn update(
        &self,
        id: &PolicyId,
        definition: PolicyDefinition,
        actor: &str,
    ) -> Result<Policy> {
        let mut policy = self.get(id).await?;
        self.check(&definition, Some(policy.id)).await?;

        policy.definition = definition;
        touch(&mut policy, actor, Utc::now());
        let audit = PolicyAuditRecord::for_policy(&policy, PolicyChange::Updated);
        self.store
            .update_policy(&policy, &audit)
            .await
            .map_err(|e| duplicate_or_store(e, policy.name()))?;

        info!(policy = %policy.name(), policy_id = %policy.id, actor = %actor, "Policy updated");
        Ok(policy)
    }

    pub async fn enable(&self, id: &PolicyId, actor: &str) -> Result<Policy> {
        self.set_enabled(id, true, actor).await
    }

    pub async fn disable(&self, id: &PolicyId, actor: &str) -> Result<Policy> {
        self.set_enabled(id, false, actor).await
    }

    async fn set_enabled(&self, id: &PolicyId, enabled: bool, actor: &str) -> Result<Policy> {
        let mut policy = self.get(id).await?;
        if policy.is_enabled() == enabled {
            return Ok(policy);
        }

        policy.definition.enabled = enabled;
        touch(&mut policy, actor, Utc::now());
        let change = if enabled {
            PolicyChange::Enabled
        } else {
            PolicyChange::Disabled
        };
        let audit = PolicyAuditRecord::for_policy(&policy, change);
        self.store.update_policy(&policy, &audit).await?;

        info!(policy = %policy.name(), policy_id = %policy.id, enabled, actor = %actor, "Policy state changed");
        Ok(policy)
    }

    pub async fn get(&self, id: &PolicyId) -> Result<Policy> {
        self.store
            .get_policy(id)
            .await?
            .ok_or_else(|| LifecycleError::PolicyNotFound(id.to_string()))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Policy> {
        self.store
            .get_policy_by_name(name)
            .await?
            .ok_or_else(|| LifecycleError::PolicyNotFound(name.to_string()))
    }

    /// Look a policy up by id, falling back to its name.
    pub async fn resolve(&self, name_or_id: &str) -> Result<Policy> {
        if let Ok(id) = PolicyId::from_str(name_or_id) {
            if let Some(policy) = self.store.get_policy(&id).await? {
                return Ok(policy);
            }
        }
        self.get_by_name(name_or_id).await
    }

    /// All policies in processing order.
    pub async fn list(&self) -> Result<Vec<Policy>> {
        let mut policies = self.store.list_policies().await?;
        policies.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(policies)
    }

    pub async fn audit_trail(&self, id: &PolicyId) -> Result<Vec<PolicyAuditRecord>> {
        Ok(self.store.policy_audit(id).await?)
    }
}

/// Stamp a modification. Revisions must be strictly increasing because
/// compiled selectors are cached by modification time.
fn touch(policy: &mut Policy, actor: &str, now: DateTime<Utc>) {
    policy.modified_at = if now > policy.modified_at {
        now
    } else {
        policy.modified_at + Duration::milliseconds(1)
    };
    policy.modified_by = actor.to_string();
}

fn duplicate_or_store(error: StoreError, name: &str) -> LifecycleError {
    match error {
        StoreError::Conflict(_) => ValidationError::DuplicateName(name.to_string()).into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationErrorKind;
    use crate::policy::definition::{ActionParameters, ActionType, Condition, PolicyCategory};
    use crate::policy::selector::TargetSelector;
    use crate::store::InMemoryStore;

    fn registry() -> PolicyRegistry {
        let config = RegistryConfig {
            known_namespaces: vec!["sales".to_string()],
            ..Default::default()
        };
        PolicyRegistry::new(Arc::new(InMemoryStore::new()), &config)
    }

    fn definition(name: &str) -> PolicyDefinition {
        PolicyDefinition {
            name: name.to_string(),
            description: Some("compress old partitions".to_string()),
            selector: TargetSelector::namespace("sales").with_object_glob("orders.*"),
            category: PolicyCategory::Compression,
            action: ActionType::Compress,
            conditions: vec![Condition::AgeDays { min_days: 90 }],
            parameters: ActionParameters {
                compression_profile: Some("HIGH".to_string()),
                ..Default::default()
            },
            priority: 100,
            enabled: true,
        }
    }

    fn kind(err: LifecycleError) -> Option<ValidationErrorKind> {
        match err {
            LifecycleError::Validation(v) => Some(v.kind()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = registry();
        let policy = registry.register(definition("p1"), "alice").await.unwrap();

        assert_eq!(registry.get(&policy.id).await.unwrap(), policy);
        assert_eq!(registry.get_by_name("p1").await.unwrap().id, policy.id);
        assert_eq!(registry.resolve(&policy.id.to_string()).await.unwrap().id, policy.id);
        assert_eq!(registry.resolve("p1").await.unwrap().id, policy.id);
        assert!(matches!(
            registry.get_by_name("missing").await,
            Err(LifecycleError::PolicyNotFound(_))
        ));

        let trail = registry.audit_trail(&policy.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].change, PolicyChange::Registered);
        assert_eq!(trail[0].actor, "alice");
    }

    #[tokio::test]
    async fn test_rejections_persist_nothing() {
        let registry = registry();
        registry.register(definition("p1"), "alice").await.unwrap();

        let err = registry.register(definition("p1"), "bob").await.unwrap_err();
        assert_eq!(kind(err), Some(ValidationErrorKind::DuplicateName));

        let mut bad = definition("p2");
        bad.category = PolicyCategory::Purge;
        let err = registry.register(bad, "bob").await.unwrap_err();
        assert_eq!(kind(err), Some(ValidationErrorKind::CategoryActionMismatch));

        let mut unknown = definition("p3");
        unknown.selector = TargetSelector::namespace("finance");
        let err = registry.validate(&unknown).await.unwrap_err();
        assert_eq!(kind(err), Some(ValidationErrorKind::UnknownTarget));

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enable_disable_and_update_are_audited() {
        let registry = registry();
        let policy = registry.register(definition("p1"), "alice").await.unwrap();

        let disabled = registry.disable(&policy.id, "bob").await.unwrap();
        assert!(!disabled.is_enabled());
        assert!(disabled.modified_at > policy.modified_at);
        // No-op transitions are not audited
        registry.disable(&policy.id, "bob").await.unwrap();
        registry.enable(&policy.id, "carol").await.unwrap();

        let mut changed = definition("p1");
        changed.priority = 50;
        let updated = registry.update(&policy.id, changed, "dave").await.unwrap();
        assert_eq!(updated.priority(), 50);
        assert_eq!(updated.created_by, "alice");
        assert_eq!(updated.modified_by, "dave");

        let changes: Vec<PolicyChange> = registry
            .audit_trail(&policy.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.change)
            .collect();
        assert_eq!(
            changes,
            vec![
                PolicyChange::Registered,
                PolicyChange::Disabled,
                PolicyChange::Enabled,
                PolicyChange::Updated
            ]
        );
    }

    #[tokio::test]
    async fn test_list_orders_by_priority() {
        let registry = registry();
        let mut low = definition("low-priority");
        low.priority = 500;
        registry.register(low, "ops").await.unwrap();
        let mut high = definition("high-priority");
        high.priority = 5;
        registry.register(high, "ops").await.unwrap();

        let names: Vec<String> = registry
            .list()
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["high-priority", "low-priority"]);
    }
}
