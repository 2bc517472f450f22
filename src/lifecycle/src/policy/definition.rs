//! Policy definitions
//!
//! A policy couples a target selector with a category, a single action,
//! the conditions under which it applies and a priority. Lower priority
//! values run first.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::predicate::Predicate;
use super::selector::TargetSelector;
use crate::tracker::Temperature;

/// Unique identifier of a registered policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(Uuid);

impl PolicyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PolicyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCategory {
    Compression,
    Tiering,
    Archival,
    Purge,
    Custom,
}

impl PolicyCategory {
    /// Actions a policy of this category may perform.
    pub fn allowed_actions(self) -> &'static [ActionType] {
        match self {
            PolicyCategory::Compression => &[ActionType::Compress],
            PolicyCategory::Tiering => &[ActionType::Move, ActionType::MarkReadOnly],
            PolicyCategory::Archival => &[
                ActionType::Move,
                ActionType::Compress,
                ActionType::MarkReadOnly,
            ],
            PolicyCategory::Purge => &[ActionType::Drop],
            PolicyCategory::Custom => &[
                ActionType::Compress,
                ActionType::Move,
                ActionType::MarkReadOnly,
                ActionType::Drop,
                ActionType::Custom,
            ],
        }
    }

    pub fn permits(self, action: ActionType) -> bool {
        self.allowed_actions().contains(&action)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyCategory::Compression => "compression",
            PolicyCategory::Tiering => "tiering",
            PolicyCategory::Archival => "archival",
            PolicyCategory::Purge => "purge",
            PolicyCategory::Custom => "custom",
        }
    }
}

impl fmt::Display for PolicyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Compress,
    Move,
    MarkReadOnly,
    Drop,
    Custom,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Compress => "compress",
            ActionType::Move => "move",
            ActionType::MarkReadOnly => "mark-read-only",
            ActionType::Drop => "drop",
            ActionType::Custom => "custom",
        }
    }

    /// Parameter that must be present for this action.
    pub fn required_parameter(self) -> Option<&'static str> {
        match self {
            ActionType::Compress => Some("compression_profile"),
            ActionType::Move => Some("destination_tier"),
            ActionType::Custom => Some("custom_operation"),
            ActionType::MarkReadOnly | ActionType::Drop => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action-specific parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_degree: Option<u32>,
    pub rebuild_secondary_structures: bool,
    pub refresh_statistics: bool,
    /// Operation name handed to the driver for `custom` actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_operation: Option<String>,
}

impl ActionParameters {
    /// Whether the named parameter is set to a non-empty value.
    pub fn has(&self, parameter: &str) -> bool {
        let value = match parameter {
            "compression_profile" => self.compression_profile.as_deref(),
            "destination_tier" => self.destination_tier.as_deref(),
            "custom_operation" => self.custom_operation.as_deref(),
            _ => None,
        };
        value.is_some_and(|v| !v.trim().is_empty())
    }
}

/// A condition a target must meet for a policy to apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    AgeDays { min_days: u32 },
    AgeMonths { min_months: u32 },
    SizeAtLeast { min_bytes: u64 },
    /// Target must be at least as cold as `class`
    Temperature { class: Temperature },
    Custom { predicate: Predicate },
}

/// Everything an operator specifies when registering or updating a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub selector: TargetSelector,
    pub category: PolicyCategory,
    pub action: ActionType,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub parameters: ActionParameters,
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A registered policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    #[serde(flatten)]
    pub definition: PolicyDefinition,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_by: String,
    pub modified_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(definition: PolicyDefinition, actor: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: PolicyId::new(),
            definition,
            created_by: actor.to_string(),
            created_at: now,
            modified_by: actor.to_string(),
            modified_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn priority(&self) -> u32 {
        self.definition.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.definition.enabled
    }

    pub fn action(&self) -> ActionType {
        self.definition.action
    }

    pub fn parameters(&self) -> &ActionParameters {
        &self.definition.parameters
    }

    /// Ordering used wherever policies are processed in turn.
    pub fn sort_key(&self) -> (u32, DateTime<Utc>, &str) {
        (self.priority(), self.created_at, self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyChange {
    Registered,
    Updated,
    Enabled,
    Disabled,
}

impl PolicyChange {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyChange::Registered => "registered",
            PolicyChange::Updated => "updated",
            PolicyChange::Enabled => "enabled",
            PolicyChange::Disabled => "disabled",
        }
    }
}

/// One entry of a policy's change history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAuditRecord {
    pub policy_id: PolicyId,
    pub change: PolicyChange,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Definition as it stood after the change
    pub snapshot: PolicyDefinition,
}

impl PolicyAuditRecord {
    pub fn for_policy(policy: &Policy, change: PolicyChange) -> Self {
        Self {
            policy_id: policy.id,
            change,
            actor: policy.modified_by.clone(),
            at: policy.modified_at,
            snapshot: policy.definition.clone(),
        }
    }
}
