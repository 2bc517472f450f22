//! Managed storage objects.
//!
//! A target is a table or one of its partitions, identified by owner, name
//! and an optional sub-object. Targets carry the state lifecycle actions
//! change: storage tier, compression profile and the read-only flag.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{ActionParameters, ActionType};

/// Compression profile of an uncompressed target.
pub const NO_COMPRESSION: &str = "NONE";

/// Stable identifier of a target: `owner.name` or `owner.name.subobject`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(owner: &str, name: &str, subobject: Option<&str>) -> Self {
        match subobject {
            Some(sub) => Self(format!("{owner}.{name}.{sub}")),
            None => Self(format!("{owner}.{name}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owner (namespace) component of the identifier.
    pub fn owner(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_profile() -> String {
    NO_COMPRESSION.to_string()
}

fn default_tier() -> String {
    "standard".to_string()
}

/// A managed storage object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetObject {
    pub owner: String,
    pub name: String,
    /// Partition or other sub-object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subobject: Option<String>,
    pub size_bytes: u64,
    /// Creation time, or the upper time boundary for time-partitioned data
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_profile")]
    pub compression_profile: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl TargetObject {
    pub fn id(&self) -> TargetId {
        TargetId::new(&self.owner, &self.name, self.subobject.as_deref())
    }

    /// `name` or `name.subobject`, the string object patterns match against.
    pub fn object_path(&self) -> String {
        match &self.subobject {
            Some(sub) => format!("{}.{sub}", self.name),
            None => self.name.clone(),
        }
    }

    /// Whole days since creation, never negative.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Whole calendar months since creation. A month counts once the
    /// day-of-month of creation has been reached.
    pub fn age_months(&self, now: DateTime<Utc>) -> i64 {
        if now <= self.created_at {
            return 0;
        }
        let created = self.created_at;
        let mut months = i64::from(now.year() - created.year()) * 12
            + i64::from(now.month()) - i64::from(created.month());
        if now.day() < created.day() {
            months -= 1;
        }
        months.max(0)
    }

    /// Compact description of the state lifecycle actions change. Two
    /// snapshots of a target with equal signatures need no new action.
    pub fn state_signature(&self) -> String {
        format!(
            "tier={};profile={};read_only={};size={}",
            self.tier, self.compression_profile, self.read_only, self.size_bytes
        )
    }

    pub fn is_compressed(&self) -> bool {
        !self.compression_profile.eq_ignore_ascii_case(NO_COMPRESSION)
    }

    /// Describe why the target is already in the state `action` would
    /// produce, or `None` when the action would change something.
    pub fn already_at_destination(
        &self,
        action: ActionType,
        parameters: &ActionParameters,
    ) -> Option<String> {
        match action {
            ActionType::Compress => parameters
                .compression_profile
                .as_deref()
                .filter(|profile| self.compression_profile.eq_ignore_ascii_case(profile))
                .map(|profile| format!("profile {profile}")),
            ActionType::Move => {
                let tier = parameters.destination_tier.as_deref()?;
                if !self.tier.eq_ignore_ascii_case(tier) {
                    return None;
                }
                match parameters.compression_profile.as_deref() {
                    Some(profile) if !self.compression_profile.eq_ignore_ascii_case(profile) => {
                        None
                    }
                    _ => Some(format!("tier {tier}")),
                }
            }
            ActionType::MarkReadOnly => self.read_only.then(|| "read-only".to_string()),
            ActionType::Drop | ActionType::Custom => None,
        }
    }

    /// Human readable description of the pending state change, used in
    /// eligibility reasons.
    pub fn pending_change(&self, action: ActionType, parameters: &ActionParameters) -> Option<String> {
        match action {
            ActionType::Compress => parameters.compression_profile.as_deref().map(|profile| {
                format!("current profile {} ≠ {profile}", self.compression_profile)
            }),
            ActionType::Move => parameters
                .destination_tier
                .as_deref()
                .map(|tier| format!("current tier {} ≠ {tier}", self.tier)),
            ActionType::MarkReadOnly => Some("target is writable".to_string()),
            ActionType::Drop | ActionType::Custom => None,
        }
    }

    /// Apply the state change of a completed action. `Drop` is handled by
    /// removing the target from the store instead.
    pub fn apply(&mut self, action: ActionType, parameters: &ActionParameters, after_size: u64) {
        match action {
            ActionType::Compress => {
                if let Some(profile) = &parameters.compression_profile {
                    self.compression_profile = profile.clone();
                }
                self.size_bytes = after_size;
            }
            ActionType::Move => {
                if let Some(tier) = &parameters.destination_tier {
                    self.tier = tier.clone();
                }
                if let Some(profile) = &parameters.compression_profile {
                    self.compression_profile = profile.clone();
                }
                self.size_bytes = after_size;
            }
            ActionType::MarkReadOnly => self.read_only = true,
            ActionType::Custom => self.size_bytes = after_size,
            ActionType::Drop => {}
        }
    }
}
